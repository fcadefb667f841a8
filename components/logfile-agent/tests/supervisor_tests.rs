//! Supervisor lifecycle: validation, discovery bookkeeping,
//! housekeeping, and stop semantics.

mod common;

use common::{Collector, wait_until};
use logfile_agent::config::file_config::FileConfig;
use logfile_agent::source::LogSrc;
use logfile_agent::state::store::state_file_path;
use logfile_agent::supervisor::supervisor::TailerSupervisor;
use logfile_agent::tailer::platform::Platform;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn file_config(pattern: &str) -> FileConfig {
    FileConfig {
        file_path: pattern.to_string(),
        from_beginning: true,
        log_group_name: "g".to_string(),
        log_stream_name: "s".to_string(),
        multi_line_wait_period_ms: 100,
        ..FileConfig::default()
    }
}

/// Recording fake for the platform seam.
#[derive(Debug)]
struct FakePlatform {
    limit: usize,
    link_queries: AtomicUsize,
}

impl Platform for FakePlatform {
    fn hard_link_count(&self, _meta: &std::fs::Metadata) -> u64 {
        self.link_queries.fetch_add(1, Ordering::SeqCst);
        1
    }

    fn open_file_limit(&self) -> usize {
        self.limit
    }
}

#[tokio::test]
async fn invalid_config_is_fatal_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = file_config("/var/log/app.log");
    config.blacklist = Some("(".to_string());

    let mut supervisor = TailerSupervisor::new(vec![config], dir.path().join("state"));
    assert!(supervisor.start().await.is_err());
}

#[tokio::test]
async fn invalid_pattern_is_fatal_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config("/var/log/[");

    let mut supervisor = TailerSupervisor::new(vec![config], dir.path().join("state"));
    assert!(supervisor.start().await.is_err());
}

#[tokio::test]
async fn find_log_src_before_start_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor =
        TailerSupervisor::new(vec![file_config("/tmp/x.log")], dir.path().join("state"));
    assert!(supervisor.find_log_src().is_empty());
}

#[tokio::test]
async fn start_creates_state_dir_and_sweeps_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    fs::create_dir_all(&state_dir).unwrap();

    let orphan = state_file_path(&state_dir, std::path::Path::new("/gone/gone.log"));
    fs::write(&orphan, "42\n/gone/gone.log\n").unwrap();

    let live = dir.path().join("live.log");
    fs::write(&live, b"x").unwrap();
    let kept = state_file_path(&state_dir, &live);
    fs::write(&kept, format!("1\n{}\n", live.display())).unwrap();

    let mut supervisor = TailerSupervisor::new(
        vec![file_config(live.to_str().unwrap())],
        &state_dir,
    );
    supervisor.start().await.unwrap();

    // The housekeeper's first pass runs right after start.
    wait_until("orphan swept", Duration::from_secs(5), || !orphan.exists()).await;
    assert!(kept.exists());

    supervisor.stop();
}

#[tokio::test]
async fn one_source_per_matching_file() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    fs::write(logs.join("a.log"), b"x\n").unwrap();
    fs::write(logs.join("b.log"), b"y\n").unwrap();

    let mut config = file_config(&format!("{}/*.log", logs.display()));
    config.publish_multi_logs = true;

    let mut supervisor = TailerSupervisor::new(vec![config], dir.path().join("state"));
    supervisor.start().await.unwrap();

    let sources = supervisor.find_log_src();
    assert_eq!(sources.len(), 2);
    assert_eq!(supervisor.active_tailers(), 2);

    // A second cycle must not duplicate them.
    assert!(supervisor.find_log_src().is_empty());
    assert_eq!(supervisor.active_tailers(), 2);

    for src in &sources {
        src.stop();
    }
}

#[tokio::test]
async fn descriptors_flow_through_to_sources() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, b"x\n").unwrap();

    let mut config = file_config(log.to_str().unwrap());
    config.destination = "primary".to_string();
    config.retention_in_days = 30;
    config.log_group_class = "STANDARD".to_string();
    config.entity = Some("service:app".to_string());

    let mut supervisor = TailerSupervisor::new(vec![config], dir.path().join("state"));
    supervisor.start().await.unwrap();

    let sources = supervisor.find_log_src();
    assert_eq!(sources.len(), 1);
    let src = &sources[0];
    assert_eq!(src.group(), "g");
    assert_eq!(src.stream(), "s");
    assert_eq!(src.destination(), "primary");
    assert_eq!(src.retention_days(), 30);
    assert_eq!(src.class(), "STANDARD");
    assert_eq!(src.entity(), Some("service:app"));

    src.stop();
}

#[tokio::test]
async fn supervisor_stop_leaves_tailers_running() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, b"before\n").unwrap();

    let platform = Arc::new(FakePlatform {
        limit: 1024,
        link_queries: AtomicUsize::new(0),
    });
    let mut supervisor = TailerSupervisor::with_platform(
        vec![file_config(log.to_str().unwrap())],
        dir.path().join("state"),
        platform,
    );
    supervisor.start().await.unwrap();

    let sources = supervisor.find_log_src();
    let collector = Collector::new();
    sources[0].set_output(collector.output());

    wait_until("first event", Duration::from_secs(5), || {
        collector.messages() == vec!["before"]
    })
    .await;

    supervisor.stop();

    // The tailer keeps delivering after the supervisor is gone.
    let mut f = fs::OpenOptions::new().append(true).open(&log).unwrap();
    f.write_all(b"after\n").unwrap();
    f.flush().unwrap();

    wait_until("post-stop event", Duration::from_secs(5), || {
        collector.messages() == vec!["before", "after"]
    })
    .await;

    sources[0].stop();
    wait_until("source ended", Duration::from_secs(5), || {
        collector.ended()
    })
    .await;
}

#[tokio::test]
async fn stopped_sources_are_reaped_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, b"x\n").unwrap();

    let mut supervisor = TailerSupervisor::new(
        vec![file_config(log.to_str().unwrap())],
        dir.path().join("state"),
    );
    supervisor.start().await.unwrap();

    let sources = supervisor.find_log_src();
    assert_eq!(sources.len(), 1);
    let collector = Collector::new();
    sources[0].set_output(collector.output());

    sources[0].stop();
    wait_until("source ended", Duration::from_secs(5), || {
        collector.ended()
    })
    .await;

    // After the stop round-trips through the reaper, the same path is
    // eligible again.
    wait_until("replacement opened", Duration::from_secs(5), || {
        !supervisor.find_log_src().is_empty()
    })
    .await;
}
