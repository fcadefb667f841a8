//! Plugin entry point.
//!
//! The host calls [`TailerSupervisor::start`] once, then
//! [`TailerSupervisor::find_log_src`] on its own cadence. Each cycle
//! reaps stopped tailers, expands every configured pattern, and opens a
//! source for each fresh target; the host wires the returned sources to
//! its sink. Stopping the supervisor cancels housekeeping only —
//! running tailers are the host's to stop once the sink has drained.

// Local crates
use crate::config::file_config::FileConfig;
use crate::globber::globber::GlobMatcher;
use crate::helpers::shutdown::Shutdown;
use crate::source::tailersrc::TailerSrc;
use crate::state::store;
use crate::supervisor::discovery;
use crate::tailer::models::{SeekLocation, TailConfig};
use crate::tailer::platform::{HostPlatform, OpenFileBudget, Platform};
use crate::tailer::tailer::FileTailer;

// External crates
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};
use tracing::instrument;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);
const STOPPED_CHANNEL_CAPACITY: usize = 100;

const SAMPLE_CONFIG: &str = r#"
state_dir = "/var/lib/logfile-agent/state"

[[files]]
file_path = "/var/log/app/**/*.log"
log_group_name = "app"
log_stream_name = "{hostname}"
from_beginning = true
# Lines starting with whitespace fold into the previous event unless a
# multi_line_start_pattern overrides the default.
timestamp_regex = '\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}'
timestamp_layout = ["%Y-%m-%d %H:%M:%S"]
"#;

const DESCRIPTION: &str =
    "Tails configured log files and forwards assembled events to the agent sink";

type TailerKey = (usize, PathBuf);

/// Owns the set of active tailers, keyed by (config, path).
#[derive(Debug)]
pub struct TailerSupervisor {
    state_dir: PathBuf,
    configs: Vec<Arc<FileConfig>>,
    matchers: Vec<GlobMatcher>,
    tailers: HashMap<TailerKey, Arc<TailerSrc>>,
    stopped_tx: mpsc::Sender<TailerKey>,
    stopped_rx: mpsc::Receiver<TailerKey>,
    budget: Arc<OpenFileBudget>,
    platform: Arc<dyn Platform>,
    shutdown: Shutdown,
    raw_configs: Vec<FileConfig>,
    started: bool,
}

impl TailerSupervisor {
    pub fn new(configs: Vec<FileConfig>, state_dir: impl Into<PathBuf>) -> Self {
        Self::with_platform(configs, state_dir, Arc::new(HostPlatform))
    }

    /// Injection point for tests and unusual hosts.
    pub fn with_platform(
        configs: Vec<FileConfig>,
        state_dir: impl Into<PathBuf>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let (stopped_tx, stopped_rx) = mpsc::channel(STOPPED_CHANNEL_CAPACITY);
        let budget = Arc::new(OpenFileBudget::for_platform(&*platform));

        Self {
            state_dir: state_dir.into(),
            configs: Vec::new(),
            matchers: Vec::new(),
            tailers: HashMap::new(),
            stopped_tx,
            stopped_rx,
            budget,
            platform,
            shutdown: Shutdown::new(),
            raw_configs: configs,
            started: false,
        }
    }

    pub fn sample_config() -> &'static str {
        SAMPLE_CONFIG
    }

    pub fn description() -> &'static str {
        DESCRIPTION
    }

    /// Push-based subsystem; nothing to pull on the metric cadence.
    pub fn gather(&self) -> Result<()> {
        Ok(())
    }

    /// Validate every config, make sure the state directory exists, and
    /// start the hourly state-file housekeeper. Any validation failure
    /// is fatal.
    #[instrument(
        name = "logfile_supervisor_start",
        target = "supervisor::supervisor",
        skip_all,
        level = "debug"
    )]
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            bail!("supervisor already started");
        }

        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .with_context(|| {
                format!("Failed to create state directory {:?}", self.state_dir)
            })?;

        for mut config in std::mem::take(&mut self.raw_configs) {
            config.init()?;
            let matcher = GlobMatcher::compile(&config.file_path)?;
            self.matchers.push(matcher);
            self.configs.push(Arc::new(config));
        }

        let state_dir = self.state_dir.clone();
        let token = self.shutdown.child();
        tokio::spawn(async move {
            let mut tick = interval(HOUSEKEEPING_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => store::sweep_orphans(&state_dir).await,
                    _ = token.cancelled() => break,
                }
            }
            tracing::trace!("State housekeeper stopped");
        });

        self.started = true;
        tracing::info!(
            state_dir = %self.state_dir.display(),
            configs = self.configs.len(),
            open_file_cap = self.budget.cap(),
            "Logfile supervisor started"
        );
        Ok(())
    }

    /// One discovery cycle; returns the sources opened this cycle for
    /// the host to wire up.
    #[instrument(
        name = "logfile_find_log_src",
        target = "supervisor::supervisor",
        skip_all,
        level = "trace"
    )]
    pub fn find_log_src(&mut self) -> Vec<Arc<TailerSrc>> {
        if !self.started {
            return Vec::new();
        }

        self.reap_stopped();

        let mut opened = Vec::new();
        for index in 0..self.configs.len() {
            let config = Arc::clone(&self.configs[index]);
            let targets = discovery::discover(&config, &self.matchers[index], &self.state_dir);

            for target in targets {
                let key: TailerKey = (index, target.path.clone());
                if self.tailers.contains_key(&key) {
                    continue;
                }

                // A fresh target under auto_removal means the active
                // tailers for this config are presumed rotated out:
                // let them drain and go.
                if config.auto_removal {
                    for ((config_index, path), src) in &self.tailers {
                        if *config_index == index {
                            tracing::info!(
                                rotated = %path.display(),
                                successor = %target.path.display(),
                                "Signalling rotated-out tailer to stop at EOF"
                            );
                            src.stop_at_eof();
                        }
                    }
                }

                if self.budget.in_use() >= self.budget.cap() {
                    tracing::warn!(
                        path = %target.path.display(),
                        in_use = self.budget.in_use(),
                        cap = self.budget.cap(),
                        "Open-file budget exhausted, deferring tailer"
                    );
                    continue;
                }

                match self.open_source(&config, &target) {
                    Ok(src) => {
                        let stopped = self.stopped_tx.clone();
                        let reap_key = key.clone();
                        src.register_cleanup(Box::new(move || {
                            let _ = stopped.try_send(reap_key);
                        }));
                        self.tailers.insert(key, Arc::clone(&src));
                        opened.push(src);
                    }
                    Err(e) => {
                        tracing::error!(
                            path = %target.path.display(),
                            error = %e,
                            "Failed to open tailer"
                        );
                    }
                }
            }
        }

        opened
    }

    /// Cancels housekeeping. Deliberately leaves tailers running: the
    /// host stops them once the sink has drained.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        tracing::info!("Logfile supervisor stopped");
    }

    pub fn active_tailers(&self) -> usize {
        self.tailers.len()
    }

    fn reap_stopped(&mut self) {
        while let Ok(key) = self.stopped_rx.try_recv() {
            if self.tailers.remove(&key).is_some() {
                tracing::debug!(
                    path = %key.1.display(),
                    "Reaped stopped tailer"
                );
            }
        }
    }

    fn open_source(
        &self,
        config: &Arc<FileConfig>,
        target: &crate::globber::globber::TargetFile,
    ) -> Result<Arc<TailerSrc>> {
        let restored = store::restore_offset(&self.state_dir, &target.path);

        // A stored offset past the current size means the file was
        // truncated or replaced while the agent was down; start over
        // from zero.
        let start_position = match restored {
            Some(position) if position > target.size => 0,
            Some(position) => position,
            None if config.pipe || config.from_beginning => 0,
            None => target.size,
        };
        let location = if config.pipe {
            SeekLocation::Start
        } else {
            SeekLocation::Absolute(start_position)
        };

        let tail_config = TailConfig {
            follow: true,
            reopen: false,
            must_exist: true,
            pipe: config.pipe,
            poll: false,
            max_line_size: 0,
            location,
            is_utf16: config.is_utf16(),
            rate_limit: None,
        };

        let tailer = FileTailer::open(
            &target.path,
            tail_config,
            Arc::clone(&self.budget),
            Arc::clone(&self.platform),
        )?;

        tracing::info!(
            path = %target.path.display(),
            start_position,
            restored = restored.is_some(),
            group = %config.log_group_name,
            stream = %config.log_stream_name,
            "Opened log source"
        );

        Ok(Arc::new(TailerSrc::new(
            tailer,
            Arc::clone(config),
            target.path.clone(),
            target.identity,
            &self.state_dir,
            start_position,
        )))
    }
}
