//! Per-file offset persistence.
//!
//! One small state file per tailed source: the acknowledged byte
//! position, a newline, and the absolute source path. Acknowledgements
//! arrive over a bounded channel and are folded to a running maximum;
//! a 100 ms loop rewrites the file whenever that maximum moved.

// Local crates
use crate::metrics::metrics::STATE_FLUSHES;
use crate::state::offset::Offset;

// External crates
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Acknowledgements queued ahead of the flush loop. A full queue drops
/// the acknowledgement; the cost is a re-read after restart, which
/// at-least-once delivery absorbs.
pub const ACK_CHANNEL_CAPACITY: usize = 2000;

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// State-file name derived from the absolute source path: separators,
/// spaces, and drive colons collapse to underscores.
pub fn escape_state_file_name(source: &Path) -> String {
    source
        .to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ' ' | ':' => '_',
            other => other,
        })
        .collect()
}

pub fn state_file_path(state_dir: &Path, source: &Path) -> PathBuf {
    state_dir.join(escape_state_file_name(source))
}

/// Read back a previously saved position. Missing file, unreadable
/// content, or a negative value all mean "no state".
pub fn restore_offset(state_dir: &Path, source: &Path) -> Option<u64> {
    let path = state_file_path(state_dir, source);
    let content = std::fs::read_to_string(&path).ok()?;
    let first = content.lines().next()?;
    match first.trim().parse::<i64>() {
        Ok(value) if value >= 0 => Some(value as u64),
        Ok(value) => {
            tracing::warn!(
                state_file = %path.display(),
                value,
                "Negative offset in state file, treating as no state"
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                state_file = %path.display(),
                error = %e,
                "Unparseable offset in state file, treating as no state"
            );
            None
        }
    }
}

/// The source path recorded on the second line, used by the orphan
/// sweeper.
fn recorded_source(state_file: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(state_file).ok()?;
    content.lines().nth(1).map(PathBuf::from)
}

/// Remove state files whose recorded source no longer exists.
#[instrument(name = "logfile_state_sweep", target = "state::store", skip_all, level = "debug")]
pub async fn sweep_orphans(state_dir: &Path) {
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                state_dir = %state_dir.display(),
                error = %e,
                "Cannot read state directory for housekeeping"
            );
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(source) = recorded_source(&path) else {
            continue;
        };
        if source.exists() {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(
                state_file = %path.display(),
                source = %source.display(),
                "Removed orphaned state file"
            ),
            Err(e) => tracing::warn!(
                state_file = %path.display(),
                error = %e,
                "Failed to remove orphaned state file"
            ),
        }
    }
}

/// Handle to a spawned persistence loop.
#[derive(Debug)]
pub struct OffsetPersister {
    /// Clone into every event; `done()` feeds this.
    pub ack: mpsc::Sender<Offset>,
    /// Trigger when the source file was deleted: removes the state file
    /// and ends the loop.
    pub deleted: CancellationToken,
    pub join: JoinHandle<()>,
}

impl OffsetPersister {
    /// Spawn the per-file flush loop. `cancel` performs a final flush
    /// before exiting; the deletion signal removes the state file
    /// instead.
    pub fn spawn(state_dir: &Path, source: &Path, cancel: CancellationToken) -> Self {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let deleted = CancellationToken::new();

        let loop_state = PersisterLoop {
            state_file: state_file_path(state_dir, source),
            source: source.to_path_buf(),
            rx: ack_rx,
            deleted: deleted.clone(),
            cancel,
        };
        let join = tokio::spawn(loop_state.run());

        Self {
            ack: ack_tx,
            deleted,
            join,
        }
    }
}

struct PersisterLoop {
    state_file: PathBuf,
    source: PathBuf,
    rx: mpsc::Receiver<Offset>,
    deleted: CancellationToken,
    cancel: CancellationToken,
}

impl PersisterLoop {
    #[instrument(
        name = "logfile_offset_persister",
        target = "state::store",
        skip_all,
        level = "trace"
    )]
    async fn run(mut self) {
        let mut best: Option<Offset> = None;
        let mut flushed: Option<Offset> = None;
        let mut tick = interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(offset) => Self::fold(&mut best, offset),
                    None => {
                        // Every sender dropped: flush what we have.
                        self.flush(&mut best, &mut flushed).await;
                        break;
                    }
                },
                _ = tick.tick() => {
                    self.flush(&mut best, &mut flushed).await;
                }
                _ = self.deleted.cancelled() => {
                    self.remove().await;
                    break;
                }
                _ = self.cancel.cancelled() => {
                    // Drain anything already queued, then final flush.
                    while let Ok(offset) = self.rx.try_recv() {
                        Self::fold(&mut best, offset);
                    }
                    self.flush(&mut best, &mut flushed).await;
                    break;
                }
            }
        }

        tracing::trace!(
            state_file = %self.state_file.display(),
            "Offset persister stopped"
        );
    }

    /// An acknowledgement supersedes the running maximum iff it is
    /// lexicographically greater on (seq, position). A stale
    /// pre-truncation position can therefore never clobber a
    /// post-truncation one.
    fn fold(best: &mut Option<Offset>, offset: Offset) {
        if best.map_or(true, |b| offset > b) {
            *best = Some(offset);
        }
    }

    async fn flush(&self, best: &mut Option<Offset>, flushed: &mut Option<Offset>) {
        let Some(target) = *best else { return };
        if *flushed == Some(target) {
            return;
        }

        let content = format!("{}\n{}\n", target.position, self.source.display());
        match tokio::fs::write(&self.state_file, content).await {
            Ok(()) => {
                *flushed = Some(target);
                STATE_FLUSHES.inc();
                tracing::trace!(
                    state_file = %self.state_file.display(),
                    position = target.position,
                    seq = target.seq,
                    "Flushed offset state"
                );
            }
            Err(e) => {
                // Keep the previous flushed value; retry next tick.
                tracing::error!(
                    state_file = %self.state_file.display(),
                    error = %e,
                    "Failed to write state file"
                );
            }
        }
    }

    async fn remove(&self) {
        match tokio::fs::remove_file(&self.state_file).await {
            Ok(()) => tracing::debug!(
                state_file = %self.state_file.display(),
                "Removed state file for deleted source"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                state_file = %self.state_file.display(),
                error = %e,
                "Failed to remove state file"
            ),
        }
    }
}
