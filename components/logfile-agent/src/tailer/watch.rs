//! Change detection for a tailed file.
//!
//! The watcher owns a `notify` subscription on the file's parent
//! directory plus a metadata tick that backstops missed events. In
//! poll mode the subscription is skipped and the tick does all the
//! work. Classification is always by fresh stat against the tailer's
//! read position and the open-time identity, so a burst of coalesced
//! events cannot mislead it.

// Local crates
use crate::tailer::platform::FileIdentity;

// External crates
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::{Duration, Interval, interval};

const NOTIFY_BACKSTOP_TICK: Duration = Duration::from_secs(1);
const POLL_TICK: Duration = Duration::from_millis(250);

/// What happened to the file since the last read reached EOF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// New bytes are available.
    Modified,
    /// The file shrank below the read position; reread from zero.
    Truncated,
    /// The path no longer names the file that was opened. When a rename
    /// carried both names, `new_path` is where the content went.
    Deleted { new_path: Option<PathBuf> },
}

pub struct ChangeWatcher {
    path: PathBuf,
    identity: Option<FileIdentity>,
    events: Option<mpsc::Receiver<Event>>,
    // Dropping the watcher tears down the OS subscription.
    _watcher: Option<RecommendedWatcher>,
    tick: Interval,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("path", &self.path)
            .field("polling", &self.events.is_none())
            .finish_non_exhaustive()
    }
}

impl ChangeWatcher {
    /// Watch `path` for appends, truncation, deletion, and moves.
    ///
    /// A failed `notify` subscription degrades to pure polling rather
    /// than failing the tailer.
    pub fn new(path: &Path, identity: Option<FileIdentity>, poll: bool) -> Self {
        let (events, watcher) = if poll {
            (None, None)
        } else {
            match Self::subscribe(path) {
                Ok((rx, w)) => (Some(rx), Some(w)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Change notifications unavailable, falling back to polling"
                    );
                    (None, None)
                }
            }
        };

        let cadence = if events.is_some() {
            NOTIFY_BACKSTOP_TICK
        } else {
            POLL_TICK
        };

        Self {
            path: path.to_path_buf(),
            identity,
            events,
            _watcher: watcher,
            tick: interval(cadence),
        }
    }

    fn subscribe(path: &Path) -> notify::Result<(mpsc::Receiver<Event>, RecommendedWatcher)> {
        let (tx, rx) = mpsc::channel(100);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => {
                    tracing::error!("File watcher error callback: {e}");
                }
            },
            notify::Config::default(),
        )?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
        Ok((rx, watcher))
    }

    /// The name currently holding the watched content; follows renames.
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next actionable change relative to `read_pos`.
    pub async fn next(&mut self, read_pos: u64) -> FileChange {
        enum Wake {
            Event(Option<Event>),
            Tick,
        }

        loop {
            let wake = {
                let Self { events, tick, .. } = self;
                match events.as_mut() {
                    Some(rx) => tokio::select! {
                        maybe = rx.recv() => Wake::Event(maybe),
                        _ = tick.tick() => Wake::Tick,
                    },
                    None => {
                        tick.tick().await;
                        Wake::Tick
                    }
                }
            };

            match wake {
                Wake::Event(Some(event)) => {
                    if let Some(change) = self.handle_event(event, read_pos) {
                        return change;
                    }
                }
                Wake::Event(None) => {
                    // Watcher thread died; degrade to polling.
                    self.events = None;
                    self.tick = interval(POLL_TICK);
                }
                Wake::Tick => {
                    if let Some(change) = self.classify(read_pos) {
                        return change;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event, read_pos: u64) -> Option<FileChange> {
        // A rename that reports both names tells us where the content
        // moved; adopt the new name so later cleanup can find it.
        if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
            if event.paths.len() == 2 && event.paths[0] == self.path {
                let new_path = event.paths[1].clone();
                tracing::debug!(
                    old_path = %self.path.display(),
                    new_path = %new_path.display(),
                    "Watched file was renamed"
                );
                self.path = new_path.clone();
                return Some(FileChange::Deleted {
                    new_path: Some(new_path),
                });
            }
        }

        if !event.paths.iter().any(|p| p == &self.path) {
            return None;
        }
        self.classify(read_pos)
    }

    /// Stat-based classification; `None` means nothing actionable yet.
    fn classify(&self, read_pos: u64) -> Option<FileChange> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(_) => return Some(FileChange::Deleted { new_path: None }),
        };

        if let Some(open_identity) = self.identity {
            if FileIdentity::of(&meta) != open_identity {
                return Some(FileChange::Deleted { new_path: None });
            }
        }

        let len = meta.len();
        if len < read_pos {
            Some(FileChange::Truncated)
        } else if len > read_pos {
            Some(FileChange::Modified)
        } else {
            None
        }
    }
}
