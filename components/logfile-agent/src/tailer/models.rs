// External crates
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// One framed line as read from the file, still undecoded.
#[derive(Debug, Clone)]
pub struct Line {
    pub text: Bytes,
    /// Wall-clock instant the line was read.
    pub time: DateTime<Utc>,
    /// File position just past this line's terminator (or past its last
    /// byte, for a split or drained partial line).
    pub end_offset: u64,
}

/// Where the first read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekLocation {
    Start,
    #[default]
    End,
    Absolute(u64),
}

/// Options recognized by [`crate::tailer::tailer::FileTailer::open`].
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Keep waiting for data past EOF.
    pub follow: bool,
    /// On deletion or move, reopen the same name and continue.
    pub reopen: bool,
    /// Fail `open` when the file is absent instead of waiting for it.
    pub must_exist: bool,
    /// Named-pipe mode: no seeking, no change watcher.
    pub pipe: bool,
    /// Use the polling change watcher instead of OS notifications.
    pub poll: bool,
    /// Split lines longer than this many bytes; 0 means unbounded.
    pub max_line_size: usize,
    pub location: SeekLocation,
    /// Frame on `\n\0` and strip a leading BOM.
    pub is_utf16: bool,
    /// Cap on lines emitted per second.
    pub rate_limit: Option<NonZeroU32>,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            follow: true,
            reopen: false,
            must_exist: false,
            pipe: false,
            poll: false,
            max_line_size: 0,
            location: SeekLocation::End,
            is_utf16: false,
            rate_limit: None,
        }
    }
}

/// How a tailer task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailExit {
    /// Non-follow read reached EOF, or stop-at-EOF drained the file.
    Completed,
    /// The file went away and `reopen` was off; buffered bytes were
    /// drained first.
    DeletedNotReopening,
    /// Cancelled by the stop signal.
    Stopped,
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("file {} does not exist", .0.display())]
    MustExist(PathBuf),
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("giving up reopening {} after {attempts} attempts: {source}", .path.display())]
    ReopenExhausted {
        path: PathBuf,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("file {} was deleted but its content was not tailed completely", .0.display())]
    DeletedNotDrained(PathBuf),
    #[error("no file handle slots available for {}", .0.display())]
    Budget(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Gate-facing descriptor request: "drop the OS handle" / "take it
/// back". Carried on a `watch` channel so a request made before the
/// tailer starts listening is never lost. The tailer acts on this at
/// its suspension points; the gate never touches the handle itself.
#[derive(Debug)]
pub struct FdRequest {
    tx: watch::Sender<bool>,
}

impl FdRequest {
    pub fn request_release(&self) {
        let _ = self.tx.send(true);
    }

    pub fn request_reopen(&self) {
        let _ = self.tx.send(false);
    }

    pub fn release_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for FdRequest {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }
}

/// Cloneable control surface for one running tailer.
#[derive(Debug, Clone)]
pub struct TailerControl {
    cancel: CancellationToken,
    eof_stop: CancellationToken,
    fd: Arc<FdRequest>,
}

impl TailerControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            eof_stop: CancellationToken::new(),
            fd: Arc::new(FdRequest::default()),
        }
    }

    /// Stop immediately.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Finish reading to the current EOF, then stop.
    pub fn stop_at_eof(&self) {
        self.eof_stop.cancel();
    }

    /// Ask the tailer to release its OS handle (backpressure relief).
    pub fn close_file(&self) {
        self.fd.request_release();
    }

    /// Ask the tailer to reacquire its handle and resume at the last
    /// raw read position.
    pub fn reopen_file(&self) {
        self.fd.request_reopen();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn eof_stop_token(&self) -> &CancellationToken {
        &self.eof_stop
    }

    pub fn fd(&self) -> &Arc<FdRequest> {
        &self.fd
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_eof_stop(&self) -> bool {
        self.eof_stop.is_cancelled()
    }
}

impl Default for TailerControl {
    fn default() -> Self {
        Self::new()
    }
}
