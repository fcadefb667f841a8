//! The per-file follow engine.
//!
//! One cooperative task per tailed file: read to EOF, hand framed lines
//! to the consumer over a bounded queue, then wait on the change
//! watcher. Rotation, truncation, deletion, descriptor release under
//! backpressure, and both stop flavours all route through the same
//! loop, and every exit path drops the file handle and its budget slot.

// Local crates
use crate::tailer::models::{
    Line, SeekLocation, TailConfig, TailError, TailExit, TailerControl,
};
use crate::tailer::platform::{FdSlot, FileIdentity, OpenFileBudget, Platform};
use crate::tailer::reader::LineReader;
use crate::tailer::watch::{ChangeWatcher, FileChange};

// External crates
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval, sleep};
use tracing::{Instrument, instrument};

/// Framed lines buffered between the tailer and its consumer.
pub const LINE_CHANNEL_CAPACITY: usize = 100;

const PIPE_IDLE_SLEEP: Duration = Duration::from_millis(100);
const CREATE_WAIT_SLEEP: Duration = Duration::from_millis(250);
const REOPEN_RETRY_SLEEP: Duration = Duration::from_millis(200);
const NONRETRYABLE_OPEN_ATTEMPTS: usize = 3;
const LINK_CHECK_TICK: Duration = Duration::from_secs(1);
const DELETION_GRACE: Duration = Duration::from_secs(5);

/// Handle to a spawned tailer.
#[derive(Debug)]
pub struct FileTailer {
    lines: mpsc::Receiver<Line>,
    control: TailerControl,
    exit: watch::Receiver<Option<TailExit>>,
    join: JoinHandle<()>,
}

impl FileTailer {
    /// Spawn the tailer task for `path`.
    ///
    /// With `must_exist`, an absent file fails here; otherwise the task
    /// waits for the file to appear. All later I/O failures surface
    /// through the exit report after the line queue closes.
    pub fn open(
        path: &Path,
        config: TailConfig,
        budget: Arc<OpenFileBudget>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, TailError> {
        if config.must_exist && !path.exists() {
            return Err(TailError::MustExist(path.to_path_buf()));
        }

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let control = TailerControl::new();
        let reader = LineReader::new(config.max_line_size, config.is_utf16);
        let fd_rx = control.fd().subscribe();

        let task = TailerTask {
            path: path.to_path_buf(),
            rate: RateWindow::new(config.rate_limit),
            config,
            budget,
            platform,
            tx,
            control: control.clone(),
            fd_rx,
            reader,
            file: None,
            slot: None,
            identity: None,
            nlink_zero_since: None,
        };

        let join = tokio::spawn(task.run(exit_tx).instrument(tracing::Span::current()));

        Ok(Self {
            lines: rx,
            control,
            exit: exit_rx,
            join,
        })
    }

    pub fn control(&self) -> TailerControl {
        self.control.clone()
    }

    /// Set once, just before the line queue closes.
    pub fn exit_status(&self) -> watch::Receiver<Option<TailExit>> {
        self.exit.clone()
    }

    /// Split into the pieces the consumer wiring needs.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<Line>,
        TailerControl,
        watch::Receiver<Option<TailExit>>,
        JoinHandle<()>,
    ) {
        (self.lines, self.control, self.exit, self.join)
    }

    #[cfg(test)]
    pub(crate) fn lines_mut(&mut self) -> &mut mpsc::Receiver<Line> {
        &mut self.lines
    }
}

struct TailerTask {
    path: PathBuf,
    config: TailConfig,
    budget: Arc<OpenFileBudget>,
    platform: Arc<dyn Platform>,
    tx: mpsc::Sender<Line>,
    control: TailerControl,
    fd_rx: watch::Receiver<bool>,
    reader: LineReader,
    file: Option<File>,
    slot: Option<FdSlot>,
    identity: Option<FileIdentity>,
    nlink_zero_since: Option<Instant>,
    rate: RateWindow,
}

impl TailerTask {
    #[instrument(
        name = "logfile_tailer",
        target = "tailer::tailer",
        skip_all,
        level = "trace"
    )]
    async fn run(mut self, exit_tx: watch::Sender<Option<TailExit>>) {
        let exit = match self.drive().await {
            Ok(exit) | Err(exit) => exit,
        };

        // Handle and budget slot go back on every path.
        self.file = None;
        self.slot = None;

        tracing::debug!(
            path = %self.path.display(),
            outcome = ?exit,
            "Tailer stopped"
        );
        let _ = exit_tx.send(Some(exit));
        // Dropping self.tx closes the line queue.
    }

    async fn drive(&mut self) -> Result<TailExit, TailExit> {
        self.open_initial().await?;

        let mut watcher = (!self.config.pipe)
            .then(|| ChangeWatcher::new(&self.path, self.identity, self.config.poll));
        let mut link_tick = interval(LINK_CHECK_TICK);
        let mut buf = vec![0u8; self.reader.chunk_size()];

        loop {
            if self.control.is_stopped() {
                return Ok(TailExit::Stopped);
            }

            // Backpressure gate asked us to give the descriptor back.
            if *self.fd_rx.borrow() {
                self.release_handle();
                self.wait_for_reopen().await?;
            }
            if self.file.is_none() {
                self.reopen_at(self.reader.position()).await?;
                if let Some(w) = &mut watcher {
                    *w = ChangeWatcher::new(&self.path, self.identity, self.config.poll);
                }
            }

            if buf.len() != self.reader.chunk_size() {
                buf = vec![0u8; self.reader.chunk_size()];
            }

            let n = match self.file.as_mut() {
                Some(file) => file
                    .read(&mut buf)
                    .await
                    .map_err(|e| TailExit::Fatal(format!("read {}: {e}", self.path.display())))?,
                None => 0,
            };

            if n > 0 {
                let lines = self.reader.feed(&buf[..n]);
                let count = lines.len() as u32;
                for line in lines {
                    self.send_line(line).await?;
                }
                self.rate.pace(count).await;
                continue;
            }

            // EOF. Catch a truncation the watcher may have missed.
            if !self.config.pipe {
                if let Some(file) = &self.file {
                    if let Ok(meta) = file.metadata().await {
                        if meta.len() < self.reader.position() {
                            tracing::info!(
                                path = %self.path.display(),
                                old_position = self.reader.position(),
                                new_size = meta.len(),
                                "File truncated, restarting from offset zero"
                            );
                            self.reader.reset_for_truncation();
                            self.reopen_at(0).await?;
                            if let Some(w) = &mut watcher {
                                *w = ChangeWatcher::new(
                                    &self.path,
                                    self.identity,
                                    self.config.poll,
                                );
                            }
                            continue;
                        }
                    }
                }
            }

            if self.control.is_eof_stop() || !self.config.follow {
                if let Some(line) = self.reader.drain() {
                    self.send_line(line).await?;
                }
                return Ok(TailExit::Completed);
            }

            if self.config.pipe {
                self.sleep_cancellable(PIPE_IDLE_SLEEP).await?;
                continue;
            }

            let Some(w) = watcher.as_mut() else { continue };
            tokio::select! {
                change = w.next(self.reader.position()) => match change {
                    FileChange::Modified => {}
                    FileChange::Truncated => {
                        tracing::info!(
                            path = %self.path.display(),
                            "File truncated, restarting from offset zero"
                        );
                        self.reader.reset_for_truncation();
                        self.reopen_at(0).await?;
                        *w = ChangeWatcher::new(&self.path, self.identity, self.config.poll);
                    }
                    FileChange::Deleted { new_path } => {
                        if let Some(renamed) = &new_path {
                            tracing::debug!(
                                path = %self.path.display(),
                                renamed_to = %renamed.display(),
                                "Tailed file was rotated away"
                            );
                        }
                        self.final_drain().await?;
                        if self.config.reopen {
                            self.reopen_by_name().await?;
                            self.reader.seek(0);
                            *w = ChangeWatcher::new(&self.path, self.identity, self.config.poll);
                        } else {
                            tracing::debug!(
                                path = %self.path.display(),
                                "File deleted, not reopening"
                            );
                            return Ok(TailExit::DeletedNotReopening);
                        }
                    }
                },
                _ = link_tick.tick() => {
                    self.check_links().await?;
                }
                _ = self.fd_rx.changed() => {}
                _ = self.control.eof_stop_token().cancelled() => {}
                _ = self.control.cancel_token().cancelled() => {
                    return Ok(TailExit::Stopped);
                }
            }
        }
    }

    fn release_handle(&mut self) {
        if self.file.is_some() {
            tracing::info!(
                path = %self.path.display(),
                position = self.reader.position(),
                "Releasing file handle under backpressure"
            );
            self.file = None;
            self.slot = None;
        }
    }

    async fn wait_for_reopen(&mut self) -> Result<(), TailExit> {
        while *self.fd_rx.borrow() {
            tokio::select! {
                _ = self.fd_rx.changed() => {}
                _ = self.control.cancel_token().cancelled() => {
                    return Err(TailExit::Stopped);
                }
            }
        }
        Ok(())
    }

    /// Open the configured path and seek. Returns the resulting raw
    /// position.
    async fn try_open(&mut self, location: SeekLocation) -> Result<u64, TailError> {
        let slot = self
            .budget
            .acquire()
            .ok_or_else(|| TailError::Budget(self.path.clone()))?;

        let mut file = File::open(&self.path).await.map_err(|source| TailError::Open {
            path: self.path.clone(),
            source,
        })?;

        if self.config.pipe {
            self.identity = None;
            self.file = Some(file);
            self.slot = Some(slot);
            return Ok(0);
        }

        let meta = file.metadata().await?;
        let pos = match location {
            SeekLocation::Start => 0,
            SeekLocation::End => meta.len(),
            SeekLocation::Absolute(n) => n.min(meta.len()),
        };
        file.seek(SeekFrom::Start(pos)).await?;

        self.identity = Some(FileIdentity::of(&meta));
        self.file = Some(file);
        self.slot = Some(slot);
        Ok(pos)
    }

    async fn open_initial(&mut self) -> Result<(), TailExit> {
        let mut attempts = 0usize;
        loop {
            match self.try_open(self.config.location).await {
                Ok(pos) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        position = pos,
                        "Opened file for tailing"
                    );
                    self.reader.seek(pos);
                    return Ok(());
                }
                Err(TailError::Budget(_)) => {
                    self.sleep_cancellable(REOPEN_RETRY_SLEEP).await?;
                }
                Err(TailError::Open { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    if self.config.must_exist {
                        return Err(TailExit::Fatal(
                            TailError::MustExist(self.path.clone()).to_string(),
                        ));
                    }
                    self.sleep_cancellable(jittered(CREATE_WAIT_SLEEP)).await?;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= NONRETRYABLE_OPEN_ATTEMPTS {
                        return Err(TailExit::Fatal(e.to_string()));
                    }
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        attempt = attempts,
                        "Open failed, retrying"
                    );
                    self.sleep_cancellable(jittered(REOPEN_RETRY_SLEEP)).await?;
                }
            }
        }
    }

    /// Reopen the configured name and resume at `pos` (gate reopen,
    /// truncation restart).
    async fn reopen_at(&mut self, pos: u64) -> Result<(), TailExit> {
        self.file = None;
        self.slot = None;
        let mut attempts = 0usize;
        loop {
            match self.try_open(SeekLocation::Absolute(pos)).await {
                Ok(actual) => {
                    if actual != self.reader.position() {
                        self.reader.seek(actual);
                    }
                    return Ok(());
                }
                Err(TailError::Budget(_)) => {
                    self.sleep_cancellable(REOPEN_RETRY_SLEEP).await?;
                }
                // Not-found retries until cancelled: rotation may take a
                // moment to put a fresh file in place.
                Err(TailError::Open { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    self.sleep_cancellable(jittered(REOPEN_RETRY_SLEEP)).await?;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= NONRETRYABLE_OPEN_ATTEMPTS {
                        return Err(TailExit::Fatal(
                            TailError::ReopenExhausted {
                                path: self.path.clone(),
                                attempts,
                                source: std::io::Error::other(e.to_string()),
                            }
                            .to_string(),
                        ));
                    }
                    self.sleep_cancellable(jittered(REOPEN_RETRY_SLEEP)).await?;
                }
            }
        }
    }

    /// Deleted-or-moved with `reopen`: pick up the fresh file bearing
    /// the configured name.
    async fn reopen_by_name(&mut self) -> Result<(), TailExit> {
        self.file = None;
        self.slot = None;
        self.reopen_at(0).await
    }

    /// The unlinked descriptor stays readable; flush everything that is
    /// still in the file plus the partial line in the framing buffer.
    async fn final_drain(&mut self) -> Result<(), TailExit> {
        if let Some(mut file) = self.file.take() {
            let mut buf = vec![0u8; self.reader.chunk_size()];
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| TailExit::Fatal(format!("drain {}: {e}", self.path.display())))?;
                if n == 0 {
                    break;
                }
                let lines = self.reader.feed(&buf[..n]);
                for line in lines {
                    self.send_line(line).await?;
                }
            }
            drop(file);
            self.slot.take();
        }
        if let Some(line) = self.reader.drain() {
            self.send_line(line).await?;
        }
        Ok(())
    }

    /// Escalate when the file has no remaining directory entry and we
    /// still have not finished with it after the grace period.
    async fn check_links(&mut self) -> Result<(), TailExit> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let Ok(meta) = file.metadata().await else {
            return Ok(());
        };

        if self.platform.hard_link_count(&meta) == 0 {
            let since = *self.nlink_zero_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= DELETION_GRACE {
                let err = TailError::DeletedNotDrained(self.path.clone());
                tracing::error!(path = %self.path.display(), "{err}");
                return Err(TailExit::Fatal(err.to_string()));
            }
        } else {
            self.nlink_zero_since = None;
        }
        Ok(())
    }

    /// Deliver one line, honouring stop and descriptor-release requests
    /// while the queue is full. In stop-at-EOF mode the send proceeds
    /// unconditionally so the trailing event is never lost.
    async fn send_line(&mut self, line: Line) -> Result<(), TailExit> {
        let mut line = Some(line);
        loop {
            if *self.fd_rx.borrow() {
                self.release_handle();
            }
            tokio::select! {
                permit = self.tx.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            if let Some(line) = line.take() {
                                permit.send(line);
                            }
                            Ok(())
                        }
                        // Consumer went away; nothing left to deliver to.
                        Err(_) => Err(TailExit::Stopped),
                    };
                }
                _ = self.fd_rx.changed() => {}
                _ = self.control.cancel_token().cancelled(),
                    if !self.control.is_eof_stop() =>
                {
                    return Err(TailExit::Stopped);
                }
            }
        }
    }

    async fn sleep_cancellable(&self, duration: Duration) -> Result<(), TailExit> {
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = self.control.cancel_token().cancelled() => Err(TailExit::Stopped),
        }
    }
}

fn jittered(base: Duration) -> Duration {
    base + Duration::from_millis(rand::random::<u64>() % 100)
}

/// Lines-per-second throttle; sleeps out the rest of the window once
/// the budget for it is spent.
#[derive(Debug)]
struct RateWindow {
    limit: Option<NonZeroU32>,
    window: Instant,
    sent: u32,
}

impl RateWindow {
    fn new(limit: Option<NonZeroU32>) -> Self {
        Self {
            limit,
            window: Instant::now(),
            sent: 0,
        }
    }

    async fn pace(&mut self, lines: u32) {
        let Some(limit) = self.limit else { return };
        self.sent = self.sent.saturating_add(lines);

        let elapsed = self.window.elapsed();
        if self.sent >= limit.get() {
            if elapsed < Duration::from_secs(1) {
                sleep(Duration::from_secs(1) - elapsed).await;
            }
            self.window = Instant::now();
            self.sent = 0;
        } else if elapsed >= Duration::from_secs(1) {
            self.window = Instant::now();
            self.sent = 0;
        }
    }
}
