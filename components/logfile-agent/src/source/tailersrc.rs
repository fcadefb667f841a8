//! Per-file pipeline wiring.
//!
//! A [`TailerSrc`] binds one tailer to the host's sink: lines come off
//! the tailer's queue, get decoded, assembled into events, filtered,
//! and delivered through the optional backpressure gate. Offsets flow
//! the other way, from `done()` acknowledgements into the per-file
//! offset persister.

// Local crates
use crate::assembler::assembler::{EventAssembler, PendingEvent};
use crate::config::file_config::FileConfig;
use crate::config::filters;
use crate::gate::gate::BackpressureGate;
use crate::metrics::metrics::{DECODE_ERRORS, DROPPED_EVENTS};
use crate::source::events::{LogRecord, LogSrc, OutputFn, SourceDescriptors};
use crate::state::offset::{Offset, OffsetTracker};
use crate::state::store::OffsetPersister;
use crate::tailer::models::{Line, TailExit, TailerControl};
use crate::tailer::platform::{FileIdentity, find_path_by_identity};
use crate::tailer::tailer::FileTailer;

// External crates
use encoding_rs::Encoding;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

/// One tailed file, presented to the host as a [`LogSrc`].
pub struct TailerSrc {
    descriptors: Arc<SourceDescriptors>,
    config: Arc<FileConfig>,
    path: PathBuf,
    identity: FileIdentity,
    control: TailerControl,
    start_position: u64,
    parts: Mutex<Option<ConsumerParts>>,
    ack: mpsc::Sender<Offset>,
    deleted: CancellationToken,
    persister_cancel: CancellationToken,
    cancel: CancellationToken,
    cleanups: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

/// Taken once by `set_output`.
struct ConsumerParts {
    lines: mpsc::Receiver<Line>,
    exit: watch::Receiver<Option<TailExit>>,
}

/// Everything the consumer task needs, cloned out of the source.
struct ConsumerCtx {
    config: Arc<FileConfig>,
    descriptors: Arc<SourceDescriptors>,
    path: PathBuf,
    identity: FileIdentity,
    start_position: u64,
    ack: mpsc::Sender<Offset>,
    deleted: CancellationToken,
    persister_cancel: CancellationToken,
    control: TailerControl,
    cancel: CancellationToken,
    cleanups: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TailerSrc {
    /// Bind a freshly opened tailer to its config. Spawns the offset
    /// persister; the consumer starts when the host wires the sink.
    pub fn new(
        tailer: FileTailer,
        config: Arc<FileConfig>,
        path: PathBuf,
        identity: FileIdentity,
        state_dir: &Path,
        start_position: u64,
    ) -> Self {
        let descriptors = Arc::new(SourceDescriptors {
            group: config.log_group_name.clone(),
            stream: config.log_stream_name.clone(),
            destination: config.destination.clone(),
            retention_days: config.retention_in_days,
            class: config.log_group_class.clone(),
            entity: config.entity.clone(),
        });

        let persister_cancel = CancellationToken::new();
        let persister = OffsetPersister::spawn(state_dir, &path, persister_cancel.clone());
        let (lines, control, exit, _join) = tailer.into_parts();

        Self {
            descriptors,
            config,
            path,
            identity,
            control,
            start_position,
            parts: Mutex::new(Some(ConsumerParts { lines, exit })),
            ack: persister.ack,
            deleted: persister.deleted,
            persister_cancel,
            cancel: CancellationToken::new(),
            cleanups: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn control(&self) -> TailerControl {
        self.control.clone()
    }

    /// Drain the current file, then stop. Used when a rotation makes
    /// this tailer's file the old one.
    pub fn stop_at_eof(&self) {
        self.control.stop_at_eof();
    }

    /// Runs after the consumer loop ends, whatever the exit path.
    pub fn register_cleanup(&self, cleanup: Box<dyn FnOnce() + Send>) {
        lock_ignoring_poison(&self.cleanups).push(cleanup);
    }

    /// Stop without waiting on the sink: cancels the consumer loop
    /// directly, so a wedged downstream cannot hold shutdown hostage.
    /// The end-of-source marker is not delivered on this path.
    pub fn hard_stop(&self) {
        self.control.stop();
        self.cancel.cancel();
    }
}

impl LogSrc for TailerSrc {
    fn group(&self) -> &str {
        &self.descriptors.group
    }

    fn stream(&self) -> &str {
        &self.descriptors.stream
    }

    fn destination(&self) -> &str {
        &self.descriptors.destination
    }

    fn retention_days(&self) -> i64 {
        self.descriptors.retention_days
    }

    fn class(&self) -> &str {
        &self.descriptors.class
    }

    fn entity(&self) -> Option<&str> {
        self.descriptors.entity.as_deref()
    }

    fn set_output(&self, output: OutputFn) {
        let parts = lock_ignoring_poison(&self.parts).take();
        let Some(parts) = parts else {
            tracing::warn!(
                path = %self.path.display(),
                "set_output called more than once, ignoring"
            );
            return;
        };

        let ctx = ConsumerCtx {
            config: Arc::clone(&self.config),
            descriptors: Arc::clone(&self.descriptors),
            path: self.path.clone(),
            identity: self.identity,
            start_position: self.start_position,
            ack: self.ack.clone(),
            deleted: self.deleted.clone(),
            persister_cancel: self.persister_cancel.clone(),
            control: self.control.clone(),
            cancel: self.cancel.clone(),
            cleanups: Arc::clone(&self.cleanups),
        };

        tokio::spawn(consume(parts, ctx, output).instrument(tracing::Span::current()));
    }

    fn stop(&self) {
        self.control.stop();
    }
}

impl std::fmt::Debug for TailerSrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailerSrc")
            .field("path", &self.path)
            .field("group", &self.descriptors.group)
            .field("stream", &self.descriptors.stream)
            .finish_non_exhaustive()
    }
}

/// Decode one framed line. `None` drops the line (logged by the
/// caller); plain UTF-8 is the default when no encoding is configured.
fn decode_line(bytes: &[u8], encoding: Option<&'static Encoding>) -> Option<String> {
    match encoding {
        None => std::str::from_utf8(bytes).ok().map(str::to_owned),
        Some(enc) => {
            let (text, had_errors) = enc.decode_without_bom_handling(bytes);
            if had_errors {
                None
            } else {
                Some(text.into_owned())
            }
        }
    }
}

#[instrument(
    name = "logfile_consumer",
    target = "source::tailersrc",
    skip_all,
    level = "trace"
)]
async fn consume(parts: ConsumerParts, ctx: ConsumerCtx, output: OutputFn) {
    let mut assembler = EventAssembler::new(
        ctx.config.multi_line_start(),
        ctx.config.max_event_size,
        ctx.config.truncate_suffix.clone(),
        ctx.start_position,
    );
    let mut tracker = OffsetTracker::starting_at(ctx.start_position);
    let mut gate = ctx
        .config
        .fd_release_enabled()
        .then(|| BackpressureGate::spawn(Arc::clone(&output), ctx.control.clone()));
    let mut tick = tokio::time::interval(Duration::from_millis(
        ctx.config.multi_line_wait_period_ms.max(1),
    ));
    let mut lines = ReceiverStream::new(parts.lines);
    let exit = parts.exit;

    loop {
        tokio::select! {
            maybe = lines.next() => match maybe {
                Some(line) => match decode_line(&line.text, ctx.config.encoding()) {
                    Some(text) => {
                        if let Some(event) = assembler.add_line(&text, line.end_offset) {
                            emit(event, &mut tracker, &ctx, &mut gate, &output).await;
                        }
                    }
                    None => {
                        DECODE_ERRORS.inc();
                        tracing::warn!(
                            path = %ctx.path.display(),
                            end_offset = line.end_offset,
                            "Dropping line that failed to decode"
                        );
                        assembler.note_offset(line.end_offset);
                    }
                },
                None => {
                    // Tailer finished. The trailing event may block on
                    // the sink; that is the one send allowed to.
                    if let Some(event) = assembler.flush() {
                        emit(event, &mut tracker, &ctx, &mut gate, &output).await;
                    }
                    if let Some(gate) = gate.take() {
                        gate.finish().await;
                    }
                    output(None).await;
                    break;
                }
            },
            _ = tick.tick() => {
                if let Some(event) = assembler.tick() {
                    emit(event, &mut tracker, &ctx, &mut gate, &output).await;
                }
            }
            _ = ctx.cancel.cancelled() => {
                if let Some(gate) = gate.take() {
                    gate.finish().await;
                }
                break;
            }
        }
    }

    finish(&exit, &ctx);
}

async fn emit(
    event: PendingEvent,
    tracker: &mut OffsetTracker,
    ctx: &ConsumerCtx,
    gate: &mut Option<BackpressureGate>,
    output: &OutputFn,
) {
    let offset = tracker.observe(event.end_position);

    if !filters::passes(&ctx.config.filters, &event.message) {
        DROPPED_EVENTS
            .with_label_values(&[
                ctx.descriptors.group.as_str(),
                ctx.descriptors.stream.as_str(),
            ])
            .inc();
        // Acknowledge the extent so a fully filtered file still makes
        // offset progress.
        let _ = ctx.ack.try_send(offset);
        return;
    }

    let time = ctx
        .config
        .timestamp_extractor()
        .and_then(|extractor| extractor.extract(&event.message));

    let record = LogRecord::new(
        event.message,
        time,
        offset,
        ctx.ack.clone(),
        Arc::clone(&ctx.descriptors),
    );

    match gate {
        Some(gate) => gate.offer(record).await,
        None => output(Some(record)).await,
    }
}

fn finish(exit: &watch::Receiver<Option<TailExit>>, ctx: &ConsumerCtx) {
    let outcome = exit.borrow().clone();
    tracing::debug!(
        path = %ctx.path.display(),
        outcome = ?outcome,
        "Source consumer finished"
    );

    match &outcome {
        Some(TailExit::Completed | TailExit::DeletedNotReopening)
            if ctx.config.auto_removal =>
        {
            // The state file stays: a successor tailer on the same
            // configured path owns it now, and the hourly sweep reaps
            // it otherwise.
            remove_fully_read(&ctx.path, ctx.identity);
        }
        Some(TailExit::DeletedNotReopening) => ctx.deleted.cancel(),
        _ => {}
    }

    ctx.persister_cancel.cancel();

    let cleanups = std::mem::take(&mut *lock_ignoring_poison(&ctx.cleanups));
    for cleanup in cleanups {
        cleanup();
    }
}

/// Unlink a file that has been read to the end. The identity check
/// keeps a rotation race from deleting the successor: when the held
/// name now points at a different file, the rotated one is found by
/// identity in the same directory.
fn remove_fully_read(path: &Path, identity: FileIdentity) {
    let target = match FileIdentity::from_path(path) {
        Ok(current) if current == identity => Some(path.to_path_buf()),
        _ => {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            find_path_by_identity(parent, identity)
        }
    };

    match target {
        Some(target) => match std::fs::remove_file(&target) {
            Ok(()) => tracing::info!(
                path = %target.display(),
                "Removed fully read file"
            ),
            Err(e) => tracing::warn!(
                path = %target.display(),
                error = %e,
                "Failed to remove fully read file"
            ),
        },
        None => tracing::debug!(
            path = %path.display(),
            "Fully read file already gone"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_decode_rejects_invalid_sequences() {
        assert_eq!(decode_line(b"plain", None), Some("plain".to_string()));
        assert_eq!(decode_line(&[0xFF, 0xFE, 0x41], None), None);
    }

    #[test]
    fn utf16le_decode() {
        let bytes = [b'a', 0, b'b', 0];
        assert_eq!(
            decode_line(&bytes, Some(encoding_rs::UTF_16LE)),
            Some("ab".to_string())
        );
    }

    #[test]
    fn latin1_decode_never_errors() {
        assert_eq!(
            decode_line(&[0xE9], Some(encoding_rs::WINDOWS_1252)),
            Some("é".to_string())
        );
    }
}
