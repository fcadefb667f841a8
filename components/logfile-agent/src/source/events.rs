//! Host-facing contracts.
//!
//! The host wires each [`LogSrc`] to its sink with [`LogSrc::set_output`]
//! and receives [`LogRecord`]s through the callback; `None` signals
//! end-of-source. Acknowledgement travels inside the record as a plain
//! channel sender — an event knows how to acknowledge its own extent
//! and nothing else about the tailer that produced it.

// Local crates
use crate::state::offset::Offset;

// External crates
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type OutputFuture = BoxFuture<'static, ()>;

/// Sink callback supplied by the host. Invoked per event, in file
/// order; a `None` event means the source is finished.
pub type OutputFn = Arc<dyn Fn(Option<LogRecord>) -> OutputFuture + Send + Sync>;

/// Identity a source presents to the sink.
#[derive(Debug, Clone, Default)]
pub struct SourceDescriptors {
    pub group: String,
    pub stream: String,
    pub destination: String,
    pub retention_days: i64,
    pub class: String,
    pub entity: Option<String>,
}

/// One record delivered to the sink.
pub trait LogEvent: Send {
    fn message(&self) -> &str;
    /// `None` when no timestamp could be parsed from the text.
    fn time(&self) -> Option<DateTime<Utc>>;
    /// Acknowledge everything up to this event's ending offset.
    fn done(&self);
}

/// A tailed source as the host sees it.
pub trait LogSrc: Send + Sync {
    fn group(&self) -> &str;
    fn stream(&self) -> &str;
    fn destination(&self) -> &str;
    fn retention_days(&self) -> i64;
    fn class(&self) -> &str;
    fn entity(&self) -> Option<&str>;
    /// Wire the sink and start delivery. One call per source.
    fn set_output(&self, output: OutputFn);
    /// Stop the source immediately.
    fn stop(&self);
}

/// The concrete event type.
#[derive(Debug, Clone)]
pub struct LogRecord {
    message: String,
    time: Option<DateTime<Utc>>,
    offset: Offset,
    ack: mpsc::Sender<Offset>,
    descriptors: Arc<SourceDescriptors>,
}

impl LogRecord {
    pub(crate) fn new(
        message: String,
        time: Option<DateTime<Utc>>,
        offset: Offset,
        ack: mpsc::Sender<Offset>,
        descriptors: Arc<SourceDescriptors>,
    ) -> Self {
        Self {
            message,
            time,
            offset,
            ack,
            descriptors,
        }
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn group(&self) -> &str {
        &self.descriptors.group
    }

    pub fn stream(&self) -> &str {
        &self.descriptors.stream
    }

    pub fn destination(&self) -> &str {
        &self.descriptors.destination
    }

    pub fn retention_days(&self) -> i64 {
        self.descriptors.retention_days
    }

    pub fn class(&self) -> &str {
        &self.descriptors.class
    }

    pub fn entity(&self) -> Option<&str> {
        self.descriptors.entity.as_deref()
    }
}

impl LogEvent for LogRecord {
    fn message(&self) -> &str {
        &self.message
    }

    fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    /// Non-blocking; a full acknowledgement queue just means a re-read
    /// after the next restart.
    fn done(&self) {
        let _ = self.ack.try_send(self.offset);
    }
}
