//! Multi-line event assembly.
//!
//! Purely in-memory and synchronous: the consumer loop feeds decoded
//! lines in and performs the actual emission, so ordering and
//! backpressure stay the caller's business. With no start predicate
//! every line is its own event; with one, consecutive non-start lines
//! fold into the current event until the next start line, the size cap,
//! or the idle flush.

// Local crates
use crate::metrics::metrics::TRUNCATED_EVENTS;

// External crates
use regex::Regex;
use std::sync::Arc;

/// Idle flush ticks before a buffered event is forced out (ticks run at
/// the configured multi-line wait period, one second by default).
pub const FLUSH_IDLE_TICKS: u32 = 5;

/// An assembled event ready for filtering and delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub message: String,
    /// File position just past the event's last byte.
    pub end_position: u64,
}

#[derive(Debug)]
pub struct EventAssembler {
    msg: String,
    msg_end: u64,
    ignoring: bool,
    idle_ticks: u32,
    truncated: bool,
    multi_line_start: Option<Arc<Regex>>,
    max_event_size: usize,
    truncate_suffix: String,
}

impl EventAssembler {
    pub fn new(
        multi_line_start: Option<Arc<Regex>>,
        max_event_size: usize,
        truncate_suffix: String,
        start_position: u64,
    ) -> Self {
        Self {
            msg: String::new(),
            msg_end: start_position,
            ignoring: false,
            idle_ticks: 0,
            truncated: false,
            multi_line_start,
            max_event_size,
            truncate_suffix,
        }
    }

    /// Feed one decoded line; returns the event it completed, if any.
    pub fn add_line(&mut self, text: &str, end_offset: u64) -> Option<PendingEvent> {
        match &self.multi_line_start {
            None => {
                let event = self.take_current();
                self.start_new(text, end_offset);
                event
            }
            Some(start) => {
                if start.is_match(text) || (self.msg.is_empty() && !self.ignoring) {
                    self.ignoring = false;
                    let event = self.take_current();
                    self.start_new(text, end_offset);
                    event
                } else if self.ignoring || self.msg.len() >= self.max_event_size {
                    // Oversized event: swallow continuations until the
                    // next start line.
                    self.ignoring = true;
                    self.msg_end = end_offset;
                    None
                } else {
                    self.msg.push('\n');
                    self.msg.push_str(text);
                    self.msg_end = end_offset;
                    self.idle_ticks = 0;
                    self.enforce_cap();
                    None
                }
            }
        }
    }

    /// Advance past bytes that produced no usable line (decode errors,
    /// swallowed continuations) so their extent is still acknowledged.
    pub fn note_offset(&mut self, end_offset: u64) {
        self.msg_end = end_offset;
    }

    /// One flush-ticker tick. Fires the buffered event after
    /// [`FLUSH_IDLE_TICKS`] ticks with no growth.
    pub fn tick(&mut self) -> Option<PendingEvent> {
        if self.msg.is_empty() {
            return None;
        }
        self.idle_ticks += 1;
        if self.idle_ticks >= FLUSH_IDLE_TICKS {
            self.take_current()
        } else {
            None
        }
    }

    /// Unconditional flush for termination paths.
    pub fn flush(&mut self) -> Option<PendingEvent> {
        self.take_current()
    }

    pub fn position(&self) -> u64 {
        self.msg_end
    }

    fn take_current(&mut self) -> Option<PendingEvent> {
        self.idle_ticks = 0;
        if self.msg.is_empty() {
            return None;
        }
        self.truncated = false;
        Some(PendingEvent {
            message: std::mem::take(&mut self.msg),
            end_position: self.msg_end,
        })
    }

    fn start_new(&mut self, text: &str, end_offset: u64) {
        self.msg.clear();
        self.msg.push_str(text);
        self.msg_end = end_offset;
        self.idle_ticks = 0;
        self.truncated = false;
        self.enforce_cap();
    }

    /// Trim to `max_event_size - len(suffix)` and mark, at most once per
    /// event. Truncation lands on a char boundary.
    fn enforce_cap(&mut self) {
        if self.truncated || self.msg.len() <= self.max_event_size {
            return;
        }
        let mut cut = self.max_event_size - self.truncate_suffix.len();
        while cut > 0 && !self.msg.is_char_boundary(cut) {
            cut -= 1;
        }
        self.msg.truncate(cut);
        self.msg.push_str(&self.truncate_suffix);
        self.truncated = true;
        TRUNCATED_EVENTS.inc();
    }
}
