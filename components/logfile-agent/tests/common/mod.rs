//! Shared scaffolding for the scenario tests.

use logfile_agent::source::{LogEvent, LogRecord, OutputFn};
use logfile_agent::state::offset::Offset;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything a delivered event carried, for assertions.
#[derive(Debug, Clone)]
pub struct SeenEvent {
    pub message: String,
    pub offset: Offset,
    pub time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone, Default)]
pub struct Collector {
    events: Arc<Mutex<Vec<SeenEvent>>>,
    ended: Arc<AtomicBool>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink callback that records each event and acknowledges it
    /// immediately, the way a healthy downstream would.
    pub fn output(&self) -> OutputFn {
        let events = Arc::clone(&self.events);
        let ended = Arc::clone(&self.ended);
        Arc::new(move |maybe: Option<LogRecord>| {
            let events = Arc::clone(&events);
            let ended = Arc::clone(&ended);
            Box::pin(async move {
                match maybe {
                    Some(record) => {
                        record.done();
                        events.lock().unwrap().push(SeenEvent {
                            message: record.message().to_string(),
                            offset: record.offset(),
                            time: record.time(),
                        });
                    }
                    None => ended.store(true, Ordering::SeqCst),
                }
            })
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<SeenEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// Poll until `condition` holds or the deadline passes.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, timeout: Duration, mut condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
