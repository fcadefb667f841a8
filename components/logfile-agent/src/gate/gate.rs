//! FD-release backpressure.
//!
//! Events pass through a capacity-one channel into a sender task that
//! awaits the sink. When the channel is full, a short timer runs; on
//! expiry the gate asks the tailer to release its file descriptor and
//! keeps waiting for capacity. The event is never dropped. Once it is
//! accepted, a gate that closed the handle asks for the reopen.

// Local crates
use crate::source::events::{LogRecord, OutputFn};
use crate::tailer::models::TailerControl;

// External crates
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// How long the sink may stall before the file handle is released.
pub const GATE_CLOSE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct BackpressureGate {
    tx: mpsc::Sender<LogRecord>,
    control: TailerControl,
    closed_by_gate: bool,
    join: JoinHandle<()>,
}

impl BackpressureGate {
    pub fn spawn(output: OutputFn, control: TailerControl) -> Self {
        let (tx, mut rx) = mpsc::channel::<LogRecord>(1);
        let join = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                output(Some(record)).await;
            }
        });

        Self {
            tx,
            control,
            closed_by_gate: false,
            join,
        }
    }

    /// Hand one event to the sender task, releasing the descriptor if
    /// the sink stalls longer than [`GATE_CLOSE_DELAY`].
    pub async fn offer(&mut self, record: LogRecord) {
        let mut record = match self.tx.try_send(record) {
            Ok(()) => {
                self.maybe_reopen();
                return;
            }
            Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(record)) => Some(record),
        };

        let timer = sleep(GATE_CLOSE_DELAY);
        tokio::pin!(timer);

        loop {
            let mut reopen = false;
            let done = tokio::select! {
                permit = self.tx.reserve() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(record) = record.take() {
                                permit.send(record);
                            }
                            reopen = true;
                        }
                        Err(_) => {}
                    }
                    true
                }
                _ = &mut timer, if !self.closed_by_gate => {
                    tracing::warn!(
                        "Sink stalled past the grace timer, releasing file descriptor"
                    );
                    self.control.close_file();
                    self.closed_by_gate = true;
                    false
                }
            };
            if reopen {
                self.maybe_reopen();
            }
            if done {
                return;
            }
        }
    }

    fn maybe_reopen(&mut self) {
        if self.closed_by_gate {
            self.closed_by_gate = false;
            self.control.reopen_file();
        }
    }

    /// Close the intake and wait for the sender task to drain.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}
