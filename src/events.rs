//! Progress events emitted by the dispatcher.
//!
//! A single consumer (the terminal UI or a log writer) is assumed. The
//! channel is bounded: progress events are dropped on overflow, terminal
//! events never are: a slow consumer can cost you a spinner update, not a
//! result.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

use crate::test::{TestId, TestResult};

/// A structured progress event, emitted as it occurs.
#[derive(Debug)]
pub enum Event {
    SupervisorUp {
        supervisor_id: String,
    },
    SupervisorDown {
        supervisor_id: String,
    },
    SupervisorRestarted {
        supervisor_id: String,
    },
    TestStarted {
        test_id: TestId,
        iteration: u32,
        attempt: u32,
        supervisor_id: String,
    },
    /// The attempt did not stick; the item went back into the queue.
    TestRetried {
        test_id: TestId,
        iteration: u32,
        next_attempt: u32,
    },
    /// Terminal per-item event carrying the finalized result.
    TestFinished {
        result: Box<TestResult>,
    },
    /// Terminal per-item event for work abandoned on cancellation.
    Cancelled {
        test_id: TestId,
        iteration: u32,
    },
    /// Terminal run event; the queue is drained and workers have retired.
    RunComplete,
}

impl Event {
    /// Terminal events are never dropped on channel overflow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::TestFinished { .. } | Event::Cancelled { .. } | Event::RunComplete
        )
    }
}

/// Sending half of the event stream. Cheap to clone; one per worker.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Creates a bounded event stream of the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A sink with no consumer; every event vanishes. Useful in tests.
    pub fn disconnected() -> Self {
        let (sink, rx) = Self::channel(1);
        drop(rx);
        sink
    }

    /// Emits an event. Progress events are dropped if the channel is full;
    /// terminal events wait for capacity. A departed consumer is ignored
    /// either way.
    pub async fn emit(&self, event: Event) {
        if event.is_terminal() {
            let _ = self.tx.send(event).await;
        } else if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(?event, "event channel full, dropping progress event");
        }
    }

    /// Number of progress events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestStatus;
    use std::collections::BTreeMap;

    fn finished(name: &str) -> Event {
        let now = chrono::Utc::now();
        Event::TestFinished {
            result: Box::new(TestResult {
                test_id: format!("generic/{name}").parse().unwrap(),
                iteration_index: 1,
                status: TestStatus::Passed,
                started_at: now,
                finished_at: now,
                duration_seconds: 0.0,
                supervisor_id: "sv0".to_string(),
                attempt_index: 1,
                stdout_excerpt: String::new(),
                stderr_excerpt: String::new(),
                artifacts: Vec::new(),
                diagnostics: BTreeMap::new(),
            }),
        }
    }

    #[tokio::test]
    async fn overflow_drops_progress_events_only() {
        let (sink, mut rx) = EventSink::channel(1);

        // Fill the single slot, then overflow with progress events.
        sink.emit(Event::SupervisorUp {
            supervisor_id: "sv0".to_string(),
        })
        .await;
        sink.emit(Event::SupervisorUp {
            supervisor_id: "sv1".to_string(),
        })
        .await;
        assert_eq!(sink.dropped(), 1);

        // A terminal event waits for the consumer instead of dropping.
        let emit = tokio::spawn({
            let sink = sink.clone();
            async move { sink.emit(finished("001")).await }
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::SupervisorUp { .. }));
        emit.await.unwrap();

        let second = rx.recv().await.unwrap();
        assert!(second.is_terminal());
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn disconnected_sink_never_blocks() {
        let sink = EventSink::disconnected();
        sink.emit(finished("002")).await;
        sink.emit(Event::RunComplete).await;
    }
}
