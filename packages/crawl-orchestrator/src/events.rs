//! Orchestration events.
//!
//! Background work (polling, linking) never returns errors to a caller, so
//! everything it observes is published here instead.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss events
//! - **In-memory only**: events are not persisted
//! - **No replay**: lagged receivers get `RecvError::Lagged`

use jobqueue_client::{Batch, JobKind};
use tokio::sync::broadcast;

use crate::state::{JobOutcome, JobState};

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Facts about tracked jobs and batches.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// A poll changed a job's state or progress.
    JobUpdated {
        job_id: String,
        kind: JobKind,
        state: JobState,
    },

    /// A job reached `completed` or `failed`; its poller has stopped.
    JobFinished { job_id: String, outcome: JobOutcome },

    /// A job was cancelled by the user and is no longer tracked.
    JobRemoved { job_id: String },

    /// A poll failed; the poller keeps its schedule.
    PollFailed {
        id: String,
        consecutive_failures: u32,
        error: String,
    },

    /// An authoritative batch list was applied.
    BatchesRefreshed { batches: Vec<Batch> },

    /// A batch was linked into a corpus.
    CorpusLinked { batch_id: String, corpus_id: String },

    /// A link attempt failed; it will not be retried automatically.
    CorpusLinkFailed { batch_id: String, error: String },
}

/// Broadcast channel for [`OrchestratorEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(OrchestratorEvent::JobRemoved { job_id: "a".into() });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(OrchestratorEvent::CorpusLinked {
            batch_id: "b1".into(),
            corpus_id: "c1".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            OrchestratorEvent::CorpusLinked { batch_id: "b1".into(), corpus_id: "c1".into() }
        );
    }
}
