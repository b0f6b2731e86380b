//! Typed errors for the orchestration core.
//!
//! One-shot actions (submit, cancel, delete, link) return these to the
//! caller; `Display` is the message shown to the user. Background polling
//! never returns them: it logs and emits events instead.

use jobqueue_client::JobQueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Input rejected locally, before any network call
    #[error("invalid request: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Transport failure or service rejection
    #[error(transparent)]
    Queue(#[from] JobQueueError),

    /// The service no longer knows the tracked entity
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The job reached the `failed` state
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    /// A bounded wait ran out of polls
    #[error("gave up waiting for batch {batch_id} after {polls} polls")]
    WaitTimeout { batch_id: String, polls: u32 },

    /// The one link attempt allowed for this batch failed
    #[error("linking batch {batch_id} to a corpus failed: {message}")]
    LinkFailed { batch_id: String, message: String },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    /// Network-level failure, as opposed to a rejection.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Queue(e) if e.is_transport())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_problem() {
        let err = OrchestratorError::Validation(vec![
            "url is required".into(),
            "maxDepth must be between 1 and 10".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid request: url is required; maxDepth must be between 1 and 10"
        );
    }

    #[test]
    fn test_queue_errors_pass_through_display() {
        let err: OrchestratorError = JobQueueError::Rejected {
            errors: vec!["batch already cancelled".into()],
        }
        .into();
        assert_eq!(err.to_string(), "service rejected request: batch already cancelled");
        assert!(!err.is_transport());
    }
}
