//! Error types for the Job Queue Service client.

use thiserror::Error;

/// Result type for Job Queue Service operations.
pub type Result<T> = std::result::Result<T, JobQueueError>;

/// Job Queue Service client errors.
#[derive(Debug, Error)]
pub enum JobQueueError {
    /// Network error (connection refused, timeout, broken body)
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Non-2xx response without a structured rejection
    #[error("service returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The service answered `success: false`
    #[error("service rejected request: {}", .errors.join("; "))]
    Rejected { errors: Vec<String> },

    /// Response body did not match the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for JobQueueError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}

impl JobQueueError {
    pub(crate) fn rejected(errors: Vec<String>) -> Self {
        let errors = if errors.is_empty() {
            vec!["request rejected without a reason".to_string()]
        } else {
            errors
        };
        Self::Rejected { errors }
    }

    /// True for network-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// True when the service reports the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 404,
            Self::Rejected { errors } => errors.iter().any(|e| mentions_not_found(e)),
            _ => false,
        }
    }
}

pub(crate) fn mentions_not_found(message: &str) -> bool {
    message.to_ascii_lowercase().contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display_joins_errors() {
        let err = JobQueueError::rejected(vec!["url is required".into(), "maxDepth too big".into()]);
        assert_eq!(
            err.to_string(),
            "service rejected request: url is required; maxDepth too big"
        );
    }

    #[test]
    fn test_empty_rejection_gets_a_reason() {
        let err = JobQueueError::rejected(vec![]);
        assert!(matches!(err, JobQueueError::Rejected { ref errors } if errors.len() == 1));
    }

    #[test]
    fn test_transport_wraps_any_io_failure() {
        let err = JobQueueError::Transport(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )));
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "transport error: connection refused");
    }

    #[test]
    fn test_not_found_detection() {
        assert!(JobQueueError::Api { status: 404, message: String::new() }.is_not_found());
        assert!(JobQueueError::rejected(vec!["Job Not Found".into()]).is_not_found());
        assert!(!JobQueueError::Api { status: 500, message: "boom".into() }.is_not_found());
        assert!(!JobQueueError::Decode("x".into()).is_not_found());
    }
}
