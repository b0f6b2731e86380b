use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::{OrchestratorError, Result};

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Base URL of the Job Queue Service
    pub job_queue_url: String,
    /// Per-request timeout for service calls
    pub request_timeout: Duration,
    /// Interval between progress polls of a dive job
    pub dive_poll_interval: Duration,
    /// Interval between refreshes of the batch list
    pub batch_poll_interval: Duration,
    /// Upper bound on polls while waiting for a batch to settle before linking
    pub corpus_wait_max_polls: u32,
    /// Consecutive poll failures after which failures are logged as errors
    pub poll_failure_warn_threshold: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_queue_url: "http://localhost:3000".to_string(),
            request_timeout: Duration::from_secs(30),
            dive_poll_interval: Duration::from_millis(2000),
            batch_poll_interval: Duration::from_millis(3000),
            corpus_wait_max_polls: 1200,
            poll_failure_warn_threshold: 5,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            job_queue_url: env::var("JOB_QUEUE_URL").unwrap_or(defaults.job_queue_url),
            request_timeout: env_parse::<u64>("JOB_QUEUE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            dive_poll_interval: env_parse::<u64>("DIVE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.dive_poll_interval),
            batch_poll_interval: env_parse::<u64>("BATCH_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_poll_interval),
            corpus_wait_max_polls: env_parse("CORPUS_WAIT_MAX_POLLS")?
                .unwrap_or(defaults.corpus_wait_max_polls),
            poll_failure_warn_threshold: env_parse("POLL_FAILURE_WARN_THRESHOLD")?
                .unwrap_or(defaults.poll_failure_warn_threshold),
        }
        .validated()?)
    }

    pub fn with_job_queue_url(mut self, url: impl Into<String>) -> Self {
        self.job_queue_url = url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_dive_poll_interval(mut self, interval: Duration) -> Self {
        self.dive_poll_interval = interval;
        self
    }

    pub fn with_batch_poll_interval(mut self, interval: Duration) -> Self {
        self.batch_poll_interval = interval;
        self
    }

    pub fn with_corpus_wait_max_polls(mut self, polls: u32) -> Self {
        self.corpus_wait_max_polls = polls;
        self
    }

    pub fn with_poll_failure_warn_threshold(mut self, failures: u32) -> Self {
        self.poll_failure_warn_threshold = failures;
        self
    }

    fn validated(self) -> Result<Self> {
        if self.dive_poll_interval.is_zero() || self.batch_poll_interval.is_zero() {
            return Err(OrchestratorError::Config(
                "poll intervals must be greater than zero".into(),
            ));
        }
        if self.corpus_wait_max_polls == 0 {
            return Err(OrchestratorError::Config(
                "CORPUS_WAIT_MAX_POLLS must be at least 1".into(),
            ));
        }
        Ok(self)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| OrchestratorError::Config(format!("{key} must be a valid number"))),
        Err(_) => Ok(None),
    }
}
