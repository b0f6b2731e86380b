//! Crawl Job Orchestration
//!
//! Submits crawl and scrape work to the Job Queue Service, polls job and
//! batch state until it settles, and links completed batches into a corpus
//! exactly once.
//!
//! # Design
//!
//! - The service owns job state; the orchestrator only applies what it reports
//! - Job state only moves forward; stale or out-of-order polls are ignored
//! - Every poller is a cancellable task; cancel takes effect immediately
//! - Background work never fails the caller; it logs and emits events
//!
//! # Usage
//!
//! ```rust,ignore
//! use crawl_orchestrator::{DiveRequest, Orchestrator, OrchestratorConfig};
//!
//! let orchestrator = Orchestrator::from_config(OrchestratorConfig::from_env()?)?;
//!
//! let job_id = orchestrator
//!     .submitter()
//!     .submit_dive(DiveRequest::new("https://example.com").with_max_depth(2))
//!     .await?;
//! let sitemap = orchestrator.tracker().wait_for_result(&job_id).await?;
//! ```
//!
//! # Modules
//!
//! - [`state`] - Forward-only job state machine
//! - [`poller`] - Cancellable per-id polling tasks
//! - [`tracker`] - Dive and preview job tracking
//! - [`batch`] - Mass-scrape batch list and actions
//! - [`corpus`] - At-most-once corpus linking
//! - [`submit`] - Request validation and submission
//! - [`testing`] - In-memory Job Queue Service

pub mod batch;
pub mod config;
pub mod corpus;
pub mod error;
pub mod events;
pub mod poller;
pub mod state;
pub mod submit;
pub mod testing;
pub mod tracker;

pub use batch::{BatchCoordinator, BatchView, PendingAction};
pub use config::OrchestratorConfig;
pub use corpus::CorpusLinker;
pub use error::{OrchestratorError, Result};
pub use events::{EventBus, OrchestratorEvent};
pub use poller::PollerRegistry;
pub use state::{DiveProgress, IgnoreReason, JobOutcome, JobState, JobStateMachine, Transition};
pub use submit::{prepare_batch, validate_dive, BatchDraft, JobSubmitter};
pub use tracker::JobTracker;

pub use jobqueue_client::{
    Batch, BatchProgress, BatchStatus, CorpusLinkRequest, DiveRequest, EngineType, JobKind,
    JobQueueApi, JobQueueClient, JobQueueError, MassScrapeOptions, Sitemap,
};

use std::sync::Arc;

use tokio::sync::broadcast;

/// All orchestration components wired to one service and one event bus.
pub struct Orchestrator {
    events: EventBus,
    tracker: Arc<JobTracker>,
    linker: Arc<CorpusLinker>,
    batches: BatchCoordinator,
    submitter: JobSubmitter,
}

impl Orchestrator {
    /// Connect to the service named in the config.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let client = JobQueueClient::with_timeout(&config.job_queue_url, config.request_timeout)?;
        Ok(Self::new(Arc::new(client), &config))
    }

    pub fn new(api: Arc<dyn JobQueueApi>, config: &OrchestratorConfig) -> Self {
        let events = EventBus::new();
        let tracker = Arc::new(JobTracker::new(api.clone(), events.clone(), config));
        let linker = Arc::new(CorpusLinker::new(api.clone(), events.clone(), config));
        let batches = BatchCoordinator::new(api.clone(), linker.clone(), events.clone(), config);
        let submitter = JobSubmitter::new(api, tracker.clone(), linker.clone());

        Self {
            events,
            tracker,
            linker,
            batches,
            submitter,
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn linker(&self) -> &CorpusLinker {
        &self.linker
    }

    pub fn batches(&self) -> &BatchCoordinator {
        &self.batches
    }

    pub fn submitter(&self) -> &JobSubmitter {
        &self.submitter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Stop every poller this orchestrator owns.
    pub fn shutdown(&self) {
        self.batches.shutdown();
        self.tracker.shutdown();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
