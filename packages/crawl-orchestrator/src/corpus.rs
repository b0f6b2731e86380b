//! Linking settled batches into a corpus, at most once per batch.
//!
//! Two entry points share one guard:
//! - [`CorpusLinker::observe`] runs on every batch list refresh and links
//!   each completed batch that asked for a corpus.
//! - [`CorpusLinker::wait_and_link`] is used right after a submission: it
//!   polls the one batch until it settles, then links it.
//!
//! A batch id is claimed *before* the link call is made, so a failed link is
//! never retried automatically. The outcome of the claimed attempt is kept,
//! so a later caller gets the same corpus id or the same failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use jobqueue_client::{Batch, BatchStatus, CorpusLinkRequest, JobQueueApi};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, OrchestratorEvent};

/// What happened to the one link attempt a batch is allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    InFlight,
    Linked(String),
    Failed(String),
}

enum Claim {
    Won,
    Taken(LinkState),
}

pub struct CorpusLinker {
    api: Arc<dyn JobQueueApi>,
    events: EventBus,
    links: Mutex<HashMap<String, LinkState>>,
    requested: Mutex<HashMap<String, CorpusLinkRequest>>,
    poll_interval: Duration,
    max_polls: u32,
}

impl CorpusLinker {
    pub fn new(api: Arc<dyn JobQueueApi>, events: EventBus, config: &OrchestratorConfig) -> Self {
        Self {
            api,
            events,
            links: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashMap::new()),
            poll_interval: config.batch_poll_interval,
            max_polls: config.corpus_wait_max_polls,
        }
    }

    /// Remember that `batch_id` was submitted with a corpus requested.
    pub fn register(&self, batch_id: impl Into<String>, request: CorpusLinkRequest) {
        let batch_id = batch_id.into();
        if lock(&self.links).contains_key(&batch_id) {
            return;
        }
        lock(&self.requested).insert(batch_id, request);
    }

    /// Whether a link attempt was already made for this batch.
    pub fn is_linked(&self, batch_id: &str) -> bool {
        lock(&self.links).contains_key(batch_id)
    }

    /// The corpus a batch was linked to by this linker, if the link succeeded.
    pub fn corpus_id(&self, batch_id: &str) -> Option<String> {
        match lock(&self.links).get(batch_id) {
            Some(LinkState::Linked(corpus_id)) => Some(corpus_id.clone()),
            _ => None,
        }
    }

    pub fn linked_count(&self) -> usize {
        lock(&self.links).len()
    }

    /// Corpus requests still waiting for their batch to complete.
    pub fn pending_requests(&self) -> usize {
        lock(&self.requested).len()
    }

    /// Take the link slot for a batch. Only the first caller wins; later
    /// callers see what became of the first attempt.
    fn claim(&self, batch_id: &str) -> Claim {
        {
            let mut links = lock(&self.links);
            if let Some(state) = links.get(batch_id) {
                return Claim::Taken(state.clone());
            }
            links.insert(batch_id.to_string(), LinkState::InFlight);
        }
        lock(&self.requested).remove(batch_id);
        Claim::Won
    }

    fn settle(&self, batch_id: &str, state: LinkState) {
        lock(&self.links).insert(batch_id.to_string(), state);
    }

    /// The link body for a batch, if a corpus was requested for it.
    fn request_for(&self, batch: &Batch) -> Option<CorpusLinkRequest> {
        if let Some(request) = lock(&self.requested).get(&batch.id) {
            return Some(request.clone());
        }
        batch
            .create_corpus
            .unwrap_or(false)
            .then(|| batch.corpus_link())
    }

    /// Link every completed, unlinked batch that asked for a corpus.
    ///
    /// Returns the ids of batches a link was attempted for.
    pub async fn observe(&self, batches: &[Batch]) -> Vec<String> {
        let mut attempted = Vec::new();

        for batch in batches {
            if batch.corpus_id.is_some() || batch.status != BatchStatus::Completed {
                continue;
            }
            let Some(request) = self.request_for(batch) else {
                continue;
            };
            if !matches!(self.claim(&batch.id), Claim::Won) {
                continue;
            }

            attempted.push(batch.id.clone());
            // Failures are reported, never raised: this runs inside the list poller.
            let _ = self.link(&batch.id, &request).await;
        }

        attempted
    }

    /// Poll one batch until it settles, then link it into a corpus.
    ///
    /// If another attempt already claimed the batch, its result is returned
    /// instead; while that attempt is in flight the batch keeps being polled
    /// until it reports a corpus. Transient failures while waiting are
    /// logged and the loop goes on.
    pub async fn wait_and_link(
        &self,
        batch_id: &str,
        request: CorpusLinkRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut polls = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if polls >= self.max_polls {
                warn!(batch_id = %batch_id, polls, "Batch did not settle in time");
                return Err(OrchestratorError::WaitTimeout {
                    batch_id: batch_id.to_string(),
                    polls,
                });
            }
            polls += 1;

            match self.api.get_batch(batch_id).await {
                Ok(Some(batch)) => {
                    if let Some(corpus_id) = batch.corpus_id {
                        info!(batch_id = %batch_id, corpus_id = %corpus_id, "Batch already has a corpus");
                        return Ok(corpus_id);
                    }
                    if batch.progress.is_settled() {
                        match self.claim(batch_id) {
                            Claim::Won => return self.link(batch_id, &request).await,
                            Claim::Taken(LinkState::Linked(corpus_id)) => return Ok(corpus_id),
                            Claim::Taken(LinkState::Failed(message)) => {
                                return Err(OrchestratorError::LinkFailed {
                                    batch_id: batch_id.to_string(),
                                    message,
                                });
                            }
                            Claim::Taken(LinkState::InFlight) => {
                                debug!(batch_id = %batch_id, "Corpus link in flight elsewhere");
                            }
                        }
                    } else {
                        debug!(
                            batch_id = %batch_id,
                            completed = batch.progress.completed,
                            failed = batch.progress.failed,
                            total = batch.progress.total,
                            "Waiting for batch to settle"
                        );
                    }
                }
                Ok(None) => {
                    return Err(OrchestratorError::NotFound {
                        entity: "batch",
                        id: batch_id.to_string(),
                    });
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "Batch status poll failed");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn link(&self, batch_id: &str, request: &CorpusLinkRequest) -> Result<String> {
        info!(batch_id = %batch_id, corpus_name = ?request.corpus_name, "Linking batch to corpus");
        match self.api.link_batch_to_corpus(batch_id, request).await {
            Ok(corpus_id) => {
                info!(batch_id = %batch_id, corpus_id = %corpus_id, "Batch linked to corpus");
                self.settle(batch_id, LinkState::Linked(corpus_id.clone()));
                self.events.emit(OrchestratorEvent::CorpusLinked {
                    batch_id: batch_id.to_string(),
                    corpus_id: corpus_id.clone(),
                });
                Ok(corpus_id)
            }
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Corpus link failed, not retrying");
                self.settle(batch_id, LinkState::Failed(e.to_string()));
                self.events.emit(OrchestratorEvent::CorpusLinkFailed {
                    batch_id: batch_id.to_string(),
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
