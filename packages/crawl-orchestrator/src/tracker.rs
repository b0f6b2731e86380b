//! Tracking of individual dive jobs.
//!
//! Each tracked job owns a [`JobStateMachine`] and a poller. The poller
//! fetches progress, feeds it to the machine and stops once the machine is
//! terminal. Cancelling a job is two-phase: it is marked removed and its
//! poller stopped immediately, then the service is asked to delete it; the
//! removed marker is dropped once an authoritative job listing no longer
//! contains the job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use jobqueue_client::{JobKind, JobListing, JobQueueApi, JobQueueError, ProgressLookup};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::poller::PollerRegistry;
use crate::state::{JobOutcome, JobStateMachine, Transition};

type JobTable = Arc<RwLock<HashMap<String, JobStateMachine>>>;

pub struct JobTracker {
    api: Arc<dyn JobQueueApi>,
    jobs: JobTable,
    pollers: PollerRegistry,
    events: EventBus,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl JobTracker {
    pub fn new(api: Arc<dyn JobQueueApi>, events: EventBus, config: &OrchestratorConfig) -> Self {
        Self {
            api,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            pollers: PollerRegistry::new(events.clone(), config.poll_failure_warn_threshold),
            events,
            poll_interval: config.dive_poll_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start tracking a freshly created job in the `waiting` state.
    ///
    /// Tracking an id again restarts it from `waiting`.
    pub async fn track(&self, job_id: impl Into<String>, kind: JobKind) {
        let job_id = job_id.into();
        self.jobs
            .write()
            .await
            .insert(job_id.clone(), JobStateMachine::new(job_id.clone(), kind));

        let api = self.api.clone();
        let jobs = self.jobs.clone();
        let events = self.events.clone();
        let id = job_id.clone();
        self.pollers.start(
            job_id.clone(),
            self.poll_interval,
            move || {
                let api = api.clone();
                let jobs = jobs.clone();
                let events = events.clone();
                let id = id.clone();
                async move { poll_job(api.as_ref(), &jobs, &events, &id).await }
            },
            |terminal: &bool| *terminal,
        );

        info!(job_id = %job_id, kind = %kind, "Tracking job");
    }

    /// Cancel a job: stop polling now, then delete it on the service.
    ///
    /// The job stays removed locally even when the delete call fails; the
    /// failure is returned so it can be shown to the user.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        self.pollers.cancel(job_id);

        let removed = self
            .jobs
            .write()
            .await
            .get_mut(job_id)
            .map(JobStateMachine::remove)
            .unwrap_or(false);
        if removed {
            self.events.emit(OrchestratorEvent::JobRemoved {
                job_id: job_id.to_string(),
            });
        }

        match self.api.delete_job(job_id).await {
            Ok(()) => {
                info!(job_id = %job_id, "Job deleted");
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to delete job on service");
                Err(e.into())
            }
        }
    }

    /// Snapshot of a tracked job.
    pub async fn job(&self, job_id: &str) -> Option<JobStateMachine> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop tracking a job entirely, returning its last snapshot.
    pub async fn forget(&self, job_id: &str) -> Option<JobStateMachine> {
        self.pollers.cancel(job_id);
        let forgotten = self.jobs.write().await.remove(job_id);
        if forgotten.is_some() {
            self.events.emit(OrchestratorEvent::JobRemoved {
                job_id: job_id.to_string(),
            });
        }
        forgotten
    }

    /// Drop every completed or failed job that is no longer polled.
    ///
    /// Finished jobs stay readable until evicted or forgotten. Removed jobs
    /// are kept until [`JobTracker::list_jobs`] reconciles them.
    pub async fn evict_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|id, machine| {
            !matches!(
                machine.outcome(),
                Some(JobOutcome::Completed { .. } | JobOutcome::Failed { .. })
            ) || self.pollers.is_polling(id)
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!(evicted, "Evicted finished jobs");
        }
        evicted
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        self.pollers.is_polling(job_id)
    }

    pub fn active_pollers(&self) -> usize {
        self.pollers.active_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Wait until a tracked job finishes, fails or is removed.
    ///
    /// Returns `Cancelled` once polling stops without an outcome, including
    /// on shutdown, and `NotFound` once the job is forgotten.
    pub async fn wait_for_outcome(&self, job_id: &str) -> Result<JobOutcome> {
        let mut rx = self.events.subscribe();
        loop {
            // Read before the job: a poller retires only after its last update.
            let polling = self.is_polling(job_id);
            match self.job(job_id).await {
                None => {
                    return Err(OrchestratorError::NotFound {
                        entity: "job",
                        id: job_id.to_string(),
                    });
                }
                Some(machine) => {
                    if let Some(outcome) = machine.outcome() {
                        return Ok(outcome.clone());
                    }
                }
            }
            if !polling {
                return Err(OrchestratorError::Cancelled);
            }

            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(OrchestratorError::Cancelled),
                event = rx.recv() => event,
            };
            match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(OrchestratorError::Cancelled),
            }
        }
    }

    /// Wait for a job's result; failure and removal become errors.
    pub async fn wait_for_result(&self, job_id: &str) -> Result<serde_json::Value> {
        match self.wait_for_outcome(job_id).await? {
            JobOutcome::Completed { result, .. } => Ok(result),
            JobOutcome::Failed { message } => Err(OrchestratorError::JobFailed {
                job_id: job_id.to_string(),
                message,
            }),
            JobOutcome::Removed => Err(OrchestratorError::Cancelled),
        }
    }

    /// Fetch the grouped job listing and reconcile removed jobs against it.
    pub async fn list_jobs(&self) -> Result<JobListing> {
        let listing = self.api.list_jobs().await?;
        let listed: HashSet<&str> = listing
            .waiting
            .iter()
            .chain(&listing.active)
            .chain(&listing.completed)
            .map(|job| job.id.as_str())
            .collect();

        self.jobs
            .write()
            .await
            .retain(|id, machine| !machine.is_removed() || listed.contains(id.as_str()));
        Ok(listing)
    }

    /// Stop every poller and release every waiter; tracked snapshots stay
    /// readable. A tracker is not restarted after shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pollers.shutdown();
    }
}

/// One poll of one job. Returns whether the job is terminal.
async fn poll_job(
    api: &dyn JobQueueApi,
    jobs: &RwLock<HashMap<String, JobStateMachine>>,
    events: &EventBus,
    job_id: &str,
) -> std::result::Result<bool, JobQueueError> {
    let lookup = api.get_progress(job_id).await?;

    let mut jobs = jobs.write().await;
    let Some(machine) = jobs.get_mut(job_id) else {
        debug!(job_id = %job_id, "Job no longer tracked");
        return Ok(true);
    };

    let transition = match &lookup {
        ProgressLookup::Found(snapshot) => machine.apply(snapshot),
        ProgressLookup::NotFound => {
            warn!(job_id = %job_id, "Job not found on service");
            machine.apply_not_found()
        }
    };

    match &transition {
        Transition::Moved { from, to } => {
            info!(job_id = %job_id, from = %from, to = %to, "Job state changed");
        }
        Transition::Progressed => {
            debug!(job_id = %job_id, progress = ?machine.progress(), "Job progressed");
        }
        Transition::Ignored(reason) => {
            debug!(job_id = %job_id, reason = ?reason, "Poll response ignored");
        }
        Transition::Unchanged => {}
    }

    if matches!(transition, Transition::Moved { .. } | Transition::Progressed) {
        events.emit(OrchestratorEvent::JobUpdated {
            job_id: job_id.to_string(),
            kind: machine.kind(),
            state: machine.state(),
        });
    }
    if let (Transition::Moved { .. }, Some(outcome)) = (&transition, machine.outcome()) {
        events.emit(OrchestratorEvent::JobFinished {
            job_id: job_id.to_string(),
            outcome: outcome.clone(),
        });
    }

    Ok(machine.is_terminal())
}
