//! Lifecycle of a single tracked crawl/scrape job.
//!
//! ```text
//! waiting --(active)--------------------> active
//! waiting --(completed, result present)--> completed
//! active  --(completed, result present)--> completed
//! active  --(failed)--------------------> failed
//! any     --(user cancels / deletes)----> removed
//! ```
//!
//! The service is authoritative, so the machine only ever moves forward:
//! reports that would move a job backward, or that carry a state it does
//! not recognise, are ignored and polling carries on.

use chrono::{DateTime, Utc};
use jobqueue_client::{JobKind, JobSnapshot, Sitemap};
use serde::Serialize;

const FAILED_WITHOUT_MESSAGE: &str = "job failed without an error message";
const VANISHED: &str = "job no longer exists on the queue service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Parse a state as reported by the service. Unknown strings yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Position in the lifecycle; transitions never decrease it.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Waiting => 0,
            JobState::Active => 1,
            JobState::Completed | JobState::Failed => 2,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live counters of a job that has not finished yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiveProgress {
    pub processed: Option<u64>,
    pub queued: Option<u64>,
    pub visited: Option<u64>,
    pub status: Option<String>,
    pub domain: Option<String>,
    pub base_url: Option<String>,
}

impl From<&JobSnapshot> for DiveProgress {
    fn from(snapshot: &JobSnapshot) -> Self {
        Self {
            processed: snapshot.processed,
            queued: snapshot.queued,
            visited: snapshot.visited,
            status: snapshot.status.clone(),
            domain: snapshot.domain.clone(),
            base_url: snapshot.base_url.clone(),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        result: serde_json::Value,
        /// The result decoded as a dive sitemap, when it has that shape
        sitemap: Option<Sitemap>,
    },
    Failed {
        message: String,
    },
    /// Cancelled or deleted by the user
    Removed,
}

/// Effect of applying one poll response.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing observable changed.
    Unchanged,
    /// Same state, new progress counters.
    Progressed,
    Moved { from: JobState, to: JobState },
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IgnoreReason {
    /// The job already finished or was removed.
    AlreadyTerminal,
    /// The report would move the job backward.
    Backward { from: JobState, to: JobState },
    /// `completed` was reported without a result.
    MissingResult,
}

/// State machine for one tracked job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStateMachine {
    job_id: String,
    kind: JobKind,
    state: JobState,
    progress: Option<DiveProgress>,
    outcome: Option<JobOutcome>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl JobStateMachine {
    /// A freshly created job: `waiting`, no progress yet.
    pub fn new(job_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            state: JobState::Waiting,
            progress: Some(DiveProgress::default()),
            outcome: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Last state reported by the service. Removal does not change it.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Present only while the job is waiting or active.
    pub fn progress(&self) -> Option<&DiveProgress> {
        self.progress.as_ref()
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn sitemap(&self) -> Option<&Sitemap> {
        match &self.outcome {
            Some(JobOutcome::Completed { sitemap, .. }) => sitemap.as_ref(),
            _ => None,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_removed(&self) -> bool {
        matches!(self.outcome, Some(JobOutcome::Removed))
    }

    /// Completed, failed or removed: nothing will poll this job again.
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Apply one progress response from the service.
    pub fn apply(&mut self, snapshot: &JobSnapshot) -> Transition {
        if self.is_terminal() {
            return Transition::Ignored(IgnoreReason::AlreadyTerminal);
        }

        if snapshot.created_at.is_some() {
            self.created_at = snapshot.created_at;
        }
        if snapshot.updated_at.is_some() {
            self.updated_at = snapshot.updated_at;
        }

        let reported = match snapshot.state.as_deref() {
            Some(raw) => match JobState::parse(raw) {
                Some(state) => Some(state),
                None => {
                    tracing::debug!(job_id = %self.job_id, state = raw, "Unrecognized job state, keeping previous");
                    None
                }
            },
            None => None,
        };

        let Some(to) = reported else {
            return self.refresh_progress(snapshot);
        };

        let from = self.state;
        if to.rank() < from.rank() {
            return Transition::Ignored(IgnoreReason::Backward { from, to });
        }

        match to {
            JobState::Waiting | JobState::Active => {
                if to == from {
                    return self.refresh_progress(snapshot);
                }
                self.state = to;
                self.progress = Some(DiveProgress::from(snapshot));
            }
            JobState::Completed => {
                let Some(result) = snapshot.result.clone() else {
                    return Transition::Ignored(IgnoreReason::MissingResult);
                };
                self.state = to;
                self.progress = None;
                self.outcome = Some(JobOutcome::Completed {
                    sitemap: snapshot.sitemap(),
                    result,
                });
            }
            JobState::Failed => {
                let message = snapshot
                    .error
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| FAILED_WITHOUT_MESSAGE.to_string());
                self.state = to;
                self.progress = None;
                self.outcome = Some(JobOutcome::Failed { message });
            }
        }

        Transition::Moved { from, to }
    }

    /// The service no longer knows this job: treat it as failed.
    pub fn apply_not_found(&mut self) -> Transition {
        if self.is_terminal() {
            return Transition::Ignored(IgnoreReason::AlreadyTerminal);
        }
        let from = self.state;
        self.state = JobState::Failed;
        self.progress = None;
        self.outcome = Some(JobOutcome::Failed {
            message: VANISHED.to_string(),
        });
        Transition::Moved {
            from,
            to: JobState::Failed,
        }
    }

    /// Mark the job removed by the user. Returns false if it had already ended.
    pub fn remove(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.progress = None;
        self.outcome = Some(JobOutcome::Removed);
        true
    }

    fn refresh_progress(&mut self, snapshot: &JobSnapshot) -> Transition {
        let progress = DiveProgress::from(snapshot);
        if self.progress.as_ref() == Some(&progress) {
            Transition::Unchanged
        } else {
            self.progress = Some(progress);
            Transition::Progressed
        }
    }
}
