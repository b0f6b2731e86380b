//! Testing utilities including an in-memory Job Queue Service.
//!
//! [`MockJobQueue`] answers from scripted responses and records every call,
//! so orchestration logic can be exercised without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_client::{
    Batch, BatchCreated, BatchProgress, BatchStatus, CorpusLinkRequest, JobListing, JobQueueApi,
    JobQueueError, JobRequest, JobSnapshot, MassScrapeRequest, ProgressLookup, Result,
};

/// Record of a call made to the mock service.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateJob(JobRequest),
    GetProgress(String),
    DeleteJob(String),
    ListJobs,
    CreateBatch(MassScrapeRequest),
    ListBatches,
    GetBatch(String),
    CancelBatch(String),
    DeleteBatch(String),
    LinkBatch {
        batch_id: String,
        request: CorpusLinkRequest,
    },
}

/// Scripted responses, consumed in order. The last successful response
/// repeats once the script runs out.
struct Script<T> {
    steps: VecDeque<Result<T>>,
}

impl<T: Clone> Script<T> {
    fn new(steps: Vec<Result<T>>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    fn next(&mut self) -> Option<Result<T>> {
        if self.steps.len() > 1 {
            return self.steps.pop_front();
        }
        match self.steps.front() {
            Some(Ok(value)) => Some(Ok(value.clone())),
            Some(Err(_)) => self.steps.pop_front(),
            None => None,
        }
    }
}

/// An in-memory Job Queue Service.
///
/// Unscripted jobs report `waiting` forever, unscripted batch lists are
/// empty and corpus links succeed with `corpus-<batchId>`.
#[derive(Default)]
pub struct MockJobQueue {
    progress: RwLock<HashMap<String, Script<ProgressLookup>>>,
    batch_lists: RwLock<Option<Script<Vec<Batch>>>>,
    batch_list_delays: RwLock<VecDeque<Duration>>,
    batches: RwLock<HashMap<String, Script<Option<Batch>>>>,
    links: RwLock<Option<Script<String>>>,
    create_rejection: RwLock<Option<Vec<String>>>,
    fail_deletes: AtomicBool,
    fail_batch_actions: AtomicBool,
    next_id: AtomicU64,
    calls: RwLock<Vec<MockCall>>,
}

impl MockJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport failure, as the HTTP client would report it.
    pub fn transport_error() -> JobQueueError {
        JobQueueError::Transport(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
    }

    /// Script the progress responses of one job.
    pub fn script_progress(&self, job_id: impl Into<String>, steps: Vec<Result<ProgressLookup>>) {
        self.progress
            .write()
            .unwrap()
            .insert(job_id.into(), Script::new(steps));
    }

    /// Script the responses of successive batch list refreshes.
    pub fn script_batch_lists(&self, steps: Vec<Result<Vec<Batch>>>) {
        *self.batch_lists.write().unwrap() = Some(Script::new(steps));
    }

    /// Hold successive batch list responses back for the given durations.
    pub fn delay_batch_lists(&self, delays: Vec<Duration>) {
        *self.batch_list_delays.write().unwrap() = delays.into();
    }

    /// Script the responses of `get_batch` for one batch.
    pub fn script_batch(&self, batch_id: impl Into<String>, steps: Vec<Result<Option<Batch>>>) {
        self.batches
            .write()
            .unwrap()
            .insert(batch_id.into(), Script::new(steps));
    }

    /// Script the responses of successive corpus link calls.
    pub fn script_links(&self, steps: Vec<Result<String>>) {
        *self.links.write().unwrap() = Some(Script::new(steps));
    }

    /// Reject every job and batch creation with these errors.
    pub fn reject_creates(&self, errors: Vec<String>) {
        *self.create_rejection.write().unwrap() = Some(errors);
    }

    /// Make `delete_job` fail with a transport error.
    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Make `cancel_batch` and `delete_batch` fail with a transport error.
    pub fn fail_batch_actions(&self) {
        self.fail_batch_actions.store(true, Ordering::SeqCst);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn progress_calls(&self, job_id: &str) -> usize {
        self.count(|call| matches!(call, MockCall::GetProgress(id) if id == job_id))
    }

    pub fn link_calls(&self, batch_id: &str) -> usize {
        self.count(|call| matches!(call, MockCall::LinkBatch { batch_id: id, .. } if id == batch_id))
    }

    pub fn list_batch_calls(&self) -> usize {
        self.count(|call| matches!(call, MockCall::ListBatches))
    }

    fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.read().unwrap().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: MockCall) {
        self.calls.write().unwrap().push(call);
    }

    fn check_create(&self) -> Result<()> {
        match self.create_rejection.read().unwrap().clone() {
            Some(errors) => Err(JobQueueError::Rejected { errors }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobQueueApi for MockJobQueue {
    async fn create_job(&self, request: &JobRequest) -> Result<String> {
        self.record(MockCall::CreateJob(request.clone()));
        self.check_create()?;
        Ok(format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn get_progress(&self, job_id: &str) -> Result<ProgressLookup> {
        self.record(MockCall::GetProgress(job_id.to_string()));
        let next = self
            .progress
            .write()
            .unwrap()
            .get_mut(job_id)
            .and_then(Script::next);
        next.unwrap_or_else(|| {
            Ok(ProgressLookup::Found(JobSnapshot {
                state: Some("waiting".into()),
                ..Default::default()
            }))
        })
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.record(MockCall::DeleteJob(job_id.to_string()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::transport_error());
        }
        Ok(())
    }

    async fn list_jobs(&self) -> Result<JobListing> {
        self.record(MockCall::ListJobs);
        Ok(JobListing::default())
    }

    async fn create_batch(&self, request: &MassScrapeRequest) -> Result<BatchCreated> {
        self.record(MockCall::CreateBatch(request.clone()));
        self.check_create()?;
        Ok(BatchCreated {
            batch_id: format!("batch-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            total: request.urls.len() as u64,
        })
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        self.record(MockCall::ListBatches);
        let next = self.batch_lists.write().unwrap().as_mut().and_then(Script::next);
        let delay = self.batch_list_delays.write().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or_else(|| Ok(vec![]))
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        self.record(MockCall::GetBatch(batch_id.to_string()));
        let next = self
            .batches
            .write()
            .unwrap()
            .get_mut(batch_id)
            .and_then(Script::next);
        next.unwrap_or(Ok(None))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<()> {
        self.record(MockCall::CancelBatch(batch_id.to_string()));
        if self.fail_batch_actions.load(Ordering::SeqCst) {
            return Err(Self::transport_error());
        }
        Ok(())
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<()> {
        self.record(MockCall::DeleteBatch(batch_id.to_string()));
        if self.fail_batch_actions.load(Ordering::SeqCst) {
            return Err(Self::transport_error());
        }
        Ok(())
    }

    async fn link_batch_to_corpus(
        &self,
        batch_id: &str,
        request: &CorpusLinkRequest,
    ) -> Result<String> {
        self.record(MockCall::LinkBatch {
            batch_id: batch_id.to_string(),
            request: request.clone(),
        });
        let next = self.links.write().unwrap().as_mut().and_then(Script::next);
        next.unwrap_or_else(|| Ok(format!("corpus-{batch_id}")))
    }
}

/// Build a batch as the service would report it.
pub fn batch(id: &str, status: BatchStatus, total: u64, completed: u64, failed: u64) -> Batch {
    Batch {
        id: id.to_string(),
        name: format!("{id} batch"),
        status,
        progress: BatchProgress {
            total,
            completed,
            failed,
            pending: total.saturating_sub(completed + failed),
        },
        urls: (0..total).map(|i| format!("https://example.com/{i}")).collect(),
        corpus_id: None,
        create_corpus: None,
        corpus_name: None,
        corpus_description: None,
        corpus_tags: None,
        created_at: None,
        updated_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_repeats_last_success() {
        let mock = MockJobQueue::new();
        mock.script_batch_lists(vec![
            Err(MockJobQueue::transport_error()),
            Ok(vec![batch("b1", BatchStatus::Processing, 2, 1, 0)]),
        ]);

        assert!(mock.list_batches().await.is_err());
        assert_eq!(mock.list_batches().await.unwrap().len(), 1);
        assert_eq!(mock.list_batches().await.unwrap().len(), 1);
        assert_eq!(mock.list_batch_calls(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_defaults() {
        let mock = MockJobQueue::new();

        let lookup = mock.get_progress("x").await.unwrap();
        assert!(matches!(lookup, ProgressLookup::Found(s) if s.state.as_deref() == Some("waiting")));
        assert_eq!(
            mock.link_batch_to_corpus("b1", &CorpusLinkRequest::default()).await.unwrap(),
            "corpus-b1"
        );
        assert!(mock.get_batch("b1").await.unwrap().is_none());
    }

    #[test]
    fn test_batch_fixture_is_consistent() {
        let b = batch("b1", BatchStatus::Processing, 10, 4, 1);
        assert!(b.progress.is_consistent());
        assert_eq!(b.progress.pending, 5);
        assert_eq!(b.urls.len(), 10);
    }
}
