//! Typed REST client for the crawl Job Queue Service.
//!
//! A thin request/response layer: it builds requests, decodes the
//! `{success, data}` envelope and classifies failures. It never retries
//! and never interprets job state; that belongs to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use jobqueue_client::{DiveRequest, JobQueueApi, JobQueueClient, JobRequest, ProgressLookup};
//!
//! let client = JobQueueClient::new("http://localhost:3000")?;
//!
//! let job_id = client
//!     .create_job(&JobRequest::Dive(DiveRequest::new("https://example.com")))
//!     .await?;
//! if let ProgressLookup::Found(snapshot) = client.get_progress(&job_id).await? {
//!     println!("{:?}", snapshot.state);
//! }
//! ```

pub mod error;
pub mod types;

pub use error::{JobQueueError, Result};
pub use types::{
    Batch, BatchCreated, BatchProgress, BatchStatus, CorpusLinkRequest, DiveRequest, EngineType,
    JobKind, JobListing, JobRequest, JobSnapshot, MassScrapeOptions, MassScrapeRequest,
    PreviewRequest, ProgressLookup, QueuedJob, Sitemap, SitemapLink, SitemapPage,
    SitemapStatistics,
};

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use types::{ApiResponse, CorpusLinked};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters escaped when an id is placed in a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Operations offered by the Job Queue Service.
///
/// [`JobQueueClient`] is the HTTP implementation; tests substitute an
/// in-memory double.
#[async_trait]
pub trait JobQueueApi: Send + Sync {
    /// Create a dive or preview job. Returns the service-assigned job id.
    async fn create_job(&self, request: &JobRequest) -> Result<String>;

    /// Fetch the progress of a dive job.
    async fn get_progress(&self, job_id: &str) -> Result<ProgressLookup>;

    /// Cancel and delete a job.
    async fn delete_job(&self, job_id: &str) -> Result<()>;

    /// All queued jobs grouped by queue state.
    async fn list_jobs(&self) -> Result<JobListing>;

    /// Submit a mass-scrape batch.
    async fn create_batch(&self, request: &MassScrapeRequest) -> Result<BatchCreated>;

    /// All mass-scrape batches.
    async fn list_batches(&self) -> Result<Vec<Batch>>;

    /// One batch, or `None` when the service does not know it.
    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>>;

    async fn cancel_batch(&self, batch_id: &str) -> Result<()>;

    async fn delete_batch(&self, batch_id: &str) -> Result<()>;

    /// Link a settled batch's results into a corpus. Returns the corpus id.
    async fn link_batch_to_corpus(
        &self,
        batch_id: &str,
        request: &CorpusLinkRequest,
    ) -> Result<String>;
}

/// HTTP client for the Job Queue Service.
#[derive(Clone)]
pub struct JobQueueClient {
    client: reqwest::Client,
    base_url: String,
}

impl JobQueueClient {
    /// Create a client for the service at `base_url` (e.g. `http://localhost:3000`)
    /// with the default 30 second request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a client with a per-request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    /// Create a client around a preconfigured `reqwest::Client`.
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, endpoint: Endpoint<'_>) -> RequestBuilder {
        let (method, path) = endpoint.route();
        self.client.request(method, self.url(&path))
    }

    /// Send a request and decode the `{success, data}` envelope.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<ApiResponse<T>> {
        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        decode_envelope(status, &body)
    }

    /// Send a request whose success carries no payload of interest.
    async fn send_unit(&self, request: RequestBuilder) -> Result<()> {
        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() && body.trim().is_empty() {
            return Ok(());
        }
        decode_envelope::<serde_json::Value>(status, &body).map(|_| ())
    }
}

#[async_trait]
impl JobQueueApi for JobQueueClient {
    async fn create_job(&self, request: &JobRequest) -> Result<String> {
        let builder = match request {
            JobRequest::Dive(dive) => self.request(Endpoint::CreateDive).json(dive),
            JobRequest::Preview(preview) => self.request(Endpoint::CreatePreview).json(preview),
        };
        let resp: ApiResponse<serde_json::Value> = self.send(builder).await?;

        let job_id = resp
            .job_id
            .or_else(|| {
                resp.data
                    .as_ref()
                    .and_then(|d| d.get("jobId"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .ok_or_else(|| JobQueueError::Decode("job creation response without jobId".into()))?;

        tracing::debug!(job_id = %job_id, kind = %request.kind(), "Job created");
        Ok(job_id)
    }

    async fn get_progress(&self, job_id: &str) -> Result<ProgressLookup> {
        match self.send::<JobSnapshot>(self.request(Endpoint::Progress(job_id))).await {
            Ok(resp) => resp
                .data
                .map(ProgressLookup::Found)
                .ok_or_else(|| JobQueueError::Decode("progress response without data".into())),
            Err(e) if e.is_not_found() => Ok(ProgressLookup::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.send_unit(self.request(Endpoint::DeleteJob(job_id))).await
    }

    async fn list_jobs(&self) -> Result<JobListing> {
        let resp: ApiResponse<JobListing> = self.send(self.request(Endpoint::ListJobs)).await?;
        Ok(resp.data.unwrap_or_default())
    }

    async fn create_batch(&self, request: &MassScrapeRequest) -> Result<BatchCreated> {
        let builder = self.request(Endpoint::CreateBatch).json(request);
        let resp: ApiResponse<BatchCreated> = self.send(builder).await?;
        let created = resp
            .data
            .ok_or_else(|| JobQueueError::Decode("batch creation response without data".into()))?;

        tracing::debug!(batch_id = %created.batch_id, total = created.total, "Batch created");
        Ok(created)
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let resp: ApiResponse<Vec<Batch>> = self.send(self.request(Endpoint::ListBatches)).await?;
        Ok(resp.data.unwrap_or_default())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        match self.send::<Batch>(self.request(Endpoint::GetBatch(batch_id))).await {
            Ok(resp) => Ok(resp.data),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<()> {
        self.send_unit(self.request(Endpoint::CancelBatch(batch_id))).await
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<()> {
        self.send_unit(self.request(Endpoint::DeleteBatch(batch_id))).await
    }

    async fn link_batch_to_corpus(
        &self,
        batch_id: &str,
        request: &CorpusLinkRequest,
    ) -> Result<String> {
        let builder = self.request(Endpoint::LinkCorpus(batch_id)).json(request);
        let resp: ApiResponse<CorpusLinked> = self.send(builder).await?;
        resp.data
            .map(|linked| linked.corpus_id)
            .ok_or_else(|| JobQueueError::Decode("corpus link response without corpusId".into()))
    }
}

/// The service's REST endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint<'a> {
    CreateDive,
    CreatePreview,
    Progress(&'a str),
    DeleteJob(&'a str),
    ListJobs,
    CreateBatch,
    ListBatches,
    GetBatch(&'a str),
    CancelBatch(&'a str),
    DeleteBatch(&'a str),
    LinkCorpus(&'a str),
}

impl Endpoint<'_> {
    fn route(self) -> (Method, String) {
        match self {
            Endpoint::CreateDive => (Method::POST, "/api/dive".into()),
            Endpoint::CreatePreview => (Method::POST, "/api/dive/preview".into()),
            Endpoint::Progress(id) => (Method::GET, format!("/api/dive/progress/{}", encode(id))),
            Endpoint::DeleteJob(id) => (Method::DELETE, format!("/api/jobs/{}", encode(id))),
            Endpoint::ListJobs => (Method::GET, "/api/jobs".into()),
            Endpoint::CreateBatch => (Method::POST, "/api/mass-scrape".into()),
            Endpoint::ListBatches => (Method::GET, "/api/mass-scrape".into()),
            Endpoint::GetBatch(id) => (Method::GET, format!("/api/mass-scrape/{}", encode(id))),
            Endpoint::CancelBatch(id) => {
                (Method::DELETE, format!("/api/mass-scrape/{}/cancel", encode(id)))
            }
            Endpoint::DeleteBatch(id) => {
                (Method::DELETE, format!("/api/mass-scrape/{}", encode(id)))
            }
            Endpoint::LinkCorpus(id) => {
                (Method::POST, format!("/api/corpus/from-batch/{}", encode(id)))
            }
        }
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Classify a response: non-2xx and `success: false` become errors.
fn decode_envelope<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<ApiResponse<T>> {
    if !status.is_success() {
        let reasons = serde_json::from_str::<ApiResponse<serde_json::Value>>(body)
            .map(|resp| resp.rejection_reasons())
            .unwrap_or_default();

        if status == StatusCode::NOT_FOUND || reasons.is_empty() {
            let message = if reasons.is_empty() {
                body.to_string()
            } else {
                reasons.join("; ")
            };
            return Err(JobQueueError::Api {
                status: status.as_u16(),
                message,
            });
        }
        return Err(JobQueueError::rejected(reasons));
    }

    let resp: ApiResponse<T> =
        serde_json::from_str(body).map_err(|e| JobQueueError::Decode(e.to_string()))?;
    if !resp.success {
        return Err(JobQueueError::rejected(resp.rejection_reasons()));
    }
    Ok(resp)
}
