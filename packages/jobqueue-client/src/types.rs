use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// Envelope
// ============================================================================

/// Wrapper for Job Queue Service responses.
///
/// Every endpoint answers `{success, data}`; job creation answers
/// `{success, jobId}` and rejections carry `errors` or `error`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiResponse<T> {
    #[serde(default = "default_success")]
    pub success: bool,
    pub data: Option<T>,
    pub job_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub error: Option<String>,
    pub message: Option<String>,
}

fn default_success() -> bool {
    true
}

impl<T> ApiResponse<T> {
    /// All rejection reasons carried by the body, in order.
    pub fn rejection_reasons(&self) -> Vec<String> {
        let mut reasons = self.errors.clone();
        reasons.extend(self.error.clone());
        if reasons.is_empty() {
            reasons.extend(self.message.clone());
        }
        reasons
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// The kind of crawl/scrape work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Full-site crawl producing a sitemap
    FullDive,
    /// Shallow crawl used to preview a site before a full dive
    PreviewDive,
    /// Single page scrape, created only as part of a batch
    PageScrape,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FullDive => "full-dive",
            JobKind::PreviewDive => "preview-dive",
            JobKind::PageScrape => "page-scrape",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crawl engine used by the service for a dive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    #[default]
    Spider,
    Puppeteer,
}

/// Body of `POST /api/dive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiveRequest {
    pub url: String,
    pub max_depth: u32,
    pub max_pages: u32,
    pub follow_external_links: bool,
    pub include_assets: bool,
    pub respect_robots_txt: bool,
    pub stay_within_base_url: bool,
    /// Delay between requests in milliseconds
    pub delay: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_patterns: Vec<String>,
    pub engine_type: EngineType,
}

impl DiveRequest {
    /// Create a dive request with the service's default crawl settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_depth: 3,
            max_pages: 100,
            follow_external_links: false,
            include_assets: false,
            respect_robots_txt: true,
            stay_within_base_url: true,
            delay: 1000,
            user_agent: None,
            exclude_patterns: vec![],
            include_patterns: vec![],
            engine_type: EngineType::Spider,
        }
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_engine(mut self, engine: EngineType) -> Self {
        self.engine_type = engine;
        self
    }

    pub fn with_exclude_patterns(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.exclude_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_include_patterns(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.include_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn following_external_links(mut self, follow: bool) -> Self {
        self.follow_external_links = follow;
        self
    }

    pub fn including_assets(mut self, include: bool) -> Self {
        self.include_assets = include;
        self
    }

    pub fn respecting_robots_txt(mut self, respect: bool) -> Self {
        self.respect_robots_txt = respect;
        self
    }

    pub fn staying_within_base_url(mut self, stay: bool) -> Self {
        self.stay_within_base_url = stay;
        self
    }
}

/// Body of `POST /api/dive/preview`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub url: String,
}

/// A job creation request; the variant decides the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRequest {
    Dive(DiveRequest),
    Preview(PreviewRequest),
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Dive(_) => JobKind::FullDive,
            JobRequest::Preview(_) => JobKind::PreviewDive,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            JobRequest::Dive(r) => &r.url,
            JobRequest::Preview(r) => &r.url,
        }
    }
}

/// `data` of `GET /api/dive/progress/:jobId`.
///
/// `state` is passed through raw; interpreting it is up to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub processed: Option<u64>,
    pub queued: Option<u64>,
    pub visited: Option<u64>,
    pub status: Option<String>,
    pub domain: Option<String>,
    pub base_url: Option<String>,
    pub state: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Decode the result as a dive sitemap, if present and well-formed.
    pub fn sitemap(&self) -> Option<Sitemap> {
        self.result
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Outcome of a progress lookup. A missing job is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLookup {
    Found(JobSnapshot),
    NotFound,
}

/// Structured result of a dive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sitemap {
    #[serde(default)]
    pub pages: Vec<SitemapPage>,
    #[serde(default)]
    pub links: Vec<SitemapLink>,
    pub statistics: Option<SitemapStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitemapPage {
    pub url: String,
    pub title: Option<String>,
    pub depth: Option<u32>,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    /// Fields the service adds that this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitemapLink {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitemapStatistics {
    pub total_pages: Option<u64>,
    pub total_links: Option<u64>,
    pub max_depth_reached: Option<u32>,
    pub duration_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Entry of `GET /api/jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
    pub progress: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    #[serde(default, alias = "timestamp", deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "finishedOn", deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `data` of `GET /api/jobs`, grouped by queue state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    #[serde(default)]
    pub waiting: Vec<QueuedJob>,
    #[serde(default)]
    pub active: Vec<QueuedJob>,
    #[serde(default)]
    pub completed: Vec<QueuedJob>,
}

impl JobListing {
    pub fn len(&self) -> usize {
        self.waiting.len() + self.active.len() + self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Scrape options forwarded verbatim to every page job of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MassScrapeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_markdown: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_html: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of `POST /api/mass-scrape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MassScrapeRequest {
    pub urls: Vec<String>,
    pub batch_name: String,
    pub options: MassScrapeOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_corpus: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_tags: Option<Vec<String>>,
}

impl MassScrapeRequest {
    pub fn wants_corpus(&self) -> bool {
        self.create_corpus.unwrap_or(false)
    }

    /// The corpus link body matching this request's corpus fields.
    pub fn corpus_link(&self) -> CorpusLinkRequest {
        CorpusLinkRequest {
            corpus_name: self.corpus_name.clone(),
            corpus_description: self.corpus_description.clone(),
            corpus_tags: self.corpus_tags.clone(),
        }
    }
}

/// `data` of `POST /api/mass-scrape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreated {
    pub batch_id: String,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl BatchStatus {
    /// Whether the service may still change this batch's progress.
    pub fn is_open(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
}

impl BatchProgress {
    /// Every page job has finished, one way or the other.
    pub fn is_settled(&self) -> bool {
        self.completed.saturating_add(self.failed) >= self.total
    }

    /// `completed + failed + pending == total`.
    pub fn is_consistent(&self) -> bool {
        self.completed
            .checked_add(self.failed)
            .and_then(|n| n.checked_add(self.pending))
            == Some(self.total)
    }
}

/// A mass-scrape batch as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub progress: BatchProgress,
    #[serde(default)]
    pub urls: Vec<String>,
    pub corpus_id: Option<String>,
    pub create_corpus: Option<bool>,
    pub corpus_name: Option<String>,
    pub corpus_description: Option<String>,
    pub corpus_tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Corpus fields echoed by the service, as a link body.
    pub fn corpus_link(&self) -> CorpusLinkRequest {
        CorpusLinkRequest {
            corpus_name: self.corpus_name.clone(),
            corpus_description: self.corpus_description.clone(),
            corpus_tags: self.corpus_tags.clone(),
        }
    }
}

/// Body of `POST /api/corpus/from-batch/:batchId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusLinkRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CorpusLinked {
    pub corpus_id: String,
}

// ============================================================================
// Lenient decoding
// ============================================================================

/// Accepts RFC 3339 strings or epoch milliseconds; anything else is dropped.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

/// Queue backends hand out numeric ids; the client treats every id as opaque text.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
