//! Request validation and submission.
//!
//! Every submit validates locally first; nothing reaches the service until
//! the request is known to be well formed. Submitted jobs are handed to the
//! [`JobTracker`] and the id is returned without waiting for completion.

use std::sync::Arc;

use chrono::Utc;
use jobqueue_client::{
    BatchCreated, DiveRequest, JobKind, JobQueueApi, JobRequest, MassScrapeOptions,
    MassScrapeRequest, PreviewRequest,
};
use tracing::{debug, info};
use url::Url;

use crate::corpus::CorpusLinker;
use crate::error::{OrchestratorError, Result};
use crate::tracker::JobTracker;

pub const MAX_DEPTH_RANGE: std::ops::RangeInclusive<u32> = 1..=10;
pub const MAX_PAGES_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

/// A mass-scrape batch as the user entered it.
#[derive(Debug, Clone, Default)]
pub struct BatchDraft {
    /// Raw URL lines; blanks and malformed entries are dropped
    pub urls: Vec<String>,
    /// Empty means "name it after the submission time"
    pub name: String,
    pub options: MassScrapeOptions,
    pub create_corpus: bool,
    pub corpus_name: String,
    pub corpus_description: String,
    pub corpus_tags: Vec<String>,
}

impl BatchDraft {
    pub fn new(urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_options(mut self, options: MassScrapeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_corpus(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.create_corpus = true;
        self.corpus_name = name.into();
        self.corpus_description = description.into();
        self.corpus_tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

pub struct JobSubmitter {
    api: Arc<dyn JobQueueApi>,
    tracker: Arc<JobTracker>,
    linker: Arc<CorpusLinker>,
}

impl JobSubmitter {
    pub fn new(
        api: Arc<dyn JobQueueApi>,
        tracker: Arc<JobTracker>,
        linker: Arc<CorpusLinker>,
    ) -> Self {
        Self {
            api,
            tracker,
            linker,
        }
    }

    /// Submit a full dive and start tracking it.
    pub async fn submit_dive(&self, mut request: DiveRequest) -> Result<String> {
        request.url = request.url.trim().to_string();
        validate_dive(&request)?;

        let url = request.url.clone();
        let job_id = self.api.create_job(&JobRequest::Dive(request)).await?;
        info!(job_id = %job_id, url = %url, "Dive submitted");

        self.tracker.track(job_id.clone(), JobKind::FullDive).await;
        Ok(job_id)
    }

    /// Submit a shallow preview dive and start tracking it.
    pub async fn submit_preview(&self, url: &str) -> Result<String> {
        let url = url.trim();
        let problems = url_problems(url);
        if !problems.is_empty() {
            return Err(OrchestratorError::Validation(problems));
        }

        let request = JobRequest::Preview(PreviewRequest {
            url: url.to_string(),
        });
        let job_id = self.api.create_job(&request).await?;
        info!(job_id = %job_id, url = %url, "Preview submitted");

        self.tracker.track(job_id.clone(), JobKind::PreviewDive).await;
        Ok(job_id)
    }

    /// Create a mass-scrape batch. A requested corpus is registered with the
    /// linker so the batch is linked once it completes.
    pub async fn submit_batch(&self, draft: BatchDraft) -> Result<BatchCreated> {
        let request = prepare_batch(draft)?;
        let created = self.api.create_batch(&request).await?;
        info!(
            batch_id = %created.batch_id,
            total = created.total,
            name = %request.batch_name,
            "Batch submitted"
        );

        if request.wants_corpus() {
            self.linker
                .register(created.batch_id.clone(), request.corpus_link());
        }
        Ok(created)
    }
}

/// Check a dive request, collecting every problem.
pub fn validate_dive(request: &DiveRequest) -> Result<()> {
    let mut problems = url_problems(&request.url);

    if !MAX_DEPTH_RANGE.contains(&request.max_depth) {
        problems.push(format!(
            "maxDepth must be between {} and {}",
            MAX_DEPTH_RANGE.start(),
            MAX_DEPTH_RANGE.end()
        ));
    }
    if !MAX_PAGES_RANGE.contains(&request.max_pages) {
        problems.push(format!(
            "maxPages must be between {} and {}",
            MAX_PAGES_RANGE.start(),
            MAX_PAGES_RANGE.end()
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(problems))
    }
}

/// Turn a draft into the request body, or reject it before any network call.
pub fn prepare_batch(draft: BatchDraft) -> Result<MassScrapeRequest> {
    let submitted = draft.urls.len();
    let urls: Vec<String> = draft
        .urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| is_web_url(u))
        .map(str::to_string)
        .collect();

    if urls.is_empty() {
        return Err(OrchestratorError::validation(
            "at least one valid http(s) URL is required",
        ));
    }
    if urls.len() < submitted {
        debug!(
            submitted,
            kept = urls.len(),
            "Dropped blank or malformed batch URLs"
        );
    }

    let batch_name = match draft.name.trim() {
        "" => format!("Batch {}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
        name => name.to_string(),
    };

    let (create_corpus, corpus_name, corpus_description, corpus_tags) = if draft.create_corpus {
        let tags: Vec<String> = draft
            .corpus_tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        (
            Some(true),
            non_empty(draft.corpus_name),
            non_empty(draft.corpus_description),
            (!tags.is_empty()).then_some(tags),
        )
    } else {
        (None, None, None, None)
    };

    Ok(MassScrapeRequest {
        urls,
        batch_name,
        options: draft.options,
        create_corpus,
        corpus_name,
        corpus_description,
        corpus_tags,
    })
}

fn url_problems(url: &str) -> Vec<String> {
    if url.trim().is_empty() {
        vec!["url is required".to_string()]
    } else if !is_web_url(url.trim()) {
        vec![format!("url must be an absolute http(s) URL: {url}")]
    } else {
        vec![]
    }
}

fn is_web_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host().is_some(),
        Err(_) => false,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
