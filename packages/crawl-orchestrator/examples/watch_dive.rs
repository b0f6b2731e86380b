//! Watch a dive from submission to sitemap.
//!
//! Submits a dive against a running Job Queue Service, logs every
//! orchestration event and prints the discovered pages once it completes.
//!
//! ```bash
//! JOB_QUEUE_URL=http://localhost:3000 \
//!     cargo run -p crawl-orchestrator --example watch_dive -- https://example.com 2
//! ```

use anyhow::{Context, Result};
use crawl_orchestrator::{DiveRequest, JobOutcome, Orchestrator, OrchestratorConfig, OrchestratorEvent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crawl_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().context("usage: watch_dive <url> [max-depth]")?;
    let max_depth = match args.next() {
        Some(depth) => depth.parse().context("max-depth must be a number")?,
        None => 3,
    };

    let config = OrchestratorConfig::from_env()?;
    tracing::info!(service = %config.job_queue_url, "Starting dive watcher");
    let orchestrator = Orchestrator::from_config(config)?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::JobUpdated { job_id, state, .. } => {
                    tracing::info!(job_id = %job_id, state = %state, "update");
                }
                OrchestratorEvent::PollFailed { id, consecutive_failures, error } => {
                    tracing::warn!(id = %id, consecutive_failures, error = %error, "poll failed");
                }
                _ => {}
            }
        }
    });

    let job_id = orchestrator
        .submitter()
        .submit_dive(DiveRequest::new(url).with_max_depth(max_depth))
        .await?;

    match orchestrator.tracker().wait_for_outcome(&job_id).await? {
        JobOutcome::Completed { sitemap: Some(sitemap), .. } => {
            println!("{} pages, {} links", sitemap.pages.len(), sitemap.links.len());
            for page in &sitemap.pages {
                println!("  [{}] {}", page.depth.unwrap_or(0), page.url);
            }
        }
        JobOutcome::Completed { result, .. } => println!("{result:#}"),
        JobOutcome::Failed { message } => anyhow::bail!("dive failed: {message}"),
        JobOutcome::Removed => println!("dive was cancelled"),
    }

    orchestrator.shutdown();
    Ok(())
}
