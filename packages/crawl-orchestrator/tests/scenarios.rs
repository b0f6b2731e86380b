//! End-to-end orchestration scenarios against the in-memory service.

use std::sync::Arc;
use std::time::Duration;

use crawl_orchestrator::testing::{batch, MockCall, MockJobQueue};
use crawl_orchestrator::{
    BatchDraft, BatchStatus, DiveRequest, JobKind, JobOutcome, JobState, Orchestrator,
    OrchestratorConfig, OrchestratorEvent,
};
use jobqueue_client::{JobSnapshot, ProgressLookup};
use serde_json::json;
use tokio::sync::broadcast;

fn found(state: &str) -> jobqueue_client::Result<ProgressLookup> {
    Ok(ProgressLookup::Found(JobSnapshot {
        state: Some(state.into()),
        processed: Some(1),
        queued: Some(3),
        ..Default::default()
    }))
}

fn five_page_sitemap() -> serde_json::Value {
    let pages: Vec<_> = (0..5)
        .map(|i| json!({"url": format!("https://example.com/{i}"), "depth": i.min(2)}))
        .collect();
    json!({
        "pages": pages,
        "links": [{"from": "https://example.com/0", "to": "https://example.com/1"}],
        "statistics": {"totalPages": 5}
    })
}

fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn dive_polls_until_completed_and_exposes_sitemap() -> anyhow::Result<()> {
    let mock = Arc::new(MockJobQueue::new());
    mock.script_progress(
        "job-1",
        vec![
            found("waiting"),
            found("waiting"),
            Ok(ProgressLookup::Found(JobSnapshot {
                state: Some("completed".into()),
                result: Some(five_page_sitemap()),
                ..Default::default()
            })),
        ],
    );
    let orchestrator = Orchestrator::new(mock.clone(), &OrchestratorConfig::default());

    let job_id = orchestrator
        .submitter()
        .submit_dive(DiveRequest::new("https://example.com").with_max_depth(2))
        .await?;
    let result = orchestrator.tracker().wait_for_result(&job_id).await?;
    assert_eq!(result["statistics"]["totalPages"], 5);

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(mock.progress_calls(&job_id), 3);
    assert_eq!(orchestrator.tracker().active_pollers(), 0);

    let job = orchestrator.tracker().job(&job_id).await.expect("job tracked");
    assert_eq!(job.state(), JobState::Completed);
    assert!(job.progress().is_none());
    let sitemap = job.sitemap().expect("sitemap decoded");
    assert_eq!(sitemap.pages.len(), 5);
    assert_eq!(sitemap.links[0].target, "https://example.com/1");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancel_after_first_tick_stops_polling() {
    let mock = Arc::new(MockJobQueue::new());
    let orchestrator = Orchestrator::new(mock.clone(), &OrchestratorConfig::default());
    let tracker = orchestrator.tracker();

    tracker.track("abc", JobKind::FullDive).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(mock.progress_calls("abc"), 1);

    tracker.cancel("abc").await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(mock.progress_calls("abc"), 1);
    assert_eq!(tracker.active_pollers(), 0);
    assert!(mock.calls().contains(&MockCall::DeleteJob("abc".into())));
    assert_eq!(
        tracker.job("abc").await.unwrap().outcome(),
        Some(&JobOutcome::Removed)
    );
}

#[tokio::test(start_paused = true)]
async fn out_of_order_polls_never_move_backward() {
    let mock = Arc::new(MockJobQueue::new());
    mock.script_progress(
        "job-9",
        vec![
            found("active"),
            found("waiting"),
            found("active"),
            found("waiting"),
            Ok(ProgressLookup::Found(JobSnapshot {
                state: Some("failed".into()),
                error: Some("robots.txt disallows crawling".into()),
                ..Default::default()
            })),
            found("active"),
        ],
    );
    let orchestrator = Orchestrator::new(mock.clone(), &OrchestratorConfig::default());
    let mut rx = orchestrator.subscribe();

    orchestrator.tracker().track("job-9", JobKind::FullDive).await;
    let outcome = orchestrator.tracker().wait_for_outcome("job-9").await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(
        outcome,
        JobOutcome::Failed {
            message: "robots.txt disallows crawling".into()
        }
    );
    let ranks: Vec<u8> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            OrchestratorEvent::JobUpdated { state, .. } => Some(state.rank()),
            _ => None,
        })
        .collect();
    assert!(!ranks.is_empty());
    assert!(ranks.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(mock.progress_calls("job-9"), 5);
}

#[tokio::test(start_paused = true)]
async fn completed_batch_is_linked_exactly_once() {
    let mock = Arc::new(MockJobQueue::new());
    let orchestrator = Orchestrator::new(mock.clone(), &OrchestratorConfig::default());
    let mut rx = orchestrator.subscribe();

    let created = orchestrator
        .submitter()
        .submit_batch(
            BatchDraft::new(["https://a.test", "https://b.test"]).with_corpus("Docs", "", ["docs"]),
        )
        .await
        .unwrap();
    mock.script_batch_lists(vec![
        Ok(vec![batch(&created.batch_id, BatchStatus::Processing, 2, 1, 0)]),
        Ok(vec![batch(&created.batch_id, BatchStatus::Completed, 2, 2, 0)]),
    ]);

    orchestrator.batches().start();
    tokio::time::sleep(Duration::from_millis(15500)).await;

    assert_eq!(mock.list_batch_calls(), 5);
    assert_eq!(mock.link_calls(&created.batch_id), 1);
    assert!(orchestrator.linker().is_linked(&created.batch_id));

    let linked: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, OrchestratorEvent::CorpusLinked { .. }))
        .collect();
    assert_eq!(
        linked,
        vec![OrchestratorEvent::CorpusLinked {
            batch_id: created.batch_id.clone(),
            corpus_id: format!("corpus-{}", created.batch_id),
        }]
    );
    orchestrator.shutdown();
}

#[tokio::test(start_paused = true)]
async fn published_batches_always_add_up() {
    let mock = Arc::new(MockJobQueue::new());
    let mut skewed = batch("b1", BatchStatus::Processing, 10, 6, 1);
    skewed.progress.pending = 1;
    mock.script_batch_lists(vec![
        Ok(vec![batch("b1", BatchStatus::Processing, 10, 4, 0)]),
        Ok(vec![skewed, batch("b2", BatchStatus::Pending, 3, 0, 0)]),
        Ok(vec![batch("b1", BatchStatus::Processing, 10, 8, 1)]),
    ]);
    let orchestrator = Orchestrator::new(mock.clone(), &OrchestratorConfig::default());
    let mut rx = orchestrator.subscribe();

    orchestrator.batches().start();
    tokio::time::sleep(Duration::from_millis(9500)).await;
    orchestrator.shutdown();

    let snapshots: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            OrchestratorEvent::BatchesRefreshed { batches } => Some(batches),
            _ => None,
        })
        .collect();
    assert_eq!(snapshots.len(), 3);
    assert!(snapshots
        .iter()
        .flatten()
        .all(|b| b.progress.is_consistent()));
    let second_b1 = snapshots[1].iter().find(|b| b.id == "b1").unwrap();
    assert_eq!(second_b1.progress.completed, 4);
    assert!(snapshots[1].iter().any(|b| b.id == "b2"));
}

#[tokio::test]
async fn malformed_batch_urls_never_reach_the_service() {
    let mock = Arc::new(MockJobQueue::new());
    let orchestrator = Orchestrator::new(mock.clone(), &OrchestratorConfig::default());

    let err = orchestrator
        .submitter()
        .submit_batch(BatchDraft::new(["not-a-url", ""]))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "invalid request: at least one valid http(s) URL is required"
    );
    assert_eq!(mock.call_count(), 0);
}
