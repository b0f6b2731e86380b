//! The standing view of all mass-scrape batches.
//!
//! # Architecture
//!
//! ```text
//! BatchCoordinator
//!     │
//!     ├─► every 3s: list_batches()
//!     │       ├─► BatchBoard.apply()     (drop inconsistent snapshots, reconcile markers)
//!     │       ├─► emit BatchesRefreshed
//!     │       └─► CorpusLinker.observe()
//!     │
//!     └─► cancel / delete
//!             ├─► mark pending locally
//!             ├─► call the service
//!             └─► success: refresh now; failure: unmark, surface error
//! ```
//!
//! The list poll runs for as long as the coordinator is started, whether or
//! not any batch is still active.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobqueue_client::{Batch, JobQueueApi, JobQueueError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::corpus::CorpusLinker;
use crate::error::Result;
use crate::events::{EventBus, OrchestratorEvent};
use crate::poller::PollerRegistry;

const LIST_POLLER_ID: &str = "mass-scrape:list";

/// A user action applied locally and awaiting confirmation by a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Cancel,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchView {
    pub batch: Batch,
    pub pending: Option<PendingAction>,
}

impl BatchView {
    pub fn is_settled(&self) -> bool {
        self.batch.progress.is_settled()
    }
}

#[derive(Debug, Default)]
struct BatchBoard {
    batches: Vec<Batch>,
    pending: HashMap<String, PendingAction>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl BatchBoard {
    /// Replace the list with an authoritative one and return what is published.
    ///
    /// A snapshot whose progress does not add up is withheld; the previous
    /// snapshot of that batch, if any, is kept instead.
    fn apply(&mut self, incoming: Vec<Batch>) -> Vec<Batch> {
        let mut previous: HashMap<String, Batch> = self
            .batches
            .drain(..)
            .map(|batch| (batch.id.clone(), batch))
            .collect();

        let mut published = Vec::with_capacity(incoming.len());
        for batch in incoming {
            if batch.progress.is_consistent() {
                previous.remove(&batch.id);
                published.push(batch);
                continue;
            }
            warn!(
                batch_id = %batch.id,
                progress = ?batch.progress,
                "Inconsistent batch progress, keeping previous snapshot"
            );
            if let Some(kept) = previous.remove(&batch.id) {
                published.push(kept);
            }
        }

        self.pending.retain(|id, action| {
            match (*action, published.iter().find(|b| &b.id == id)) {
                (_, None) => false,
                (PendingAction::Cancel, Some(batch)) => batch.status.is_open(),
                (PendingAction::Delete, Some(_)) => true,
            }
        });

        self.batches = published.clone();
        self.refreshed_at = Some(Utc::now());
        published
    }

    fn views(&self) -> Vec<BatchView> {
        self.batches
            .iter()
            .map(|batch| BatchView {
                batch: batch.clone(),
                pending: self.pending.get(&batch.id).copied(),
            })
            .collect()
    }
}

pub struct BatchCoordinator {
    api: Arc<dyn JobQueueApi>,
    board: Arc<RwLock<BatchBoard>>,
    /// Held from list request to apply, so an older list never lands last
    refreshing: Arc<Mutex<()>>,
    linker: Arc<CorpusLinker>,
    pollers: PollerRegistry,
    events: EventBus,
    interval: Duration,
}

impl BatchCoordinator {
    pub fn new(
        api: Arc<dyn JobQueueApi>,
        linker: Arc<CorpusLinker>,
        events: EventBus,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            api,
            board: Arc::new(RwLock::new(BatchBoard::default())),
            refreshing: Arc::new(Mutex::new(())),
            linker,
            pollers: PollerRegistry::new(events.clone(), config.poll_failure_warn_threshold),
            events,
            interval: config.batch_poll_interval,
        }
    }

    /// Start the standing list poll. Restarting replaces the running one.
    pub fn start(&self) {
        let api = self.api.clone();
        let board = self.board.clone();
        let refreshing = self.refreshing.clone();
        let linker = self.linker.clone();
        let events = self.events.clone();
        self.pollers.start(
            LIST_POLLER_ID,
            self.interval,
            move || {
                let api = api.clone();
                let board = board.clone();
                let refreshing = refreshing.clone();
                let linker = linker.clone();
                let events = events.clone();
                async move {
                    refresh_board(api.as_ref(), &board, &refreshing, &linker, &events).await
                }
            },
            |_: &Vec<Batch>| false,
        );
        info!(interval_ms = self.interval.as_millis() as u64, "Batch list polling started");
    }

    pub fn is_running(&self) -> bool {
        self.pollers.is_polling(LIST_POLLER_ID)
    }

    /// Stop the standing list poll.
    pub fn shutdown(&self) {
        self.pollers.shutdown();
    }

    /// Refresh the list now, outside the regular schedule.
    pub async fn refresh(&self) -> Result<Vec<BatchView>> {
        refresh_board(
            self.api.as_ref(),
            &self.board,
            &self.refreshing,
            &self.linker,
            &self.events,
        )
        .await?;
        Ok(self.batches().await)
    }

    /// Cancel a batch. The next refresh is the source of truth for its status.
    pub async fn cancel(&self, batch_id: &str) -> Result<()> {
        self.mark(batch_id, PendingAction::Cancel).await;
        match self.api.cancel_batch(batch_id).await {
            Ok(()) => {
                info!(batch_id = %batch_id, "Batch cancelled");
                self.refresh_after_action(batch_id).await;
                Ok(())
            }
            Err(e) => {
                self.unmark(batch_id).await;
                warn!(batch_id = %batch_id, error = %e, "Failed to cancel batch");
                Err(e.into())
            }
        }
    }

    /// Delete a batch and its results on the service.
    pub async fn delete(&self, batch_id: &str) -> Result<()> {
        self.mark(batch_id, PendingAction::Delete).await;
        match self.api.delete_batch(batch_id).await {
            Ok(()) => {
                info!(batch_id = %batch_id, "Batch deleted");
                self.refresh_after_action(batch_id).await;
                Ok(())
            }
            Err(e) => {
                self.unmark(batch_id).await;
                warn!(batch_id = %batch_id, error = %e, "Failed to delete batch");
                Err(e.into())
            }
        }
    }

    pub async fn batches(&self) -> Vec<BatchView> {
        self.board.read().await.views()
    }

    pub async fn batch(&self, batch_id: &str) -> Option<BatchView> {
        self.batches()
            .await
            .into_iter()
            .find(|view| view.batch.id == batch_id)
    }

    /// When the last authoritative refresh was applied.
    pub async fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.board.read().await.refreshed_at
    }

    async fn mark(&self, batch_id: &str, action: PendingAction) {
        self.board
            .write()
            .await
            .pending
            .insert(batch_id.to_string(), action);
    }

    async fn unmark(&self, batch_id: &str) {
        self.board.write().await.pending.remove(batch_id);
    }

    async fn refresh_after_action(&self, batch_id: &str) {
        if let Err(e) = self.refresh().await {
            // The standing poll reconciles on its next tick.
            warn!(batch_id = %batch_id, error = %e, "Refresh after batch action failed");
        }
    }
}

async fn refresh_board(
    api: &dyn JobQueueApi,
    board: &RwLock<BatchBoard>,
    refreshing: &Mutex<()>,
    linker: &CorpusLinker,
    events: &EventBus,
) -> std::result::Result<Vec<Batch>, JobQueueError> {
    let published = {
        let _refreshing = refreshing.lock().await;
        let incoming = api.list_batches().await?;
        let published = board.write().await.apply(incoming);

        debug!(
            count = published.len(),
            settled = published.iter().filter(|b| b.progress.is_settled()).count(),
            "Batch list refreshed"
        );
        events.emit(OrchestratorEvent::BatchesRefreshed {
            batches: published.clone(),
        });
        published
    };

    linker.observe(&published).await;
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{batch, MockCall, MockJobQueue};
    use jobqueue_client::{BatchProgress, BatchStatus, CorpusLinkRequest};

    fn coordinator(mock: &Arc<MockJobQueue>) -> (BatchCoordinator, Arc<CorpusLinker>) {
        let config = OrchestratorConfig::default();
        let events = EventBus::new();
        let linker = Arc::new(CorpusLinker::new(mock.clone(), events.clone(), &config));
        let coordinator = BatchCoordinator::new(mock.clone(), linker.clone(), events, &config);
        (coordinator, linker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_standing_poll_runs_without_active_batches() {
        let mock = Arc::new(MockJobQueue::new());
        let (coordinator, _) = coordinator(&mock);

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(9500)).await;

        assert_eq!(mock.list_batch_calls(), 3);
        assert!(coordinator.is_running());

        coordinator.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.list_batch_calls(), 3);
        assert!(!coordinator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_failures_keep_last_view() {
        let mock = Arc::new(MockJobQueue::new());
        mock.script_batch_lists(vec![
            Ok(vec![batch("b1", BatchStatus::Processing, 4, 1, 0)]),
            Err(MockJobQueue::transport_error()),
            Ok(vec![batch("b1", BatchStatus::Processing, 4, 2, 0)]),
        ]);
        let (coordinator, _) = coordinator(&mock);
        coordinator.start();

        tokio::time::sleep(Duration::from_millis(6500)).await;
        assert_eq!(coordinator.batch("b1").await.unwrap().batch.progress.completed, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(coordinator.batch("b1").await.unwrap().batch.progress.completed, 2);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_inconsistent_snapshot_is_withheld() {
        let mock = Arc::new(MockJobQueue::new());
        let mut drifted = batch("b1", BatchStatus::Processing, 4, 2, 0);
        drifted.progress = BatchProgress { total: 4, completed: 2, failed: 0, pending: 1 };
        let mut fresh_but_broken = batch("b2", BatchStatus::Pending, 2, 0, 0);
        fresh_but_broken.progress.pending = 5;
        mock.script_batch_lists(vec![
            Ok(vec![batch("b1", BatchStatus::Processing, 4, 1, 0)]),
            Ok(vec![drifted, fresh_but_broken]),
        ]);
        let (coordinator, _) = coordinator(&mock);

        coordinator.refresh().await.unwrap();
        let views = coordinator.refresh().await.unwrap();

        assert_eq!(views.len(), 1);
        assert_eq!(views[0].batch.progress.completed, 1);
        assert!(views.iter().all(|v| v.batch.progress.is_consistent()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_batch_is_linked_once_across_ticks() {
        let mock = Arc::new(MockJobQueue::new());
        mock.script_batch_lists(vec![
            Ok(vec![batch("b1", BatchStatus::Processing, 2, 1, 0)]),
            Ok(vec![batch("b1", BatchStatus::Completed, 2, 2, 0)]),
        ]);
        let (coordinator, linker) = coordinator(&mock);
        linker.register("b1", CorpusLinkRequest::default());

        coordinator.start();
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert!(mock.list_batch_calls() >= 4);
        assert_eq!(mock.link_calls("b1"), 1);
        coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refreshes_apply_in_request_order() {
        let mock = Arc::new(MockJobQueue::new());
        mock.script_batch_lists(vec![
            Ok(vec![batch("b1", BatchStatus::Processing, 4, 1, 0)]),
            Ok(vec![batch("b1", BatchStatus::Processing, 4, 3, 0)]),
        ]);
        mock.delay_batch_lists(vec![Duration::from_secs(5)]);
        let (coordinator, _) = coordinator(&mock);

        let (slow, fast) = tokio::join!(coordinator.refresh(), async {
            tokio::task::yield_now().await;
            coordinator.refresh().await
        });
        slow.unwrap();
        fast.unwrap();

        assert_eq!(mock.list_batch_calls(), 2);
        assert_eq!(coordinator.batch("b1").await.unwrap().batch.progress.completed, 3);
    }

    #[tokio::test]
    async fn test_cancel_marks_then_reconciles() {
        let mock = Arc::new(MockJobQueue::new());
        mock.script_batch_lists(vec![
            Ok(vec![batch("b1", BatchStatus::Processing, 4, 1, 0)]),
            Ok(vec![batch("b1", BatchStatus::Cancelled, 4, 1, 0)]),
        ]);
        let (coordinator, _) = coordinator(&mock);
        coordinator.refresh().await.unwrap();

        coordinator.cancel("b1").await.unwrap();

        let view = coordinator.batch("b1").await.unwrap();
        assert_eq!(view.batch.status, BatchStatus::Cancelled);
        assert_eq!(view.pending, None);
        assert_eq!(
            mock.calls()[1..],
            [MockCall::CancelBatch("b1".into()), MockCall::ListBatches]
        );
    }

    #[tokio::test]
    async fn test_cancel_failure_leaves_state_alone() {
        let mock = Arc::new(MockJobQueue::new());
        mock.script_batch_lists(vec![Ok(vec![batch("b1", BatchStatus::Processing, 4, 1, 0)])]);
        mock.fail_batch_actions();
        let (coordinator, _) = coordinator(&mock);
        coordinator.refresh().await.unwrap();

        let err = coordinator.cancel("b1").await.unwrap_err();

        assert!(err.is_transport());
        let view = coordinator.batch("b1").await.unwrap();
        assert_eq!(view.batch.status, BatchStatus::Processing);
        assert_eq!(view.pending, None);
        assert_eq!(mock.list_batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_marker_stays_until_batch_disappears() {
        let mock = Arc::new(MockJobQueue::new());
        mock.script_batch_lists(vec![
            Ok(vec![batch("b1", BatchStatus::Completed, 1, 1, 0)]),
            Ok(vec![batch("b1", BatchStatus::Completed, 1, 1, 0)]),
            Ok(vec![]),
        ]);
        let (coordinator, _) = coordinator(&mock);
        coordinator.refresh().await.unwrap();

        coordinator.delete("b1").await.unwrap();
        assert_eq!(
            coordinator.batch("b1").await.unwrap().pending,
            Some(PendingAction::Delete)
        );

        coordinator.refresh().await.unwrap();
        assert!(coordinator.batch("b1").await.is_none());
        assert!(coordinator.refreshed_at().await.is_some());
    }
}
