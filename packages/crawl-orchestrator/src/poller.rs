//! Cancellable periodic polling, one task per tracked id.
//!
//! # Architecture
//!
//! ```text
//! PollerRegistry
//!     │
//!     ├─► id → (generation, CancellationToken)
//!     │
//!     └─► per id: tokio task
//!             ├─► wait one interval (or cancellation)
//!             ├─► poll()                 ── failure: log, count, keep schedule
//!             └─► is_terminal(response)  ── true: stop, drop own entry
//! ```
//!
//! Polls for one id are sequential: the next tick is only awaited after the
//! previous response arrived. Starting a poller for an id that already has
//! one cancels the old one first. `cancel` takes effect before it returns:
//! the task checks its token before every poll and drops an in-flight poll
//! when the token fires.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::events::{EventBus, OrchestratorEvent};

/// Smallest interval accepted; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct PollerEntry {
    generation: u64,
    token: CancellationToken,
}

struct RegistryInner {
    entries: DashMap<String, PollerEntry>,
    next_generation: AtomicU64,
    events: EventBus,
    failure_warn_threshold: u32,
}

impl RegistryInner {
    /// Remove the entry for `id` only if it still belongs to `generation`.
    fn retire(&self, id: &str, generation: u64) {
        self.entries.remove_if(id, |_, entry| entry.generation == generation);
    }
}

/// Owns every poller of one component. Dropping it cancels them all.
pub struct PollerRegistry {
    inner: Arc<RegistryInner>,
}

impl PollerRegistry {
    pub fn new(events: EventBus, failure_warn_threshold: u32) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                next_generation: AtomicU64::new(0),
                events,
                failure_warn_threshold,
            }),
        }
    }

    /// Poll `id` every `interval` until `is_terminal` holds or it is cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<T, E, F, Fut, P>(
        &self,
        id: impl Into<String>,
        interval: Duration,
        mut poll: F,
        is_terminal: P,
    ) where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: Fn(&T) -> bool + Send + 'static,
    {
        let id = id.into();
        let interval = interval.max(MIN_INTERVAL);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let previous = self.inner.entries.insert(
            id.clone(),
            PollerEntry {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(id = %id, "Replacing existing poller");
            previous.token.cancel();
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if token.is_cancelled() {
                    break;
                }

                let response = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    response = poll() => response,
                };

                match response {
                    Ok(value) => {
                        consecutive_failures = 0;
                        if is_terminal(&value) {
                            debug!(id = %id, "Terminal state reached, poller stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= inner.failure_warn_threshold {
                            error!(id = %id, consecutive_failures, error = %e, "Poll keeps failing");
                        } else {
                            warn!(id = %id, consecutive_failures, error = %e, "Poll failed, retrying next tick");
                        }
                        inner.events.emit(OrchestratorEvent::PollFailed {
                            id: id.clone(),
                            consecutive_failures,
                            error: e.to_string(),
                        });
                    }
                }
            }

            inner.retire(&id, generation);
        });
    }

    /// Stop polling `id`. Returns whether a poller was running.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.entries.remove(id) {
            Some((_, entry)) => {
                entry.token.cancel();
                debug!(id = %id, "Poller cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every poller owned by this registry.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    pub fn is_polling(&self, id: &str) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// Number of live pollers.
    pub fn active_count(&self) -> usize {
        self.inner.entries.len()
    }
}

impl Drop for PollerRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    const TICK: Duration = Duration::from_millis(2000);

    fn registry() -> PollerRegistry {
        PollerRegistry::new(EventBus::new(), 3)
    }

    fn counting_poll(
        counter: Arc<AtomicU32>,
    ) -> impl FnMut() -> futures::future::Ready<Result<u32, String>> + Send + 'static {
        move || futures::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_after_one_interval() {
        let registry = registry();
        let polls = Arc::new(AtomicU32::new(0));
        registry.start("job", TICK, counting_poll(polls.clone()), |_| false);

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_itself_on_terminal_response() {
        let registry = registry();
        let polls = Arc::new(AtomicU32::new(0));
        registry.start("job", TICK, counting_poll(polls.clone()), |n| *n >= 3);

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_polling("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_further_polls() {
        let registry = registry();
        let polls = Arc::new(AtomicU32::new(0));
        registry.start("abc", TICK, counting_poll(polls.clone()), |_| false);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        assert!(registry.cancel("abc"));
        assert_eq!(registry.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(!registry.cancel("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_existing_poller() {
        let registry = registry();
        let old = Arc::new(AtomicU32::new(0));
        let new = Arc::new(AtomicU32::new(0));

        registry.start("job", TICK, counting_poll(old.clone()), |_| false);
        registry.start("job", TICK, counting_poll(new.clone()), |_| false);
        assert_eq!(registry.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(6500)).await;

        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_poller_does_not_retire_successor() {
        let registry = registry();
        let polls = Arc::new(AtomicU32::new(0));

        registry.start("job", TICK, counting_poll(Arc::new(AtomicU32::new(0))), |_| true);
        registry.start("job", Duration::from_secs(10), counting_poll(polls.clone()), |_| false);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(registry.is_polling("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_schedule_and_are_reported() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let registry = PollerRegistry::new(events, 3);
        let polls = Arc::new(AtomicU32::new(0));

        let counter = polls.clone();
        registry.start(
            "job",
            TICK,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.active_count(), 0);

        for expected in 1..=2 {
            match rx.recv().await.unwrap() {
                OrchestratorEvent::PollFailed { id, consecutive_failures, .. } => {
                    assert_eq!(id, "job");
                    assert_eq!(consecutive_failures, expected);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_everything() {
        let polls = Arc::new(AtomicU32::new(0));
        {
            let registry = registry();
            registry.start("a", TICK, counting_poll(polls.clone()), |_| false);
            registry.start("b", TICK, counting_poll(polls.clone()), |_| false);
            assert_eq!(registry.active_count(), 2);
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }
}
