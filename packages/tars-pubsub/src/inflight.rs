//! In-flight handler task accounting.
//!
//! Every handler task spawned by a dispatch adapter holds an [`InflightGuard`]
//! for its whole lifetime. Graceful shutdown waits on [`InflightTracker::wait_zero`]
//! after the broker subscriptions are torn down, so no task is cut off
//! mid-flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

/// Counts running handler tasks, overall and per topic.
#[derive(Default)]
pub struct InflightTracker {
    total: AtomicUsize,
    per_topic: DashMap<String, usize>,
    notify: Notify,
}

impl InflightTracker {
    /// Create a new inflight tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking one task for `topic`.
    ///
    /// The count is decremented when the returned guard drops, including
    /// when the task panics or is cancelled.
    pub fn begin(self: &Arc<Self>, topic: &str) -> InflightGuard {
        *self.per_topic.entry(topic.to_string()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            tracker: self.clone(),
            topic: topic.to_string(),
        }
    }

    fn end(&self, topic: &str) {
        let drained = match self.per_topic.get_mut(topic) {
            Some(mut n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if drained {
            self.per_topic.remove_if(topic, |_, n| *n == 0);
        }

        let prev = self.total.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Number of tasks currently running.
    pub fn count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Number of tasks currently running for `topic`.
    pub fn count_for(&self, topic: &str) -> usize {
        self.per_topic.get(topic).map(|n| *n).unwrap_or(0)
    }

    /// Wait until no task is running.
    ///
    /// Returns immediately if nothing is in flight. Callers bound this with
    /// `tokio::time::timeout`.
    pub async fn wait_zero(&self) {
        loop {
            // Register before checking so a concurrent `end` cannot slip
            // between the check and the await.
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for InflightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightTracker")
            .field("total", &self.count())
            .field("active_topics", &self.per_topic.len())
            .finish()
    }
}

// =============================================================================
// Inflight Guard (RAII)
// =============================================================================

/// RAII guard for one in-flight handler task.
#[must_use = "the task is only tracked while the guard is alive"]
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
    topic: String,
}

impl InflightGuard {
    /// Topic the tracked task belongs to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.end(&self.topic);
    }
}
