use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::TtlCache;

/// A background task that periodically removes expired entries from a [`TtlCache`].
///
/// The task is stopped by [`stop`](Self::stop), by cancelling the parent token it was spawned
/// with, or by dropping the `CleanupTask`.
#[derive(Debug)]
pub struct CleanupTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Spawns the sweep onto the current tokio runtime.
    ///
    /// The first sweep happens one `interval` after spawning.
    pub fn spawn<K, V>(
        name: &'static str,
        cache: Arc<TtlCache<K, V>>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self
    where
        K: Eq + Hash + Send + 'static,
        V: Clone + Send + 'static,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.clean_expired();
                        if purged > 0 {
                            tracing::debug!(cache = name, purged, "Purged expired cache entries");
                            metric!(counter("cache.purged") += purged as i64, "cache" => name);
                        }
                        metric!(gauge("cache.entries") = cache.len() as u64, "cache" => name);
                    }
                }
            }

            tracing::trace!(cache = name, "Stopped cache cleanup task");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stops the sweep and waits for the task to wind down.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::error!(error = &err as &dyn std::error::Error, "Cleanup task failed");
            }
        }
    }

    /// Whether the sweep is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
