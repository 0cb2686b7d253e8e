//! Deduplication of concurrent operations on the same resource.
//!
//! Destructive operations like deleting a wardrobe item tend to be triggered more than once: a
//! double click, a retry button pressed while the first attempt is still running. The
//! [`OperationDeduplicator`] makes sure that for any given key at most one operation is running.
//! Callers that arrive while it runs wait for it and receive the same outcome.
//!
//! Every operation runs under a timeout. A timed out operation is not cancelled, it keeps running
//! in the background and its eventual result is dropped. The key is released as soon as the
//! timeout fires, so the next request for the same key starts a fresh operation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use thiserror::Error;

use crate::utils::futures::CallOnDrop;

/// The outcome of a deduplicated operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError<E> {
    /// The operation did not finish in time.
    ///
    /// The operation may still complete later. Its final state is unknown.
    #[error("operation timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// The operation itself failed.
    #[error(transparent)]
    Failed(E),
    /// The operation panicked or was torn down before it finished.
    #[error("operation was aborted")]
    Aborted,
}

type OperationChannel<T, E> = Shared<oneshot::Receiver<Result<T, RunError<E>>>>;

type OperationMap<K, T, E> = Arc<Mutex<BTreeMap<K, OperationChannel<T, E>>>>;

/// Runs at most one operation per key at a time.
///
/// Cloning is cheap and every clone shares the same set of running operations.
pub struct OperationDeduplicator<K, T, E> {
    name: &'static str,
    operations: OperationMap<K, T, E>,
}

impl<K, T, E> Clone for OperationDeduplicator<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            operations: Arc::clone(&self.operations),
        }
    }
}

impl<K, T, E> fmt::Debug for OperationDeduplicator<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .operations
            .try_lock()
            .map(|operations| operations.len())
            .unwrap_or_default();
        f.debug_struct("OperationDeduplicator")
            .field("name", &self.name)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, T, E> OperationDeduplicator<K, T, E>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a deduplicator. The `name` is used to tag logs and metrics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            operations: Default::default(),
        }
    }

    /// Runs `operation` for `key`, unless an operation for `key` is already running.
    ///
    /// If one is running, `operation` is not invoked and this waits for the running one instead.
    /// Either way, all callers for the same key observe the same outcome. The outcome is
    /// [`RunError::Timeout`] if the operation takes longer than `timeout`.
    pub async fn run<F, Fut>(&self, key: K, timeout: Duration, operation: F) -> Result<T, RunError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.name;
        metric!(counter("dedup.run") += 1, "operation" => name);

        let (channel, sender) = {
            let mut operations = self.operations.lock().unwrap();
            match operations.get(&key) {
                Some(channel) => (channel.clone(), None),
                None => {
                    let (sender, receiver) = oneshot::channel();
                    let channel = receiver.shared();
                    operations.insert(key.clone(), channel.clone());
                    (channel, Some(sender))
                }
            }
        };

        match sender {
            Some(sender) => self.start(key, timeout, sender, operation),
            None => {
                metric!(counter("dedup.joined") += 1, "operation" => name);
                tracing::debug!(operation = name, ?key, "Joining running operation");
            }
        }

        // The supervisor always sends before releasing its sender, unless the runtime shuts down.
        channel.await.unwrap_or(Err(RunError::Aborted))
    }

    /// The number of keys with a running operation.
    pub fn in_flight(&self) -> usize {
        self.operations.lock().unwrap().len()
    }

    /// Whether an operation for `key` is currently running.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.operations.lock().unwrap().contains_key(key)
    }

    /// Spawns the operation registered under `key` along with its supervisor.
    fn start<F, Fut>(
        &self,
        key: K,
        timeout: Duration,
        sender: oneshot::Sender<Result<T, RunError<E>>>,
        operation: F,
    ) where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.name;

        // Armed before `operation` runs, so a panicking operation still frees its key.
        let release = {
            let operations = Arc::clone(&self.operations);
            let key = key.clone();
            CallOnDrop::new(move || {
                operations.lock().unwrap().remove(&key);
            })
        };

        let future = operation();
        tracing::debug!(operation = name, ?key, "Starting operation");
        let handle = tokio::spawn(future);

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(err))) => Err(RunError::Failed(err)),
                Ok(Err(join_error)) => {
                    tracing::error!(
                        operation = name,
                        ?key,
                        error = &join_error as &dyn std::error::Error,
                        "Operation panicked",
                    );
                    Err(RunError::Aborted)
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        operation = name,
                        ?key,
                        timeout = %humantime::format_duration(timeout),
                        "Operation timed out, leaving it running in the background",
                    );
                    Err(RunError::Timeout(timeout))
                }
            };

            let status = match &outcome {
                Ok(_) => "ok",
                Err(RunError::Failed(_)) => "err",
                Err(RunError::Timeout(_)) => "timeout",
                Err(RunError::Aborted) => "aborted",
            };
            metric!(counter("dedup.done") += 1, "operation" => name, "status" => status);

            // Free the key before publishing, so that anyone reacting to the outcome can start
            // a new operation right away.
            drop(release);
            sender.send(outcome).ok();
        });
    }
}
