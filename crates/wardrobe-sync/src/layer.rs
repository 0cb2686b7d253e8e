use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::caching::{CleanupTask, TtlCache};
use crate::config::Config;
use crate::dedup::{OperationDeduplicator, RunError};
use crate::providers::{DeleteProvider, ProviderError, SessionProvider, SignedUrlProvider};
use crate::session::SessionCache;
use crate::types::{AuthEvent, AuthEventKind, Session};
use crate::utils::futures::{m, measure};

/// Signed URLs by storage path.
type UrlCache = TtlCache<String, String>;

/// The entry point for the UI into remote state.
///
/// Wires the caches to the providers and owns the background work: the sweep of expired signed
/// URLs and the subscription to auth events. Both stop on [`shutdown`](Self::shutdown) or when the
/// layer is dropped.
///
/// Must be created from within a tokio runtime.
pub struct SyncLayer {
    url_ttl: Duration,
    delete_timeout: Duration,
    urls: Arc<UrlCache>,
    sessions: SessionCache,
    operations: OperationDeduplicator<String, bool, ProviderError>,
    url_provider: Arc<dyn SignedUrlProvider>,
    delete_provider: Arc<dyn DeleteProvider>,
    shutdown: CancellationToken,
    cleanup: Mutex<Option<CleanupTask>>,
    auth_listener: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SyncLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncLayer")
            .field("urls", &self.urls)
            .field("sessions", &self.sessions)
            .field("operations", &self.operations)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl SyncLayer {
    /// Creates the layer on top of a backend that provides everything.
    pub fn with_backend<B>(config: &Config, backend: Arc<B>) -> Self
    where
        B: SessionProvider + SignedUrlProvider + DeleteProvider,
    {
        Self::new(config, backend.clone(), backend.clone(), backend)
    }

    pub fn new(
        config: &Config,
        session_provider: Arc<dyn SessionProvider>,
        url_provider: Arc<dyn SignedUrlProvider>,
        delete_provider: Arc<dyn DeleteProvider>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let urls = Arc::new(UrlCache::new(config.signed_urls.expiry_buffer));
        let sessions = SessionCache::new(Arc::clone(&session_provider));

        let cleanup = CleanupTask::spawn(
            "signed_url",
            Arc::clone(&urls),
            config.signed_urls.cleanup_interval,
            &shutdown,
        );
        let auth_listener = spawn_auth_listener(
            session_provider.auth_events(),
            sessions.clone(),
            Arc::clone(&urls),
            shutdown.child_token(),
        );

        Self {
            url_ttl: config.signed_urls.ttl,
            delete_timeout: config.operations.delete_timeout,
            urls,
            sessions,
            operations: OperationDeduplicator::new("sync"),
            url_provider,
            delete_provider,
            shutdown,
            cleanup: Mutex::new(Some(cleanup)),
            auth_listener: Mutex::new(Some(auth_listener)),
        }
    }

    /// Returns a signed URL for the object at `path`.
    ///
    /// A cached URL is used if it stays valid for longer than the expiry buffer. Otherwise a new
    /// one is requested and cached. Failures are logged and yield `None`, callers render a
    /// placeholder instead.
    ///
    /// A URL requested before the cache was cleared, for example because the user signed out
    /// meanwhile, is returned to this caller but not cached.
    pub async fn signed_url(&self, path: &str) -> Option<String> {
        metric!(counter("signed_url.access") += 1);

        if let Some(url) = self.urls.get(path) {
            metric!(counter("signed_url.cache.hit") += 1);
            tracing::trace!(path, "Signed URL cache hit");
            return Some(url);
        }

        let generation = self.urls.generation();
        let request = self.url_provider.create_signed_url(path, self.url_ttl);
        match measure("signed_url.fetch", m::result, request).await {
            Ok(signed) => {
                metric!(counter("signed_url.fetch") += 1, "status" => "ok");
                let stored = self.urls.set_unless_cleared(
                    path.to_owned(),
                    signed.url.clone(),
                    signed.expires_in,
                    generation,
                );
                if !stored {
                    tracing::debug!(path, "Not caching signed URL, cache was cleared meanwhile");
                }
                Some(signed.url)
            }
            Err(err) => {
                metric!(counter("signed_url.fetch") += 1, "status" => "err");
                tracing::warn!(
                    path,
                    error = &err as &dyn std::error::Error,
                    "Failed to create signed URL"
                );
                None
            }
        }
    }

    /// Resolves signed URLs for all `paths` concurrently, in order.
    pub async fn signed_urls<P: AsRef<str>>(&self, paths: &[P]) -> Vec<Option<String>> {
        join_all(paths.iter().map(|path| self.signed_url(path.as_ref()))).await
    }

    /// See [`SessionCache::current_session`].
    pub async fn current_session(&self) -> Option<Arc<Session>> {
        self.sessions.current_session().await
    }

    /// See [`SessionCache::ensure_ready`].
    pub async fn ensure_auth_ready(&self, timeout: Duration) -> Option<Arc<Session>> {
        self.sessions.ensure_ready(timeout).await
    }

    /// Runs a destructive operation at most once at a time per `key`.
    ///
    /// See [`OperationDeduplicator::run`].
    pub async fn run_deduplicated<F, Fut>(
        &self,
        key: impl Into<String>,
        timeout: Duration,
        operation: F,
    ) -> Result<bool, RunError<ProviderError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, ProviderError>> + Send + 'static,
    {
        self.operations.run(key.into(), timeout, operation).await
    }

    /// Deletes an item and its photos.
    ///
    /// Repeated requests for the same item while a delete is running share its outcome. Cached
    /// signed URLs of the photos are dropped once the delete went through.
    pub async fn delete_item(
        &self,
        id: &str,
        paths: &[String],
    ) -> Result<bool, RunError<ProviderError>> {
        let provider = Arc::clone(&self.delete_provider);
        let owned_id = id.to_owned();
        let owned_paths = paths.to_vec();

        let result = self
            .run_deduplicated(format!("delete:{id}"), self.delete_timeout, move || {
                async move { provider.delete_resource(&owned_id, &owned_paths).await }
            })
            .await;

        match &result {
            Ok(true) => {
                for path in paths {
                    self.urls.remove(path.as_str());
                }
                tracing::debug!(id, "Deleted item");
            }
            Ok(false) => tracing::debug!(id, "Item to delete did not exist"),
            Err(err) => tracing::warn!(id, error = %err, "Failed to delete item"),
        }

        result
    }

    /// Stops the background tasks and waits for them to finish.
    ///
    /// Caches stay readable afterwards, but expired URLs are no longer swept and auth events are
    /// no longer applied.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let cleanup = self.cleanup.lock().unwrap().take();
        if let Some(cleanup) = cleanup {
            cleanup.stop().await;
        }

        let listener = self.auth_listener.lock().unwrap().take();
        if let Some(listener) = listener {
            if let Err(err) = listener.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Auth event listener failed"
                );
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for SyncLayer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Applies auth events to the session cache until the stream ends or `token` is cancelled.
fn spawn_auth_listener(
    mut events: BoxStream<'static, AuthEvent>,
    sessions: SessionCache,
    urls: Arc<UrlCache>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let previous_user = sessions
                .peek()
                .and_then(|session| session.user_id.clone());
            sessions.apply_event(&event);

            if user_changed(&event, previous_user.as_deref()) {
                tracing::debug!(kind = event.kind.as_str(), "User changed, dropping signed URLs");
                urls.clear();
            }
        }

        tracing::trace!("Stopped auth event listener");
    })
}

/// Whether `event` hands the session to somebody other than `previous_user`.
///
/// Signed URLs are only valid for the user that requested them, so they have to go then.
fn user_changed(event: &AuthEvent, previous_user: Option<&str>) -> bool {
    match event.kind {
        AuthEventKind::SignedOut => true,
        AuthEventKind::SignedIn | AuthEventKind::UserUpdated => {
            let user = event.session.as_ref().and_then(|s| s.user_id.as_deref());
            user != previous_user
        }
        AuthEventKind::TokenRefreshed => false,
    }
}
