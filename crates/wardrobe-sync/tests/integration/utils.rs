use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;

use wardrobe_sync::SyncLayer;
use wardrobe_sync::config::Config;
use wardrobe_sync::providers::{
    BackendConfig, DeleteProvider, ProviderError, SessionProvider, SignedUrlProvider,
};
use wardrobe_sync::types::{AuthEvent, Session, SignedUrl};
use wardrobe_sync_test as test;

pub use test::{MockBackend, USER_ID, VALID_TOKEN};

/// An in-memory backend that counts every call.
///
/// - Sessions resolve to whatever [`set_session`](Self::set_session) put there, after
///   `session_delay`.
/// - Every path is signed with a fresh URL after `sign_delay`, except paths starting with
///   `missing/`.
/// - Deletes take `delete_delay`. The id `missing` does not exist, `forbidden` is rejected.
pub struct StubBackend {
    session_delay: Duration,
    sign_delay: Duration,
    delete_delay: Duration,
    session: Mutex<Option<Session>>,
    session_calls: AtomicUsize,
    sign_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self {
            session_delay: Duration::from_millis(20),
            sign_delay: Duration::ZERO,
            delete_delay: Duration::from_millis(100),
            session: Mutex::new(None),
            session_calls: AtomicUsize::new(0),
            sign_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            events: broadcast::channel(16).0,
        }
    }
}

impl StubBackend {
    pub fn with_session_delay(mut self, delay: Duration) -> Self {
        self.session_delay = delay;
        self
    }

    pub fn with_sign_delay(mut self, delay: Duration) -> Self {
        self.sign_delay = delay;
        self
    }

    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.lock().unwrap() = session;
    }

    /// Broadcasts `event` to the auth event subscribers.
    pub fn emit(&self, event: AuthEvent) {
        self.events.send(event).ok();
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

impl SessionProvider for StubBackend {
    fn fetch_session(&self) -> BoxFuture<'_, Result<Option<Session>, ProviderError>> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(self.session_delay).await;
            Ok(self.session.lock().unwrap().clone())
        }
        .boxed()
    }

    fn auth_events(&self) -> BoxStream<'static, AuthEvent> {
        let receiver = self.events.subscribe();
        futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.ok().map(|event| (event, receiver))
        })
        .boxed()
    }
}

impl SignedUrlProvider for StubBackend {
    fn create_signed_url<'a>(
        &'a self,
        path: &'a str,
        expires_in: Duration,
    ) -> BoxFuture<'a, Result<SignedUrl, ProviderError>> {
        let n = self.sign_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(self.sign_delay).await;
            if path.starts_with("missing/") {
                return Err(ProviderError::NotFound);
            }
            Ok(SignedUrl {
                url: format!("https://cdn.example.co/{path}?token=t{n}"),
                expires_in,
            })
        }
        .boxed()
    }
}

impl DeleteProvider for StubBackend {
    fn delete_resource<'a>(
        &'a self,
        id: &'a str,
        _paths: &'a [String],
    ) -> BoxFuture<'a, Result<bool, ProviderError>> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(self.delete_delay).await;
            match id {
                "missing" => Ok(false),
                "forbidden" => Err(ProviderError::PermissionDenied("not your item".into())),
                _ => Ok(true),
            }
        }
        .boxed()
    }
}

/// Creates a layer over `backend`.
///
/// The `update_config` closure can modify the default configuration before the layer is created.
pub fn setup_layer(
    backend: StubBackend,
    update_config: impl FnOnce(&mut Config),
) -> (SyncLayer, Arc<StubBackend>) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);
    config.validate().unwrap();

    let backend = Arc::new(backend);
    let layer = SyncLayer::with_backend(&config, backend.clone());
    (layer, backend)
}

/// Backend configuration pointing at the `mock` server.
pub fn backend_config(mock: &MockBackend) -> BackendConfig {
    BackendConfig {
        url: mock.url(),
        api_key: "anon-key".into(),
        bucket: "photos".into(),
        items_table: "items".into(),
    }
}

/// Lets spawned tasks, like the auth event listener, catch up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
