//! A single-flight cache for the current auth session.
//!
//! Many parts of the UI want to know who is signed in, usually all at once while a screen
//! renders. The [`SessionCache`] answers from memory while it holds a usable session, and
//! otherwise makes sure that only one lookup against the [`SessionProvider`] is running at any
//! time. Every caller that arrives while a lookup is running waits for that same lookup.
//!
//! Auth events (sign in, sign out, token refresh) replace the cached session immediately. A lookup
//! that was started before the event is not allowed to write its now outdated result back.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::providers::SessionProvider;
use crate::types::{AuthEvent, Session};
use crate::utils::futures::{m, measure};

// A shared future so that every waiting caller can poll the same lookup without holding the lock.
type SessionChannel = Shared<oneshot::Receiver<Option<Arc<Session>>>>;

enum CacheState {
    /// Nothing cached, nothing running.
    Empty,
    /// A lookup is running, all callers join it.
    Fetching(SessionChannel),
    /// The result of the last lookup or auth event. `None` means signed out.
    Ready(Option<Arc<Session>>),
}

struct Inner {
    state: CacheState,
    /// Bumped on every auth event, so lookups started earlier can tell that they are stale.
    generation: u64,
}

/// Caches the current session and coalesces concurrent lookups.
///
/// Cloning is cheap and every clone shares the same cached session.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<Mutex<Inner>>,
    provider: Arc<dyn SessionProvider>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.try_lock() {
            Ok(inner) => match inner.state {
                CacheState::Empty => "empty",
                CacheState::Fetching(_) => "fetching",
                CacheState::Ready(Some(_)) => "signed in",
                CacheState::Ready(None) => "signed out",
            },
            Err(_) => "locked",
        };
        f.debug_struct("SessionCache")
            .field("state", &state)
            .finish()
    }
}

impl SessionCache {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CacheState::Empty,
                generation: 0,
            })),
            provider,
        }
    }

    /// Returns the current session, `None` if nobody is signed in.
    ///
    /// A cached session with a usable token is returned without any I/O. Otherwise this joins the
    /// running lookup, or starts one if none is running. A failed lookup resolves to `None` and is
    /// not retried until the next call.
    pub async fn current_session(&self) -> Option<Arc<Session>> {
        metric!(counter("session.access") += 1);

        let channel = {
            let mut inner = self.inner.lock().unwrap();
            if let CacheState::Ready(Some(session)) = &inner.state {
                if session.is_usable() {
                    metric!(counter("session.cache.hit") += 1);
                    return Some(Arc::clone(session));
                }
            }

            if let CacheState::Fetching(channel) = &inner.state {
                metric!(counter("session.joined") += 1);
                channel.clone()
            } else {
                self.spawn_fetch(&mut inner)
            }
        };

        // The lookup task never drops its sender without sending, except on runtime shutdown.
        channel.await.unwrap_or_default()
    }

    /// Returns the current session, giving up after `timeout`.
    ///
    /// A cached session is returned right away. Otherwise a lookup is raced against the timeout,
    /// and a timeout yields `None`: callers should carry on as if nobody was signed in. The lookup
    /// itself keeps running and will still populate the cache.
    pub async fn ensure_ready(&self, timeout: Duration) -> Option<Arc<Session>> {
        if let Some(session) = self.peek().filter(|session| session.is_usable()) {
            return Some(session);
        }

        match tokio::time::timeout(timeout, self.current_session()).await {
            Ok(session) => session,
            Err(_) => {
                metric!(counter("session.ready_timeout") += 1);
                tracing::warn!(
                    timeout = %humantime::format_duration(timeout),
                    "Could not confirm the session in time, continuing unauthenticated",
                );
                None
            }
        }
    }

    /// Returns the cached session without looking anything up.
    pub fn peek(&self) -> Option<Arc<Session>> {
        match &self.inner.lock().unwrap().state {
            CacheState::Ready(session) => session.clone(),
            CacheState::Empty | CacheState::Fetching(_) => None,
        }
    }

    /// Replaces the cached session with the one carried by `event`.
    ///
    /// Any running lookup is detached: callers already waiting on it still get its result, but
    /// the result is not cached and new callers will not join it.
    pub fn apply_event(&self, event: &AuthEvent) {
        metric!(counter("session.event") += 1, "kind" => event.kind.as_str());
        tracing::debug!(kind = event.kind.as_str(), "Applying auth event");

        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.state = CacheState::Ready(event.session.clone().map(Arc::new));
    }

    /// Starts a lookup and registers it as the running one.
    fn spawn_fetch(&self, inner: &mut Inner) -> SessionChannel {
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        inner.state = CacheState::Fetching(channel.clone());

        let generation = inner.generation;
        let provider = Arc::clone(&self.provider);
        let shared = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let lookup = AssertUnwindSafe(provider.fetch_session()).catch_unwind();
            let result = measure("session.fetch", m::result, lookup).await;

            let session = match result {
                Ok(Ok(session)) => {
                    let status = if session.is_some() { "ok" } else { "none" };
                    metric!(counter("session.fetch") += 1, "status" => status);
                    session.map(Arc::new)
                }
                Ok(Err(err)) => {
                    metric!(counter("session.fetch") += 1, "status" => "err");
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Failed to fetch session"
                    );
                    None
                }
                Err(_panic) => {
                    metric!(counter("session.fetch") += 1, "status" => "panic");
                    tracing::error!("Session provider panicked");
                    None
                }
            };

            {
                let mut inner = shared.lock().unwrap();
                if inner.generation == generation {
                    inner.state = CacheState::Ready(session.clone());
                } else {
                    tracing::debug!("Discarding session lookup that was overtaken by an auth event");
                }
            }

            sender.send(session).ok();
        });

        channel
    }
}
