//! The remote collaborators of the sync layer.
//!
//! The caches never talk to the network themselves. They call into these traits, which are
//! implemented by [`HttpBackend`] for the real backend and by stubs in tests.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::types::{AuthEvent, Session, SignedUrl};

mod http;

pub use http::{BackendConfig, HttpBackend};

/// An error returned by one of the remote providers.
///
/// The error is [`Clone`] so that a single failed operation can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The requested object or row does not exist.
    #[error("not found")]
    NotFound,
    /// There is no valid session to authorize the request with.
    #[error("not authenticated")]
    Unauthenticated,
    /// The backend refused the request.
    ///
    /// The attached string contains the backend's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The request did not reach the backend, or the backend failed to answer it.
    #[error("request failed: {0}")]
    Transport(String),
    /// The backend answered with something we could not understand.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Looks up the current session and announces changes to it.
pub trait SessionProvider: Send + Sync + 'static {
    /// Fetches the current session, `None` if nobody is signed in.
    fn fetch_session(&self) -> BoxFuture<'_, Result<Option<Session>, ProviderError>>;

    /// Subscribes to sign-in and sign-out notifications.
    fn auth_events(&self) -> BoxStream<'static, AuthEvent>;
}

/// Issues signed URLs for private objects in storage.
pub trait SignedUrlProvider: Send + Sync + 'static {
    fn create_signed_url<'a>(
        &'a self,
        path: &'a str,
        expires_in: Duration,
    ) -> BoxFuture<'a, Result<SignedUrl, ProviderError>>;
}

/// Deletes a wardrobe item together with its stored photos.
pub trait DeleteProvider: Send + Sync + 'static {
    /// Returns `true` if the item was deleted.
    fn delete_resource<'a>(
        &'a self,
        id: &'a str,
        paths: &'a [String],
    ) -> BoxFuture<'a, Result<bool, ProviderError>>;
}
