//! Access to a hosted backend with auth, object storage and a REST table API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use url::Url;

use super::{DeleteProvider, ProviderError, SessionProvider, SignedUrlProvider};
use crate::types::{AuthEvent, Session, SignedUrl};

const USER_AGENT: &str = concat!("wardrobe-sync/", env!("CARGO_PKG_VERSION"));

/// Connection details of the backend.
#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    /// The project URL, e.g. `https://project.example.co`.
    pub url: Url,
    /// The public API key sent with every request.
    pub api_key: String,
    /// The storage bucket holding the item photos.
    pub bucket: String,
    /// The table holding the wardrobe items.
    #[serde(default = "default_items_table")]
    pub items_table: String,
}

fn default_items_table() -> String {
    "items".into()
}

#[derive(Serialize)]
struct SignRequest {
    #[serde(rename = "expiresIn")]
    expires_in: u64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

#[derive(Serialize)]
struct RemoveObjects<'a> {
    prefixes: &'a [String],
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// A client for the backend implementing all provider traits.
///
/// The backend itself is stateless. The access token of the signed in user is held here and set
/// with [`sign_in`](Self::sign_in), which also notifies every subscriber of
/// [`auth_events`](SessionProvider::auth_events).
#[derive(Debug)]
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
    access_token: Mutex<Option<Arc<str>>>,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to create HTTP client")?;
        let (events, _) = broadcast::channel(16);

        Ok(Self {
            client,
            config,
            access_token: Mutex::new(None),
            events,
        })
    }

    /// Authenticates with the given access token.
    ///
    /// The token is verified against the backend first. Only a token that resolves to a user is
    /// kept and announced as [`SignedIn`](crate::types::AuthEventKind::SignedIn).
    pub async fn sign_in(&self, access_token: &str) -> Result<Session, ProviderError> {
        let Some(session) = self.lookup_user(access_token).await? else {
            return Err(ProviderError::Unauthenticated);
        };

        *self.access_token.lock().unwrap() = Some(access_token.into());
        tracing::debug!(user_id = ?session.user_id, "Signed in");
        self.events.send(AuthEvent::signed_in(session.clone())).ok();
        Ok(session)
    }

    /// Forgets the access token and announces the sign out.
    pub fn sign_out(&self) {
        self.access_token.lock().unwrap().take();
        tracing::debug!("Signed out");
        self.events.send(AuthEvent::signed_out()).ok();
    }

    fn token(&self) -> Option<Arc<str>> {
        self.access_token.lock().unwrap().clone()
    }

    /// Builds a URL below the project URL, appending each of `segments` as path segments.
    fn endpoint<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> Result<Url, ProviderError> {
        let mut url = self.config.url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Malformed("backend URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Attaches the api key and the bearer token, falling back to the api key for anonymous calls.
    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = match self.token() {
            Some(token) => token.to_string(),
            None => self.config.api_key.clone(),
        };
        builder
            .header("apikey", &self.config.api_key)
            .bearer_auth(bearer)
    }

    async fn lookup_user(&self, access_token: &str) -> Result<Option<Session>, ProviderError> {
        let url = self.endpoint(["auth", "v1", "user"])?;
        let response = self
            .client
            .get(url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(request_error)?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Ok(None);
        }

        let user: UserResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;

        Ok(Some(Session {
            access_token: Some(access_token.to_owned()),
            user_id: Some(user.id),
            expires_at: None,
            extra: user.extra,
        }))
    }

    /// Makes a storage-relative signed URL absolute.
    fn absolute_signed_url(&self, signed: &str) -> Result<String, ProviderError> {
        if Url::parse(signed).is_ok() {
            return Ok(signed.to_owned());
        }
        let base = self.config.url.as_str().trim_end_matches('/');
        let signed = signed.trim_start_matches('/');
        Ok(format!("{base}/storage/v1/{signed}"))
    }

    async fn sign(&self, path: &str, expires_in: Duration) -> Result<SignedUrl, ProviderError> {
        let segments = ["storage", "v1", "object", "sign", self.config.bucket.as_str()];
        let url = self.endpoint(segments.into_iter().chain(path.split('/')))?;

        let response = self
            .authorize(self.client.post(url))
            .json(&SignRequest {
                expires_in: expires_in.as_secs(),
            })
            .send()
            .await
            .map_err(request_error)?;

        let body: SignResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;

        Ok(SignedUrl {
            url: self.absolute_signed_url(&body.signed_url)?,
            expires_in,
        })
    }

    async fn delete(&self, id: &str, paths: &[String]) -> Result<bool, ProviderError> {
        if !paths.is_empty() {
            let url = self.endpoint(["storage", "v1", "object", self.config.bucket.as_str()])?;
            let response = self
                .authorize(self.client.delete(url))
                .json(&RemoveObjects { prefixes: paths })
                .send()
                .await
                .map_err(request_error)?;
            check_status(response).await?;
            tracing::debug!(id, photos = paths.len(), "Removed item photos");
        }

        let mut url = self.endpoint(["rest", "v1", self.config.items_table.as_str()])?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        let response = self
            .authorize(self.client.delete(url))
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(request_error)?;

        let deleted: Vec<serde_json::Value> = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;

        Ok(!deleted.is_empty())
    }
}

impl SessionProvider for HttpBackend {
    fn fetch_session(&self) -> BoxFuture<'_, Result<Option<Session>, ProviderError>> {
        async move {
            match self.token() {
                Some(token) => self.lookup_user(&token).await,
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn auth_events(&self) -> BoxStream<'static, AuthEvent> {
        let receiver = self.events.subscribe();
        futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Auth event subscriber fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl SignedUrlProvider for HttpBackend {
    fn create_signed_url<'a>(
        &'a self,
        path: &'a str,
        expires_in: Duration,
    ) -> BoxFuture<'a, Result<SignedUrl, ProviderError>> {
        self.sign(path, expires_in).boxed()
    }
}

impl DeleteProvider for HttpBackend {
    fn delete_resource<'a>(
        &'a self,
        id: &'a str,
        paths: &'a [String],
    ) -> BoxFuture<'a, Result<bool, ProviderError>> {
        self.delete(id, paths).boxed()
    }
}

/// Maps non-success responses to the matching [`ProviderError`].
async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound,
        StatusCode::UNAUTHORIZED => ProviderError::Unauthenticated,
        StatusCode::FORBIDDEN => ProviderError::PermissionDenied(body),
        _ => ProviderError::Transport(format!("{status}: {body}")),
    })
}

fn request_error(err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Malformed(err.to_string())
    } else {
        ProviderError::Transport(err.to_string())
    }
}
