//! Helpers for testing the sync layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`MockBackend`], make sure that it is held until all requests to it have been
//!    made. Dropping it shuts the server down and all further requests fail with a connection
//!    error. Assign it to a variable: `let backend = MockBackend::new();`.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

/// The only access token the [`MockBackend`] accepts.
pub const VALID_TOKEN: &str = "valid-token";

/// The user id the [`MockBackend`] reports for [`VALID_TOKEN`].
pub const USER_ID: &str = "user-1";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `wardrobe_sync` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("wardrobe_sync=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// An HTTP server listening on an ephemeral local port.
///
/// The server is shut down when this is dropped.
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Spawns the `router` onto the current runtime.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct MockState {
    delete_delay: Duration,
    signed: AtomicUsize,
}

/// A stand-in for the hosted backend, speaking the auth, storage and REST endpoints.
///
/// - `GET /auth/v1/user` knows a single user, authenticated by [`VALID_TOKEN`].
/// - `POST /storage/v1/object/sign/{bucket}/{path}` signs every path except ones starting with
///   `missing/`, which are `404`. Every signature is unique.
/// - `DELETE /storage/v1/object/{bucket}` always succeeds.
/// - `DELETE /rest/v1/{table}?id=eq.{id}` deletes every id except `missing` (no rows) and
///   `forbidden` (`403`), after the configured delay.
///
/// Every request requires an `apikey` header and is counted by method and path.
pub struct MockBackend {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_delete_delay(Duration::ZERO)
    }

    /// Creates a backend whose row deletions take `delay` to complete.
    pub fn with_delete_delay(delay: Duration) -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let key = format!("{} {}", req.method(), uri.path());
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(key).or_default() += 1;
                    }

                    if !req.headers().contains_key("apikey") {
                        return StatusCode::UNAUTHORIZED.into_response();
                    }
                    next.run(req).await
                }
            }
        };

        let state = Arc::new(MockState {
            delete_delay: delay,
            ..Default::default()
        });

        let router = Router::new()
            .route("/auth/v1/user", get(user))
            .route("/storage/v1/object/sign/:bucket/*path", post(sign))
            .route("/storage/v1/object/:bucket", delete(remove_objects))
            .route("/rest/v1/:table", delete(delete_rows))
            .layer(middleware::from_fn(hitcounter))
            .with_state(state);

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The number of requests received since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// All requests received since the last call by `"METHOD /path"`, and resets the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// The project URL to configure the client with.
    pub fn url(&self) -> Url {
        self.server.url("/")
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn user(headers: HeaderMap) -> Response {
    let expected = format!("Bearer {VALID_TOKEN}");
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == expected);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "msg": "invalid JWT" })),
        )
            .into_response();
    }

    Json(json!({
        "id": USER_ID,
        "email": "user@example.com",
        "role": "authenticated",
    }))
    .into_response()
}

async fn sign(
    State(state): State<Arc<MockState>>,
    extract::Path((bucket, path)): extract::Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if path.starts_with("missing/") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "message": "Object not found" })),
        )
            .into_response();
    }

    if body.get("expiresIn").and_then(|v| v.as_u64()).is_none() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let n = state.signed.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "signedURL": format!("/object/sign/{bucket}/{path}?token=t{n}") })).into_response()
}

async fn remove_objects(Json(body): Json<serde_json::Value>) -> Response {
    match body.get("prefixes").and_then(|v| v.as_array()) {
        Some(prefixes) => Json(prefixes.clone()).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[derive(Deserialize)]
struct RowFilter {
    id: String,
}

async fn delete_rows(
    State(state): State<Arc<MockState>>,
    extract::Query(filter): extract::Query<RowFilter>,
) -> Response {
    tokio::time::sleep(state.delete_delay).await;

    match filter.id.strip_prefix("eq.") {
        Some("missing") => Json(json!([])).into_response(),
        Some("forbidden") => (
            StatusCode::FORBIDDEN,
            "new row violates row-level security policy",
        )
            .into_response(),
        Some(id) => Json(json!([{ "id": id }])).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}
