use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use wardrobe_sync::SyncLayer;
use wardrobe_sync::config::Config;
use wardrobe_sync::providers::{
    DeleteProvider, HttpBackend, ProviderError, SessionProvider, SignedUrlProvider,
};
use wardrobe_sync::types::AuthEventKind;

use crate::{MockBackend, USER_ID, VALID_TOKEN, backend_config};

fn setup_backend() -> (MockBackend, HttpBackend) {
    wardrobe_sync_test::setup();
    let mock = MockBackend::new();
    let backend = HttpBackend::new(backend_config(&mock)).unwrap();
    (mock, backend)
}

#[tokio::test]
async fn test_session_requires_sign_in() {
    let (mock, backend) = setup_backend();

    assert_eq!(backend.fetch_session().await, Ok(None));
    assert_eq!(mock.accesses(), 0);

    let mut events = backend.auth_events();
    let session = backend.sign_in(VALID_TOKEN).await.unwrap();
    assert_eq!(session.user_id.as_deref(), Some(USER_ID));
    assert_eq!(session.access_token.as_deref(), Some(VALID_TOKEN));
    assert_eq!(session.extra["email"], "user@example.com");

    let event = events.next().await.unwrap();
    assert_eq!(event.kind, AuthEventKind::SignedIn);
    assert_eq!(event.session.as_ref(), Some(&session));

    let fetched = backend.fetch_session().await.unwrap().unwrap();
    assert_eq!(fetched, session);
    assert_eq!(
        mock.all_hits(),
        vec![("GET /auth/v1/user".to_owned(), 2)]
    );

    backend.sign_out();
    assert_eq!(events.next().await.unwrap().kind, AuthEventKind::SignedOut);
    assert_eq!(backend.fetch_session().await, Ok(None));
}

#[tokio::test]
async fn test_invalid_token_is_rejected() {
    let (_mock, backend) = setup_backend();

    let result = backend.sign_in("expired-token").await;
    assert_eq!(result, Err(ProviderError::Unauthenticated));
    assert_eq!(backend.fetch_session().await, Ok(None));
}

#[tokio::test]
async fn test_create_signed_url() {
    let (mock, backend) = setup_backend();

    let signed = backend
        .create_signed_url("user-1/shirt.jpg", Duration::from_secs(3600))
        .await
        .unwrap();

    let expected = format!(
        "{}storage/v1/object/sign/photos/user-1/shirt.jpg?token=t0",
        mock.url()
    );
    assert_eq!(signed.url, expected);
    assert_eq!(signed.expires_in, Duration::from_secs(3600));
    assert_eq!(
        mock.all_hits(),
        vec![(
            "POST /storage/v1/object/sign/photos/user-1/shirt.jpg".to_owned(),
            1
        )]
    );
}

#[tokio::test]
async fn test_signed_url_for_missing_object() {
    let (_mock, backend) = setup_backend();

    let result = backend
        .create_signed_url("missing/shirt.jpg", Duration::from_secs(60))
        .await;
    assert_eq!(result, Err(ProviderError::NotFound));
}

#[tokio::test]
async fn test_delete_resource() {
    let (mock, backend) = setup_backend();
    let paths = vec!["user-1/shirt.jpg".to_owned()];

    assert_eq!(backend.delete_resource("item-1", &paths).await, Ok(true));
    assert_eq!(
        mock.all_hits(),
        vec![
            ("DELETE /rest/v1/items".to_owned(), 1),
            ("DELETE /storage/v1/object/photos".to_owned(), 1),
        ]
    );

    // without photos, storage is left alone
    assert_eq!(backend.delete_resource("missing", &[]).await, Ok(false));
    assert_eq!(
        mock.all_hits(),
        vec![("DELETE /rest/v1/items".to_owned(), 1)]
    );

    let result = backend.delete_resource("forbidden", &[]).await;
    assert!(matches!(result, Err(ProviderError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_unreachable_backend() {
    wardrobe_sync_test::setup();
    let mock = MockBackend::new();
    let config = backend_config(&mock);
    drop(mock);

    let backend = HttpBackend::new(config).unwrap();
    let result = backend
        .create_signed_url("user-1/shirt.jpg", Duration::from_secs(60))
        .await;
    assert!(matches!(result, Err(ProviderError::Transport(_))));
}

#[tokio::test]
async fn test_layer_over_http() {
    let (mock, backend) = setup_backend();
    let backend = Arc::new(backend);
    let layer = SyncLayer::with_backend(&Config::default(), backend.clone());

    backend.sign_in(VALID_TOKEN).await.unwrap();
    let session = layer
        .ensure_auth_ready(Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(session.user_id.as_deref(), Some(USER_ID));

    let first = layer.signed_url("user-1/shirt.jpg").await.unwrap();
    let second = layer.signed_url("user-1/shirt.jpg").await.unwrap();
    assert_eq!(first, second);

    let paths = vec!["user-1/shirt.jpg".to_owned()];
    assert_eq!(layer.delete_item("item-1", &paths).await, Ok(true));

    let hits = mock.all_hits();
    let signs = hits
        .iter()
        .find(|(path, _)| path.starts_with("POST /storage/v1/object/sign/"))
        .map(|(_, count)| *count);
    assert_eq!(signs, Some(1));

    layer.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_deletes_over_http_share_one_request() {
    wardrobe_sync_test::setup();
    let mock = MockBackend::with_delete_delay(Duration::from_millis(200));
    let backend = Arc::new(HttpBackend::new(backend_config(&mock)).unwrap());
    let layer = SyncLayer::with_backend(&Config::default(), backend);

    let (a, b) = tokio::join!(
        layer.delete_item("item-1", &[]),
        layer.delete_item("item-1", &[]),
    );

    assert_eq!(a, Ok(true));
    assert_eq!(b, Ok(true));
    assert_eq!(
        mock.all_hits(),
        vec![("DELETE /rest/v1/items".to_owned(), 1)]
    );

    layer.shutdown().await;
}
