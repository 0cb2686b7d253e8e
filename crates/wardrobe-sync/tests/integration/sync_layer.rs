use std::time::Duration;

use tokio::time::{self, Instant};

use wardrobe_sync::dedup::RunError;
use wardrobe_sync::providers::ProviderError;
use wardrobe_sync::types::{AuthEvent, AuthEventKind, Session};

use crate::{StubBackend, settle, setup_layer};

fn alice() -> Session {
    Session::new("token-alice", "alice")
}

#[tokio::test(start_paused = true)]
async fn test_signed_url_is_cached() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});

    let first = layer.signed_url("alice/shirt.jpg").await.unwrap();
    let second = layer.signed_url("alice/shirt.jpg").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.sign_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_signed_url_is_renewed_within_buffer() {
    let (layer, backend) = setup_layer(StubBackend::default(), |config| {
        config.signed_urls.ttl = Duration::from_secs(300);
        config.signed_urls.expiry_buffer = Duration::from_secs(60);
    });

    let first = layer.signed_url("alice/shirt.jpg").await.unwrap();

    time::advance(Duration::from_secs(239)).await;
    assert_eq!(layer.signed_url("alice/shirt.jpg").await.unwrap(), first);

    time::advance(Duration::from_secs(1)).await;
    let renewed = layer.signed_url("alice/shirt.jpg").await.unwrap();
    assert_ne!(renewed, first);
    assert_eq!(backend.sign_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_signing_is_not_cached() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});

    assert_eq!(layer.signed_url("missing/shirt.jpg").await, None);
    assert_eq!(layer.signed_url("missing/shirt.jpg").await, None);
    assert_eq!(backend.sign_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_signed_urls_keep_order() {
    let (layer, _backend) = setup_layer(StubBackend::default(), |_| {});

    let urls = layer
        .signed_urls(&["alice/shirt.jpg", "missing/hat.jpg", "alice/shoes.jpg"])
        .await;

    assert_eq!(urls.len(), 3);
    assert!(urls[0].as_deref().unwrap().contains("alice/shirt.jpg"));
    assert_eq!(urls[1], None);
    assert!(urls[2].as_deref().unwrap().contains("alice/shoes.jpg"));
}

#[tokio::test(start_paused = true)]
async fn test_auth_event_replaces_session_without_lookup() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});

    backend.emit(AuthEvent::signed_in(alice()));
    settle().await;

    let session = layer.current_session().await.unwrap();
    assert_eq!(session.user_id.as_deref(), Some("alice"));
    assert_eq!(backend.session_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_session_lookups_share_one_fetch() {
    let stub = StubBackend::default();
    stub.set_session(Some(alice()));
    let (layer, backend) = setup_layer(stub, |_| {});

    let (a, b, c) = tokio::join!(
        layer.current_session(),
        layer.current_session(),
        layer.current_session(),
    );

    assert_eq!(backend.session_calls(), 1);
    for session in [a, b, c] {
        assert_eq!(session.unwrap().user_id.as_deref(), Some("alice"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_ensure_auth_ready_gives_up() {
    let stub = StubBackend::default().with_session_delay(Duration::from_secs(5));
    stub.set_session(Some(alice()));
    let (layer, backend) = setup_layer(stub, |_| {});

    let start = Instant::now();
    let session = layer.ensure_auth_ready(Duration::from_secs(3)).await;
    let elapsed = start.elapsed();

    assert_eq!(session, None);
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));

    // the lookup carries on and fills the cache
    time::sleep(Duration::from_secs(3)).await;
    let session = layer.ensure_auth_ready(Duration::from_secs(3)).await;
    assert_eq!(session.unwrap().user_id.as_deref(), Some("alice"));
    assert_eq!(backend.session_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_drops_signed_urls() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});
    backend.emit(AuthEvent::signed_in(alice()));
    settle().await;

    let before = layer.signed_url("alice/shirt.jpg").await.unwrap();

    backend.emit(AuthEvent::signed_out());
    settle().await;

    let after = layer.signed_url("alice/shirt.jpg").await.unwrap();
    assert_ne!(before, after);
    assert_eq!(backend.sign_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_while_signing_does_not_cache_url() {
    let stub = StubBackend::default().with_sign_delay(Duration::from_millis(100));
    let (layer, backend) = setup_layer(stub, |_| {});
    backend.emit(AuthEvent::signed_in(alice()));
    settle().await;

    let (before, ()) = tokio::join!(layer.signed_url("alice/shirt.jpg"), async {
        time::sleep(Duration::from_millis(10)).await;
        backend.emit(AuthEvent::signed_out());
        settle().await;
    });

    // the caller that asked before the sign-out still gets its URL
    let before = before.unwrap();

    let after = layer.signed_url("alice/shirt.jpg").await.unwrap();
    assert_ne!(before, after);
    assert_eq!(backend.sign_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_token_refresh_keeps_signed_urls() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});
    backend.emit(AuthEvent::signed_in(alice()));
    settle().await;

    let before = layer.signed_url("alice/shirt.jpg").await.unwrap();

    backend.emit(AuthEvent {
        kind: AuthEventKind::TokenRefreshed,
        session: Some(Session::new("token-alice-2", "alice")),
    });
    settle().await;

    assert_eq!(layer.signed_url("alice/shirt.jpg").await.unwrap(), before);
    assert_eq!(backend.sign_calls(), 1);

    let session = layer.current_session().await.unwrap();
    assert_eq!(session.access_token.as_deref(), Some("token-alice-2"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_deletes_share_one_call() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});
    let paths = vec!["alice/shirt.jpg".to_owned()];

    let (a, b) = tokio::join!(
        layer.delete_item("item-1", &paths),
        layer.delete_item("item-1", &paths),
    );

    assert_eq!(a, Ok(true));
    assert_eq!(b, Ok(true));
    assert_eq!(backend.delete_calls(), 1);

    // once settled, the next delete goes through again
    assert_eq!(layer.delete_item("item-1", &paths).await, Ok(true));
    assert_eq!(backend.delete_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_delete_times_out() {
    let stub = StubBackend::default().with_delete_delay(Duration::from_secs(2));
    let (layer, backend) = setup_layer(stub, |config| {
        config.operations.delete_timeout = Duration::from_secs(1);
    });

    let start = Instant::now();
    let (a, b) = tokio::join!(
        layer.delete_item("item-1", &[]),
        layer.delete_item("item-1", &[]),
    );
    let elapsed = start.elapsed();

    assert_eq!(a, Err(RunError::Timeout(Duration::from_secs(1))));
    assert_eq!(b, a);
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    assert_eq!(backend.delete_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_outcomes() {
    let (layer, _backend) = setup_layer(StubBackend::default(), |_| {});

    assert_eq!(layer.delete_item("missing", &[]).await, Ok(false));
    assert_eq!(
        layer.delete_item("forbidden", &[]).await,
        Err(RunError::Failed(ProviderError::PermissionDenied(
            "not your item".into()
        )))
    );
}

#[tokio::test(start_paused = true)]
async fn test_delete_drops_signed_urls_of_photos() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});
    let before = layer.signed_url("alice/shirt.jpg").await.unwrap();
    let other = layer.signed_url("alice/hat.jpg").await.unwrap();

    let paths = vec!["alice/shirt.jpg".to_owned()];
    assert_eq!(layer.delete_item("item-1", &paths).await, Ok(true));

    assert_ne!(layer.signed_url("alice/shirt.jpg").await.unwrap(), before);
    assert_eq!(layer.signed_url("alice/hat.jpg").await.unwrap(), other);
    assert_eq!(backend.sign_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_deduplicated_with_custom_operation() {
    let (layer, _backend) = setup_layer(StubBackend::default(), |_| {});
    let timeout = Duration::from_secs(1);

    let (a, b) = tokio::join!(
        layer.run_deduplicated("archive:item-1", timeout, || async {
            time::sleep(Duration::from_millis(10)).await;
            Ok(true)
        }),
        layer.run_deduplicated("archive:item-1", timeout, || async { Ok(false) }),
    );

    assert_eq!(a, Ok(true));
    assert_eq!(b, Ok(true));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_event_listener() {
    let (layer, backend) = setup_layer(StubBackend::default(), |_| {});

    layer.shutdown().await;
    assert!(layer.is_shut_down());

    backend.emit(AuthEvent::signed_in(alice()));
    settle().await;

    // the event went nowhere, so the session has to be looked up
    assert_eq!(layer.current_session().await, None);
    assert_eq!(backend.session_calls(), 1);

    // caches keep working after shutdown
    assert!(layer.signed_url("alice/shirt.jpg").await.is_some());
}
