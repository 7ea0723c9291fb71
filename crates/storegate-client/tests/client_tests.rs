//! Client tests against a live server on an ephemeral port
//!
//! Author: hephaex@gmail.com

use std::time::Duration;
use storegate_api::email::EmailKind;
use storegate_api::testing::{test_config, TestHarness};
use storegate_client::{ClientError, StoregateClient};
use storegate_core::{Role, WindowBudget};

const PASSWORD: &str = "Str0ng!Passw0rd";

#[tokio::test]
async fn test_register_verify_login_and_me() {
    let harness = TestHarness::new();
    let (base_url, _server) = harness.spawn_server().await;
    let client = StoregateClient::new(base_url).unwrap();

    let user = client
        .register("buyer@example.com", PASSWORD, "Buyer")
        .await
        .unwrap();
    assert_eq!(user.email, "buyer@example.com");
    assert!(!user.email_verified);

    let token = harness
        .emails
        .last_token("buyer@example.com", EmailKind::Verification)
        .unwrap();
    client.verify_email(&token).await.unwrap();

    let tokens = client.login("buyer@example.com", PASSWORD).await.unwrap();
    assert_eq!(tokens.user.as_ref().unwrap().role, "customer");

    let me = client.me().await.unwrap();
    assert_eq!(me.id, user.id);
    assert!(me.email_verified);

    let sessions = client.sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].current);
}

#[tokio::test]
async fn test_stale_csrf_token_is_replaced_once() {
    let harness = TestHarness::new();
    harness
        .seed_identity("buyer@example.com", PASSWORD, Role::Customer)
        .await;
    let (base_url, _server) = harness.spawn_server().await;
    let client = StoregateClient::new(base_url).unwrap();

    client.fetch_csrf_token().await.unwrap();
    client.set_csrf_token("stale-token");

    client.login("buyer@example.com", PASSWORD).await.unwrap();
    assert!(client.tokens().is_some());
}

#[tokio::test]
async fn test_csrf_retry_happens_exactly_once() {
    // Four /api requests fit: token fetch, attempt, token re-fetch, retry
    let mut config = test_config();
    config.rate_limit.global = WindowBudget::new(4, 900);
    let harness = TestHarness::with_config(config);
    let (base_url, _server) = harness.spawn_server().await;

    // The server never sees the token under this header name
    let client = StoregateClient::new(base_url)
        .unwrap()
        .with_csrf_header("x-wrong-header");

    let err = client
        .login("buyer@example.com", PASSWORD)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("CSRF_MISSING"));

    let err = client.fetch_csrf_token().await.unwrap_err();
    assert_eq!(err.code(), Some("RATE_LIMITED"));
    assert!(matches!(
        err,
        ClientError::Api {
            retry_after_secs: Some(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_expired_access_token_refreshed_and_retried() {
    let mut config = test_config();
    config.auth.access_token_ttl_secs = 1;
    config.auth.clock_skew_secs = 0;
    let harness = TestHarness::with_config(config);
    harness
        .seed_identity("buyer@example.com", PASSWORD, Role::Customer)
        .await;
    let (base_url, _server) = harness.spawn_server().await;
    let client = StoregateClient::new(base_url).unwrap();

    let first = client.login("buyer@example.com", PASSWORD).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let me = client.me().await.unwrap();
    assert_eq!(me.email, "buyer@example.com");

    let current = client.tokens().unwrap();
    assert_ne!(current.access_token, first.access_token);
    assert_ne!(current.refresh_token, first.refresh_token);
}

#[tokio::test]
async fn test_expired_token_on_mutating_call_refreshes_then_retries() {
    let mut config = test_config();
    config.auth.access_token_ttl_secs = 1;
    config.auth.clock_skew_secs = 0;
    let harness = TestHarness::with_config(config);
    harness
        .seed_identity("buyer@example.com", PASSWORD, Role::Customer)
        .await;
    let (base_url, _server) = harness.spawn_server().await;
    let client = StoregateClient::new(base_url).unwrap();

    client.login("buyer@example.com", PASSWORD).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2100)).await;

    // Logout is a CSRF-guarded POST; the refresh in between is one too
    client.logout().await.unwrap();
    assert!(client.tokens().is_none());
}

#[tokio::test]
async fn test_non_recoverable_errors_are_returned() {
    let harness = TestHarness::new();
    harness
        .seed_identity("buyer@example.com", PASSWORD, Role::Customer)
        .await;
    let (base_url, _server) = harness.spawn_server().await;
    let client = StoregateClient::new(base_url).unwrap();

    assert!(matches!(
        client.me().await,
        Err(ClientError::NotAuthenticated)
    ));

    let err = client
        .login("buyer@example.com", "Wr0ng!Password")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("INVALID_CREDENTIALS"));

    client.login("buyer@example.com", PASSWORD).await.unwrap();
    let err = client
        .get_json::<serde_json::Value>("/api/v1/admin/users")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("INSUFFICIENT_ROLE"));
}

#[tokio::test]
async fn test_logout_all_forgets_tokens() {
    let harness = TestHarness::new();
    harness
        .seed_identity("buyer@example.com", PASSWORD, Role::Customer)
        .await;
    let (base_url, _server) = harness.spawn_server().await;
    let client = StoregateClient::new(base_url).unwrap();

    client.login("buyer@example.com", PASSWORD).await.unwrap();
    assert_eq!(client.logout_all().await.unwrap(), 1);
    assert!(client.tokens().is_none());

    let err = client.refresh().await.unwrap_err();
    assert!(matches!(err, ClientError::NotAuthenticated));
}
