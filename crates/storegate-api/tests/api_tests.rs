//! API Integration Tests
//!
//! Every test runs the full router against the in-memory stores.
//!
//! Author: hephaex@gmail.com

mod common;

use axum::{
    http::{header, Method, StatusCode},
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use common::{TestClient, PASSWORD};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use storegate_api::email::EmailKind;
use storegate_api::error::error_details_middleware;
use storegate_api::middleware::timeout_middleware;
use storegate_api::testing::{test_config, TestHarness};
use storegate_core::{AuditFilter, AuditOutcome, PageRequest, Role, WindowBudget};

// =============================================================================
// Health Check Tests
// =============================================================================

#[tokio::test]
async fn test_health_check() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());

    let response = client.get("/health").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert!(response.body["version"].is_string());
}

#[tokio::test]
async fn test_readiness_follows_ready_flag() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());

    let response = client.get("/ready").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["ready"], true);
    assert_eq!(response.body["checks"]["store"], true);

    harness.state.set_ready(false);
    let response = client.get("/ready").await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body["ready"], false);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_prometheus_text() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());

    client.get("/health").await;
    let response = client.get("/metrics").await;
    assert_eq!(response.status, StatusCode::OK);
    let text = response.body.as_str().unwrap();
    assert!(text.contains("storegate_http_requests_total"));
}

#[tokio::test]
async fn test_openapi_document_served() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());

    let response = client.get("/api-docs/openapi.json").await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["paths"]["/api/v1/auth/login"].is_object());
}

// =============================================================================
// CSRF Tests
// =============================================================================

#[tokio::test]
async fn test_csrf_token_is_stable_per_session_cookie() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());

    let first = client.get("/api/v1/csrf-token").await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["success"], true);
    assert!(first.body["expires_in"].as_u64().unwrap() > 0);
    assert!(client.cookie("csrfSid").is_some());

    let second = client.get("/api/v1/csrf-token").await;
    assert_eq!(first.body["csrf_token"], second.body["csrf_token"]);
}

#[tokio::test]
async fn test_mutating_request_without_csrf_token_rejected() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());

    let response = client
        .post(
            "/api/v1/auth/login",
            json!({ "email": "a@example.com", "password": PASSWORD }),
        )
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.code(), "CSRF_MISSING");
    assert_eq!(response.body["success"], false);
}

#[tokio::test]
async fn test_csrf_token_from_other_session_rejected() {
    let harness = TestHarness::new();
    let mut alice = TestClient::new(harness.router.clone());
    let mut mallory = TestClient::new(harness.router.clone());

    alice.fetch_csrf().await;
    mallory.fetch_csrf().await;
    let alice_sid = alice.cookie("csrfSid").unwrap().to_string();
    mallory.set_cookie("csrfSid", &alice_sid);

    let response = mallory
        .post(
            "/api/v1/auth/login",
            json!({ "email": "a@example.com", "password": PASSWORD }),
        )
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.code(), "CSRF_INVALID");
}

// =============================================================================
// Registration and Login Tests
// =============================================================================

#[tokio::test]
async fn test_register_verify_and_login() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());
    client.fetch_csrf().await;

    let response = client
        .post(
            "/api/v1/auth/register",
            json!({ "email": "New.Shopper@Example.com", "password": PASSWORD, "name": "Shopper" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["user"]["email"], "new.shopper@example.com");
    assert_eq!(response.body["user"]["role"], "customer");
    assert_eq!(response.body["email_sent"], true);

    // Unverified accounts cannot log in
    let response = client.login("new.shopper@example.com", PASSWORD).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.code(), "ACCOUNT_UNAVAILABLE");

    let token = harness
        .emails
        .last_token("new.shopper@example.com", EmailKind::Verification)
        .unwrap();
    let response = client
        .get(&format!("/api/v1/auth/verify-email/{token}"))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let response = client
        .get(&format!("/api/v1/auth/verify-email/{token}"))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["message"], "Email is already verified");

    let response = client.login("NEW.SHOPPER@example.com", PASSWORD).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["token_type"], "Bearer");
    assert!(response.body["access_token"].is_string());
    assert!(client.cookie("accessToken").is_some());
    assert!(client.cookie("refreshToken").is_some());

    let refresh_cookie = &response.set_cookies("refreshToken")[0];
    assert_eq!(refresh_cookie.path(), Some("/api/v1"));
    assert_eq!(refresh_cookie.http_only(), Some(true));
}

#[tokio::test]
async fn test_register_duplicate_and_invalid_input() {
    let harness = TestHarness::new();
    harness
        .seed_identity("taken@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());
    client.fetch_csrf().await;

    let response = client
        .post(
            "/api/v1/auth/register",
            json!({ "email": "taken@example.com", "password": PASSWORD, "name": "Dup" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.code(), "CONFLICT");

    let response = client
        .post(
            "/api/v1/auth/register",
            json!({ "email": "not-an-email", "password": "short", "name": "" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.code(), "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_login_wrong_password_and_unknown_user_look_alike() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());

    let wrong = client.login("shopper@example.com", "Wr0ng!Password").await;
    let unknown = client.login("ghost@example.com", PASSWORD).await;

    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.code(), "INVALID_CREDENTIALS");
    assert_eq!(wrong.body["message"], unknown.body["message"]);
}

#[tokio::test]
async fn test_account_locks_after_repeated_failures() {
    let mut config = test_config();
    config.auth.max_failed_attempts = 3;
    let harness = TestHarness::with_config(config);
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());

    for _ in 0..3 {
        let response = client.login("shopper@example.com", "Wr0ng!Password").await;
        assert_eq!(response.code(), "INVALID_CREDENTIALS");
    }

    let response = client.login("shopper@example.com", PASSWORD).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.code(), "ACCOUNT_UNAVAILABLE");
}

// =============================================================================
// Session and Token Tests
// =============================================================================

#[tokio::test]
async fn test_me_with_cookie_and_bearer() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());
    let login = client.login("shopper@example.com", PASSWORD).await;
    let access = login.body["access_token"].as_str().unwrap().to_string();

    let response = client.get("/api/v1/auth/me").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["user"]["email"], "shopper@example.com");

    let mut bare = TestClient::new(harness.router.clone());
    let response = bare
        .send(Method::GET, "/api/v1/auth/me", None, Some(&access))
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_protected_route_rejections() {
    let harness = TestHarness::new();
    let mut client = TestClient::new(harness.router.clone());

    let response = client.get("/api/v1/auth/me").await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.code(), "UNAUTHENTICATED");

    let response = client
        .send(Method::GET, "/api/v1/auth/me", None, Some("not.a.jwt"))
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.code(), "TOKEN_INVALID");
}

#[tokio::test]
async fn test_refresh_rotates_and_detects_reuse() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());
    client.login("shopper@example.com", PASSWORD).await;
    let original = client.cookie("refreshToken").unwrap().to_string();

    let response = client.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::OK);
    let rotated = client.cookie("refreshToken").unwrap().to_string();
    assert_ne!(original, rotated);

    // Replaying the superseded token revokes the whole family
    client.set_cookie("refreshToken", &original);
    let response = client.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.code(), "REUSE_DETECTED");
    assert!(client.cookie("refreshToken").is_none());

    client.set_cookie("refreshToken", &rotated);
    let response = client.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_token_in_body() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut browser = TestClient::new(harness.router.clone());
    let login = browser.login("shopper@example.com", PASSWORD).await;
    let refresh = login.body["refresh_token"].as_str().unwrap().to_string();

    let mut api = TestClient::new(harness.router.clone());
    api.fetch_csrf().await;
    let response = api
        .post("/api/v1/auth/refresh", json!({ "refresh_token": refresh }))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["access_token"].is_string());
}

#[tokio::test]
async fn test_expired_access_token_rotates_transparently() {
    let mut config = test_config();
    config.auth.access_token_ttl_secs = 1;
    config.auth.clock_skew_secs = 0;
    let harness = TestHarness::with_config(config);
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());
    client.login("shopper@example.com", PASSWORD).await;
    let old_access = client.cookie("accessToken").unwrap().to_string();
    let old_refresh = client.cookie("refreshToken").unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let response = client.get("/api/v1/auth/me").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_ne!(client.cookie("accessToken").unwrap(), old_access);
    assert_ne!(client.cookie("refreshToken").unwrap(), old_refresh);

    // Without a refresh cookie the expiry is surfaced
    let mut bare = TestClient::new(harness.router.clone());
    let response = bare
        .send(Method::GET, "/api/v1/auth/me", None, Some(&old_access))
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.code(), "TOKEN_EXPIRED");

    // The refresh token consumed by the transparent rotation is now a replay
    client.set_cookie("refreshToken", &old_refresh);
    let response = client.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.code(), "REUSE_DETECTED");
}

#[tokio::test]
async fn test_logout_clears_cookies_and_revokes_session() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());
    client.login("shopper@example.com", PASSWORD).await;
    let refresh = client.cookie("refreshToken").unwrap().to_string();

    let response = client.post("/api/v1/auth/logout", json!({})).await;
    assert_eq!(response.status, StatusCode::OK);
    let cleared = response.set_cookies("accessToken");
    assert!(cleared[0].max_age().unwrap().is_zero());
    assert!(client.cookie("accessToken").is_none());
    assert!(client.cookie("refreshToken").is_none());

    client.set_cookie("refreshToken", &refresh);
    let response = client.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_sessions_listing_and_logout_all() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut laptop = TestClient::new(harness.router.clone());
    let mut phone = TestClient::new(harness.router.clone()).from_address("198.51.100.7");
    laptop.login("shopper@example.com", PASSWORD).await;
    phone.login("shopper@example.com", PASSWORD).await;

    let response = laptop.get("/api/v1/auth/sessions").await;
    let sessions = response.body["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s["current"] == true).count(), 1);

    let response = laptop.post("/api/v1/auth/logout-all", json!({})).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["sessions_revoked"], 2);

    let response = phone.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Password Recovery Tests
// =============================================================================

#[tokio::test]
async fn test_forgot_password_is_uniform_and_reset_revokes_sessions() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut device = TestClient::new(harness.router.clone());
    device.login("shopper@example.com", PASSWORD).await;

    let mut client = TestClient::new(harness.router.clone());
    client.fetch_csrf().await;
    let known = client
        .post(
            "/api/v1/auth/forgot-password",
            json!({ "email": "shopper@example.com" }),
        )
        .await;
    let unknown = client
        .post(
            "/api/v1/auth/forgot-password",
            json!({ "email": "ghost@example.com" }),
        )
        .await;
    assert_eq!(known.status, StatusCode::OK);
    assert_eq!(known.body, unknown.body);

    let token = harness
        .emails
        .last_token("shopper@example.com", EmailKind::PasswordReset)
        .unwrap();
    let new_password = "N3w!Passw0rd";
    let response = client
        .post(
            "/api/v1/auth/reset-password",
            json!({ "token": token, "new_password": new_password }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["sessions_revoked"], 1);

    // Tokens are single use
    let response = client
        .post(
            "/api/v1/auth/reset-password",
            json!({ "token": token, "new_password": "An0ther!Passw0rd" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let response = device.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    assert_eq!(
        client.login("shopper@example.com", PASSWORD).await.status,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        client.login("shopper@example.com", new_password).await.status,
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_change_password_requires_current_password() {
    let harness = TestHarness::new();
    harness
        .seed_identity("shopper@example.com", PASSWORD, Role::Customer)
        .await;
    let mut client = TestClient::new(harness.router.clone());
    client.login("shopper@example.com", PASSWORD).await;

    let response = client
        .post(
            "/api/v1/auth/change-password",
            json!({ "current_password": "Wr0ng!Password", "new_password": "N3w!Passw0rd" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let response = client
        .post(
            "/api/v1/auth/change-password",
            json!({ "current_password": PASSWORD, "new_password": "N3w!Passw0rd" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(client.cookie("accessToken").is_none());
}

// =============================================================================
// Rate Limit Tests
// =============================================================================

#[tokio::test]
async fn test_login_rate_limit_returns_retry_after() {
    let mut config = test_config();
    config.rate_limit.auth = WindowBudget::new(2, 900);
    let harness = TestHarness::with_config(config);
    let mut client = TestClient::new(harness.router.clone());
    client.fetch_csrf().await;

    for _ in 0..2 {
        let response = client.login("ghost@example.com", PASSWORD).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    let response = client.login("ghost@example.com", PASSWORD).await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.code(), "RATE_LIMITED");
    assert!(response.headers.contains_key(header::RETRY_AFTER));
    assert!(response.body["retry_after_secs"].as_u64().unwrap() > 0);

    // Budgets are per client address
    let mut other = TestClient::new(harness.router.clone()).from_address("198.51.100.20");
    let response = other.login("ghost@example.com", PASSWORD).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_forwarded_for_rotation_shares_one_budget() {
    let mut config = test_config();
    config.rate_limit.auth = WindowBudget::new(2, 900);
    let harness = TestHarness::with_config(config);
    let direct_peer = SocketAddr::from(([198, 51, 100, 50], 51_000));

    // Direct connections: the header is ignored and the socket peer is the key
    let mut rejected = 0;
    for i in 0..20 {
        let mut client = TestClient::new(harness.router.clone())
            .via_peer(direct_peer)
            .from_address(&format!("10.9.{i}.1"));
        if client.login("ghost@example.com", PASSWORD).await.status == StatusCode::TOO_MANY_REQUESTS {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 18);

    // Behind the trusted proxy: only the hop the proxy appended counts
    let mut rejected = 0;
    for i in 0..20 {
        let mut client = TestClient::new(harness.router.clone())
            .from_address(&format!("10.9.{i}.1, 198.51.100.30"));
        if client.login("ghost@example.com", PASSWORD).await.status == StatusCode::TOO_MANY_REQUESTS {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 18);
}

#[tokio::test]
async fn test_slow_request_times_out_with_envelope() {
    let mut config = test_config();
    config.server.request_timeout_secs = 1;
    let harness = TestHarness::with_config(config);

    let app = Router::new()
        .route(
            "/api/v1/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "done"
            }),
        )
        .layer(from_fn_with_state(harness.state.clone(), timeout_middleware))
        .layer(from_fn_with_state(harness.state.clone(), error_details_middleware));

    let mut client = TestClient::new(app);
    let response = client.get("/api/v1/slow").await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body["success"], false);
    assert_eq!(response.code(), "UPSTREAM_UNAVAILABLE");
    assert_eq!(response.body["details"], "request exceeded 1s");
}

// =============================================================================
// Admin Tests
// =============================================================================

async fn admin_client(harness: &TestHarness, email: &str, role: Role) -> (TestClient, uuid::Uuid) {
    let identity = harness.seed_identity(email, PASSWORD, role).await;
    let mut client = TestClient::new(harness.router.clone());
    let response = client.login(email, PASSWORD).await;
    assert_eq!(response.status, StatusCode::OK);
    (client, identity.id)
}

#[tokio::test]
async fn test_customer_denied_admin_routes_and_audited() {
    let harness = TestHarness::new();
    let (mut client, id) = admin_client(&harness, "shopper@example.com", Role::Customer).await;

    let response = client.get("/api/v1/admin/users").await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.code(), "INSUFFICIENT_ROLE");

    let filter = AuditFilter {
        actor_id: Some(id),
        outcome: Some(AuditOutcome::Denied),
        ..Default::default()
    };
    let page = harness
        .state
        .stores
        .audit
        .list(&filter, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].action, "admin.users.view");
}

#[tokio::test]
async fn test_moderator_sees_stats_only() {
    let harness = TestHarness::new();
    let (mut client, _) = admin_client(&harness, "mod@example.com", Role::Moderator).await;

    let response = client.get("/api/v1/admin/stats").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["total_users"], 1);
    assert_eq!(response.body["active_sessions"], 1);

    let response = client.get("/api/v1/admin/users").await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    let response = client.get("/api/v1/admin/audit-logs").await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    let response = client
        .send(Method::POST, "/api/v1/admin/sessions/cleanup", None, None)
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.code(), "INSUFFICIENT_ROLE");
}

#[tokio::test]
async fn test_admin_lists_and_filters_users() {
    let harness = TestHarness::new();
    let (mut admin, _) = admin_client(&harness, "admin@example.com", Role::Admin).await;
    harness
        .seed_identity("one@example.com", PASSWORD, Role::Customer)
        .await;
    harness
        .seed_identity("two@example.com", PASSWORD, Role::Moderator)
        .await;

    let response = admin.get("/api/v1/admin/users?page=1&page_size=2").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["total"], 3);
    assert_eq!(response.body["users"].as_array().unwrap().len(), 2);

    let response = admin.get("/api/v1/admin/users?role=moderator").await;
    assert_eq!(response.body["total"], 1);
    assert_eq!(response.body["users"][0]["email"], "two@example.com");

    let response = admin.get("/api/v1/admin/users?role=wizard").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_role_changes_need_superadmin_for_privileged_roles() {
    let harness = TestHarness::new();
    let (mut admin, admin_id) = admin_client(&harness, "admin@example.com", Role::Admin).await;
    let (mut root, _) = admin_client(&harness, "root@example.com", Role::Superadmin).await;
    let target = harness
        .seed_identity("staff@example.com", PASSWORD, Role::Customer)
        .await;
    let uri = format!("/api/v1/admin/users/{}", target.id);

    let response = admin
        .send(Method::PATCH, &uri, Some(json!({ "role": "moderator" })), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["user"]["role"], "moderator");

    let response = admin
        .send(Method::PATCH, &uri, Some(json!({ "role": "admin" })), None)
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    let response = root
        .send(Method::PATCH, &uri, Some(json!({ "role": "admin" })), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let own = format!("/api/v1/admin/users/{admin_id}");
    let response = admin
        .send(Method::PATCH, &own, Some(json!({ "role": "customer" })), None)
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_lock_revokes_sessions_and_is_audited() {
    let harness = TestHarness::new();
    let (mut admin, admin_id) = admin_client(&harness, "admin@example.com", Role::Admin).await;
    let (mut shopper, shopper_id) =
        admin_client(&harness, "shopper@example.com", Role::Customer).await;

    let response = admin
        .send(
            Method::PATCH,
            &format!("/api/v1/admin/users/{shopper_id}"),
            Some(json!({ "locked": true })),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["user"]["locked"], true);

    let response = shopper.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    let response = shopper.login("shopper@example.com", PASSWORD).await;
    assert_eq!(response.code(), "ACCOUNT_UNAVAILABLE");

    let response = admin
        .get(&format!("/api/v1/admin/audit-logs?user_id={admin_id}&action=admin.users.update"))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["total"], 1);
    let entry = &response.body["logs"][0];
    assert_eq!(entry["outcome"], "success");
    assert_eq!(entry["target"], shopper_id.to_string());
    assert!(entry["detail"].as_str().unwrap().contains("locked:true"));
}

#[tokio::test]
async fn test_admin_delete_user_and_self_protection() {
    let harness = TestHarness::new();
    let (mut admin, admin_id) = admin_client(&harness, "admin@example.com", Role::Admin).await;
    let target = harness
        .seed_identity("leaving@example.com", PASSWORD, Role::Customer)
        .await;

    let response = admin
        .send(
            Method::DELETE,
            &format!("/api/v1/admin/users/{admin_id}"),
            None,
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let response = admin
        .send(
            Method::DELETE,
            &format!("/api/v1/admin/users/{}", target.id),
            None,
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let response = admin.get("/api/v1/admin/users").await;
    assert_eq!(response.body["total"], 1);

    let mut client = TestClient::new(harness.router.clone());
    let response = client.login("leaving@example.com", PASSWORD).await;
    assert_eq!(response.code(), "ACCOUNT_UNAVAILABLE");

    let response = admin
        .get(&format!("/api/v1/admin/users/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_revokes_sessions_and_cleans_up() {
    let harness = TestHarness::new();
    let (mut admin, _) = admin_client(&harness, "admin@example.com", Role::Admin).await;
    let (mut shopper, shopper_id) =
        admin_client(&harness, "shopper@example.com", Role::Customer).await;

    let response = admin
        .post(
            &format!("/api/v1/admin/users/{shopper_id}/sessions/revoke"),
            json!({}),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["sessions_revoked"], 1);

    let response = shopper.post("/api/v1/auth/refresh", json!({})).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let response = admin
        .post("/api/v1/admin/sessions/cleanup", json!({}))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["sessions_purged"].is_u64());
}
