//! API route definitions
//!
//! Routes are declared with their full paths and merged rather than nested,
//! so middleware sees the same path the client sent.
//!
//! Author: hephaex@gmail.com

use crate::auth::{auth_middleware, role_gate, RoleGate};
use crate::handlers::{admin, auth, csrf, health};
use crate::state::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use storegate_core::Capability;

/// User administration
pub const USERS_GATE: RoleGate = RoleGate::new(Capability::ManageUsers).privileged();
/// Session revocation and cleanup
pub const SESSIONS_GATE: RoleGate = RoleGate::new(Capability::ManageSessions).privileged();
/// Audit log listing
pub const AUDIT_GATE: RoleGate = RoleGate::new(Capability::ViewAuditLog).privileged();
/// Dashboard statistics
pub const DASHBOARD_GATE: RoleGate = RoleGate::new(Capability::ViewDashboard).privileged();

/// Liveness, readiness and metrics
pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::prometheus_metrics))
}

/// Create API v1 routes
pub fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Public routes (no authentication required)
    let public_routes = Router::new()
        .route("/api/v1/csrf-token", get(csrf::csrf_token_handler))
        .route("/api/v1/auth/register", post(auth::register_handler))
        .route("/api/v1/auth/login", post(auth::login_handler))
        .route("/api/v1/auth/refresh", post(auth::refresh_handler))
        .route(
            "/api/v1/auth/verify-email/:token",
            get(auth::verify_email_handler),
        )
        .route(
            "/api/v1/auth/resend-verification",
            post(auth::resend_verification_handler),
        )
        .route(
            "/api/v1/auth/forgot-password",
            post(auth::forgot_password_handler),
        )
        .route(
            "/api/v1/auth/reset-password",
            post(auth::reset_password_handler),
        );

    // Protected routes (authentication required)
    let account_routes = Router::new()
        .route("/api/v1/auth/logout", post(auth::logout_handler))
        .route("/api/v1/auth/logout-all", post(auth::logout_all_handler))
        .route("/api/v1/auth/me", get(auth::me_handler))
        .route("/api/v1/auth/sessions", get(auth::sessions_handler))
        .route(
            "/api/v1/auth/change-password",
            post(auth::change_password_handler),
        );

    let user_routes = Router::new()
        .route("/api/v1/admin/users", get(admin::list_users))
        .route(
            "/api/v1/admin/users/:id",
            get(admin::get_user)
                .patch(admin::update_user)
                .delete(admin::delete_user),
        )
        .route_layer(middleware::from_fn_with_state(
            (state.clone(), USERS_GATE),
            role_gate,
        ));

    let session_routes = Router::new()
        .route(
            "/api/v1/admin/users/:id/sessions/revoke",
            post(admin::revoke_user_sessions),
        )
        .route(
            "/api/v1/admin/sessions/cleanup",
            post(admin::cleanup_sessions),
        )
        .route_layer(middleware::from_fn_with_state(
            (state.clone(), SESSIONS_GATE),
            role_gate,
        ));

    let audit_routes = Router::new()
        .route("/api/v1/admin/audit-logs", get(admin::list_audit_logs))
        .route_layer(middleware::from_fn_with_state(
            (state.clone(), AUDIT_GATE),
            role_gate,
        ));

    let dashboard_routes = Router::new()
        .route("/api/v1/admin/stats", get(admin::stats))
        .route_layer(middleware::from_fn_with_state(
            (state.clone(), DASHBOARD_GATE),
            role_gate,
        ));

    let protected_routes = Router::new()
        .merge(account_routes)
        .merge(user_routes)
        .merge(session_routes)
        .merge(audit_routes)
        .merge(dashboard_routes)
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    // Combine routes
    Router::new().merge(public_routes).merge(protected_routes)
}
