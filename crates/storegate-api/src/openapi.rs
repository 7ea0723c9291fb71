//! OpenAPI document served at `/api-docs/openapi.json`

use crate::auth::service::{
    AuthResponse, ChangePasswordRequest, EmailRequest, LoginRequest, RefreshRequest,
    RegisterRequest, ResetPasswordRequest, UserInfo,
};
use crate::error::ApiError;
use crate::handlers::{admin, auth, csrf, health};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storegate API",
        description = "Session and access-control service for the storefront"
    ),
    paths(
        health::health_check,
        health::readiness_check,
        health::prometheus_metrics,
        csrf::csrf_token_handler,
        auth::register_handler,
        auth::login_handler,
        auth::refresh_handler,
        auth::logout_handler,
        auth::logout_all_handler,
        auth::verify_email_handler,
        auth::resend_verification_handler,
        auth::forgot_password_handler,
        auth::reset_password_handler,
        auth::change_password_handler,
        auth::me_handler,
        auth::sessions_handler,
        admin::list_users,
        admin::get_user,
        admin::update_user,
        admin::delete_user,
        admin::revoke_user_sessions,
        admin::list_audit_logs,
        admin::stats,
        admin::cleanup_sessions,
    ),
    components(schemas(
        ApiError,
        health::HealthResponse,
        health::ReadinessResponse,
        health::ReadinessChecks,
        csrf::CsrfTokenResponse,
        RegisterRequest,
        LoginRequest,
        RefreshRequest,
        EmailRequest,
        ResetPasswordRequest,
        ChangePasswordRequest,
        UserInfo,
        AuthResponse,
        auth::RegisterResponse,
        auth::SessionInfo,
        auth::SessionsResponse,
        auth::RevokedResponse,
        auth::MeResponse,
        admin::AdminUserView,
        admin::UserListResponse,
        admin::UserResponse,
        admin::UpdateUserRequest,
        admin::SessionsRevokedResponse,
        admin::AuditLogView,
        admin::AuditLogResponse,
        admin::StatsResponse,
        admin::CleanupResponse,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Liveness, readiness and metrics"),
        (name = "auth", description = "Accounts, sessions and tokens"),
        (name = "admin", description = "User administration and audit log")
    )
)]
pub struct ApiDoc;

/// Registers the `bearer_auth` scheme referenced by protected paths
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_protected_paths_with_bearer_scheme() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/v1/auth/login"));
        assert!(doc.paths.paths.contains_key("/api/v1/admin/users/{id}"));

        let components = doc.components.expect("components");
        assert!(components.security_schemes.contains_key("bearer_auth"));
    }
}
