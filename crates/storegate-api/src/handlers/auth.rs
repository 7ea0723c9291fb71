//! Authentication API handlers
//!
//! Provides HTTP endpoints for account flows. Login and refresh set the
//! `accessToken`/`refreshToken` cookies in addition to returning the tokens.
//!
//! Author: hephaex@gmail.com

use crate::audit::ClientInfo;
use crate::auth::cookies::{read_cookie, set_cookies, REFRESH_COOKIE};
use crate::auth::service::{
    AuthResponse, ChangePasswordRequest, EmailRequest, LoginRequest, RefreshRequest,
    RegisterRequest, ResetPasswordRequest, UserInfo, VerifyOutcome,
};
use crate::auth::{AuthenticatedUser, TokenPair};
use crate::error::{message, ApiResponse, AppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storegate_core::{Identity, Session};
use utoipa::ToSchema;
use uuid::Uuid;

const UNIFORM_RECOVERY_MESSAGE: &str =
    "If an account exists for that address, an email has been sent";

/// Registration response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    pub user: UserInfo,
    pub email_sent: bool,
}

/// Session listing entry
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionInfo {
    pub id: Uuid,
    pub family_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    /// The session that minted the caller's access token
    pub current: bool,
}

impl SessionInfo {
    fn new(session: Session, current_id: Uuid) -> Self {
        Self {
            current: session.id == current_id,
            id: session.id,
            family_id: session.family_id,
            issued_at: session.issued_at,
            expires_at: session.expires_at,
            user_agent: session.user_agent,
            ip_address: session.ip_address,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RevokedResponse {
    pub sessions_revoked: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub user: UserInfo,
}

/// Envelope with the token payload and both session cookies
fn token_response(
    state: &AppState,
    status: StatusCode,
    text: &str,
    pair: &TokenPair,
    identity: Option<&Identity>,
) -> Response {
    let mut response = (status, ApiResponse::new(text, AuthResponse::new(pair, identity))).into_response();
    set_cookies(
        &mut response,
        [
            state.cookies.access(&pair.access_token),
            state.cookies.refresh(&pair.refresh_token),
        ],
    );
    response
}

/// Envelope that also expires both session cookies
fn clearing_response(state: &AppState, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    set_cookies(&mut response, state.cookies.cleared());
    response
}

/// Register a new customer account
///
/// Sends a verification email; `email_sent` reports whether dispatch succeeded.
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered successfully", body = RegisterResponse),
        (status = 400, description = "Invalid input", body = crate::error::ApiError),
        (status = 409, description = "Email already registered", body = crate::error::ApiError),
    )
)]
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    ValidatedJson(request): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let registered = state.auth.register(request, &client).await?;

    Ok((
        StatusCode::CREATED,
        ApiResponse::new(
            "Registration successful, check your email to verify your account",
            RegisterResponse {
                user: UserInfo::from(&registered.identity),
                email_sent: registered.email_sent,
            },
        ),
    ))
}

/// Login with email and password
///
/// Failed attempts are counted; the account is locked temporarily after
/// `auth.max_failed_attempts` failures.
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ApiError),
        (status = 403, description = "Account unavailable", body = crate::error::ApiError),
        (status = 429, description = "Too many attempts", body = crate::error::ApiError),
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    ValidatedJson(request): ValidatedJson<LoginRequest>,
) -> Result<Response, AppError> {
    let logged_in = state
        .auth
        .login(&request.email, &request.password, &client)
        .await?;

    Ok(token_response(
        &state,
        StatusCode::OK,
        "Login successful",
        &logged_in.tokens,
        Some(&logged_in.identity),
    ))
}

/// Exchange a refresh token for a new pair
///
/// Reads the `refreshToken` cookie, falling back to the request body.
/// Presenting an already-rotated token revokes the whole session family.
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    tag = "auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Tokens rotated", body = AuthResponse),
        (status = 401, description = "Invalid, expired or reused refresh token", body = crate::error::ApiError),
    )
)]
pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    client: ClientInfo,
    body: Option<Json<RefreshRequest>>,
) -> Result<Response, AppError> {
    let token = read_cookie(&headers, REFRESH_COOKIE)
        .or_else(|| body.and_then(|Json(b)| b.refresh_token))
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Unauthenticated)?;

    match state.auth.refresh(&token, &client).await {
        Ok(pair) => Ok(token_response(&state, StatusCode::OK, "Token refreshed", &pair, None)),
        Err(e) => Ok(clearing_response(&state, e)),
    }
}

/// Logout from the current session
#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "auth",
    responses(
        (status = 200, description = "Logout successful"),
        (status = 401, description = "Unauthorized", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    client: ClientInfo,
) -> Result<Response, AppError> {
    state.auth.logout(&user, &client).await?;
    Ok(clearing_response(&state, message("Logout successful")))
}

/// Logout from every device
#[utoipa::path(
    post,
    path = "/api/v1/auth/logout-all",
    tag = "auth",
    responses(
        (status = 200, description = "All sessions revoked", body = RevokedResponse),
        (status = 401, description = "Unauthorized", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn logout_all_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    client: ClientInfo,
) -> Result<Response, AppError> {
    let sessions_revoked = state.auth.logout_all(&user, &client).await?;
    Ok(clearing_response(
        &state,
        ApiResponse::new("Logged out from all devices", RevokedResponse { sessions_revoked }),
    ))
}

/// Verify an email address
///
/// Presenting the same token twice reports that the address is already verified.
#[utoipa::path(
    get,
    path = "/api/v1/auth/verify-email/{token}",
    tag = "auth",
    params(("token" = String, Path, description = "Verification token from the email link")),
    responses(
        (status = 200, description = "Email verified"),
        (status = 400, description = "Invalid or expired link", body = crate::error::ApiError),
    )
)]
pub async fn verify_email_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let text = match state.auth.verify_email(&token).await? {
        VerifyOutcome::Verified => "Email verified successfully",
        VerifyOutcome::AlreadyVerified => "Email is already verified",
    };
    Ok(message(text))
}

/// Resend the verification email
#[utoipa::path(
    post,
    path = "/api/v1/auth/resend-verification",
    tag = "auth",
    request_body = EmailRequest,
    responses((status = 200, description = "Uniform acknowledgement"))
)]
pub async fn resend_verification_handler(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<EmailRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.resend_verification(&request.email).await?;
    Ok(message(UNIFORM_RECOVERY_MESSAGE))
}

/// Request a password reset email
#[utoipa::path(
    post,
    path = "/api/v1/auth/forgot-password",
    tag = "auth",
    request_body = EmailRequest,
    responses((status = 200, description = "Uniform acknowledgement"))
)]
pub async fn forgot_password_handler(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    ValidatedJson(request): ValidatedJson<EmailRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.forgot_password(&request.email, &client).await?;
    Ok(message(UNIFORM_RECOVERY_MESSAGE))
}

/// Reset the password with a token from the reset email
#[utoipa::path(
    post,
    path = "/api/v1/auth/reset-password",
    tag = "auth",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password reset; every session revoked", body = RevokedResponse),
        (status = 400, description = "Invalid, used or expired token, or weak password", body = crate::error::ApiError),
    )
)]
pub async fn reset_password_handler(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    ValidatedJson(request): ValidatedJson<ResetPasswordRequest>,
) -> Result<Response, AppError> {
    let sessions_revoked = state
        .auth
        .reset_password(&request.token, &request.new_password, &client)
        .await?;
    Ok(clearing_response(
        &state,
        ApiResponse::new(
            "Password has been reset, please log in again",
            RevokedResponse { sessions_revoked },
        ),
    ))
}

/// Change the current user's password
#[utoipa::path(
    post,
    path = "/api/v1/auth/change-password",
    tag = "auth",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed; every session revoked", body = RevokedResponse),
        (status = 401, description = "Current password incorrect", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    client: ClientInfo,
    ValidatedJson(request): ValidatedJson<ChangePasswordRequest>,
) -> Result<Response, AppError> {
    let sessions_revoked = state.auth.change_password(&user, &request, &client).await?;
    Ok(clearing_response(
        &state,
        ApiResponse::new(
            "Password changed, please log in again",
            RevokedResponse { sessions_revoked },
        ),
    ))
}

/// Get current user information
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    tag = "auth",
    responses(
        (status = 200, description = "Current user profile", body = MeResponse),
        (status = 401, description = "Unauthorized", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn me_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.auth.me(&user).await?;
    Ok(ApiResponse::new(
        "Profile retrieved",
        MeResponse {
            user: UserInfo::from(&identity),
        },
    ))
}

/// List the current user's active sessions
#[utoipa::path(
    get,
    path = "/api/v1/auth/sessions",
    tag = "auth",
    responses(
        (status = 200, description = "Active sessions, newest first", body = SessionsResponse),
        (status = 401, description = "Unauthorized", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<impl IntoResponse, AppError> {
    let sessions = state
        .auth
        .sessions(&user)
        .await?
        .into_iter()
        .map(|s| SessionInfo::new(s, user.session_id))
        .collect();
    Ok(ApiResponse::new("Active sessions", SessionsResponse { sessions }))
}
