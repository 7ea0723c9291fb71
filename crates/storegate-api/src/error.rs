//! API error handling
//!
//! Every failure leaves the service as the same envelope:
//! `{ "success": false, "code": ..., "message": ..., "details"?: ... }`.
//!
//! `details` never goes into the body directly. The error stores it as a
//! response extension and [`error_details_middleware`] copies it into the
//! envelope outside production.
//!
//! Author: hephaex@gmail.com

use crate::state::AppState;
use axum::{
    async_trait,
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use storegate_core::StoreError;
use thiserror::Error;
use utoipa::ToSchema;
use validator::Validate;

/// Error envelopes larger than this are passed through untouched
const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Internal detail of a failed request, carried as a response extension
#[derive(Debug, Clone)]
pub struct ErrorDetails(pub String);

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Always `false`
    pub success: bool,
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Additional details, omitted in production
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Seconds until the rate-limit window resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.into(),
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }
}

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Access token has expired")]
    TokenExpired,

    #[error("Invalid token")]
    TokenInvalid,

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    #[error("CSRF token missing")]
    CsrfMissing,

    #[error("CSRF token invalid")]
    CsrfInvalid,

    #[error("Insufficient role")]
    InsufficientRole,

    #[error("{0}")]
    AccountUnavailable(String),

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    ValidationFailed(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidCredentials
            | AppError::Unauthenticated
            | AppError::TokenExpired
            | AppError::TokenInvalid
            | AppError::ReuseDetected => StatusCode::UNAUTHORIZED,
            AppError::CsrfMissing
            | AppError::CsrfInvalid
            | AppError::InsufficientRole
            | AppError::AccountUnavailable(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::Unauthenticated => "UNAUTHENTICATED",
            AppError::TokenExpired => "TOKEN_EXPIRED",
            AppError::TokenInvalid => "TOKEN_INVALID",
            AppError::ReuseDetected => "REUSE_DETECTED",
            AppError::CsrfMissing => "CSRF_MISSING",
            AppError::CsrfInvalid => "CSRF_INVALID",
            AppError::InsufficientRole => "INSUFFICIENT_ROLE",
            AppError::AccountUnavailable(_) => "ACCOUNT_UNAVAILABLE",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::ValidationFailed(_) => "VALIDATION_FAILED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Detail withheld from the public message
    fn details(&self) -> Option<&str> {
        match self {
            AppError::UpstreamUnavailable(detail) | AppError::Internal(detail) => Some(detail),
            _ => None,
        }
    }

    fn to_api_error(&self) -> ApiError {
        match self {
            AppError::UpstreamUnavailable(_) => {
                ApiError::new(self.code(), "A backing service is unavailable")
            }
            AppError::Internal(_) => ApiError::new(self.code(), "Internal server error"),
            AppError::RateLimited { retry_after_secs } => {
                let mut error = ApiError::new(
                    self.code(),
                    format!("Too many requests, retry in {retry_after_secs} seconds"),
                );
                error.retry_after_secs = Some(*retry_after_secs);
                error
            }
            other => ApiError::new(other.code(), other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let mut response = (status, Json(self.to_api_error())).into_response();
        if let Some(details) = self.details() {
            response
                .extensions_mut()
                .insert(ErrorDetails(details.to_string()));
        }
        if let AppError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => AppError::UpstreamUnavailable(msg),
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Corrupt(msg) | StoreError::Database(msg) => AppError::Internal(msg),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationFailed(format_validation_errors(&err))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::ValidationFailed(rejection.body_text())
    }
}

fn format_validation_errors(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .map(|(field, errs)| {
            let reason = errs
                .iter()
                .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
                .next()
                .unwrap_or_else(|| "is invalid".to_string());
            format!("{field}: {reason}")
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

/// Copy [`ErrorDetails`] into the error envelope when the environment allows it
pub async fn error_details_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if !state.config.expose_error_details() {
        return response;
    }
    let Some(ErrorDetails(details)) = response.extensions().get::<ErrorDetails>().cloned() else {
        return response;
    };

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_ENVELOPE_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable error envelope");
            return AppError::Internal(details).into_response();
        }
    };
    let Ok(mut envelope) = serde_json::from_slice::<ApiError>(&bytes) else {
        return Response::from_parts(parts, Body::from(bytes));
    };
    envelope.details = Some(details);

    match serde_json::to_vec(&envelope) {
        Ok(body) => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(body))
        }
        Err(_) => Response::from_parts(parts, Body::from(bytes)),
    }
}

/// JSON body extractor that runs `validator` rules and reports both
/// malformed bodies and rule failures as `VALIDATION_FAILED`
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

/// Success envelope: `{ "success": true, "message": ..., ...payload }`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data,
        })
    }
}

/// Envelope for responses that carry only a message
pub fn message(message: impl Into<String>) -> Json<ApiResponse<serde_json::Value>> {
    ApiResponse::new(message, serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, TestHarness};
    use axum::{middleware::from_fn_with_state, routing::get, Router};
    use storegate_core::Environment;
    use tower::ServiceExt;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(AppError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::ReuseDetected.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::CsrfMissing.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::InsufficientRole.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::RateLimited { retry_after_secs: 3 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::UpstreamUnavailable("db".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            AppError::from(StoreError::Unavailable("timeout".into())),
            AppError::UpstreamUnavailable(_)
        ));
        assert!(matches!(
            AppError::from(StoreError::Conflict("dup".into())),
            AppError::Conflict(_)
        ));
        assert!(matches!(
            AppError::from(StoreError::Corrupt("role".into())),
            AppError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = AppError::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["retry_after_secs"], 42);
    }

    #[tokio::test]
    async fn test_internal_error_keeps_details_out_of_body() {
        let response = AppError::Internal("connection string leaked".into()).into_response();
        assert_eq!(
            response.extensions().get::<ErrorDetails>().map(|d| d.0.as_str()),
            Some("connection string leaked")
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "INTERNAL_ERROR");
        assert!(json.get("details").is_none());
    }

    async fn failing_route(environment: Environment) -> serde_json::Value {
        let mut config = test_config();
        config.environment = environment;
        config.auth.jwt_secret = "x".repeat(64);
        let harness = TestHarness::with_config(config);

        let app = Router::new()
            .route(
                "/fail",
                get(|| async { AppError::UpstreamUnavailable("db pool exhausted".into()) }),
            )
            .layer(from_fn_with_state(harness.state.clone(), error_details_middleware));
        let response = app
            .oneshot(Request::builder().uri("/fail").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_details_follow_environment() {
        let dev = failing_route(Environment::Development).await;
        assert_eq!(dev["code"], "UPSTREAM_UNAVAILABLE");
        assert_eq!(dev["details"], "db pool exhausted");

        let prod = failing_route(Environment::Production).await;
        assert_eq!(prod["code"], "UPSTREAM_UNAVAILABLE");
        assert!(prod.get("details").is_none());
    }

    #[test]
    fn test_success_envelope_flattens_payload() {
        #[derive(Serialize)]
        struct Payload {
            csrf_token: String,
        }
        let Json(envelope) = ApiResponse::new(
            "ok",
            Payload {
                csrf_token: "abc".into(),
            },
        );
        let json = serde_json::to_value(envelope).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["csrf_token"], "abc");
    }
}
