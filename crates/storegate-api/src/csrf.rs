//! Double-submit CSRF protection
//!
//! A browser obtains a token from `GET /api/v1/csrf-token`. The token is
//! cached against the `csrfSid` cookie and must be echoed back in the
//! `X-CSRF-Token` header on every state-changing request.
//!
//! Author: hephaex@gmail.com

use crate::auth::cookies::{read_cookie, CSRF_SESSION_COOKIE};
use crate::auth::jwt::generate_opaque_token;
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use storegate_core::CsrfConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsrfError {
    #[error("CSRF token missing")]
    Missing,
    #[error("CSRF token invalid")]
    Invalid,
}

impl From<CsrfError> for AppError {
    fn from(err: CsrfError) -> Self {
        match err {
            CsrfError::Missing => AppError::CsrfMissing,
            CsrfError::Invalid => AppError::CsrfInvalid,
        }
    }
}

/// Issues and validates CSRF tokens keyed by CSRF session id
#[derive(Clone)]
pub struct CsrfGuard {
    tokens: Cache<String, String>,
    ttl: Duration,
    header_name: String,
    exempt_paths: Arc<Vec<String>>,
}

impl CsrfGuard {
    pub fn new(config: &CsrfConfig) -> Self {
        let ttl = Duration::from_secs(config.token_ttl_secs);
        Self {
            tokens: Cache::builder()
                .max_capacity(config.max_sessions)
                .time_to_live(ttl)
                .build(),
            ttl,
            header_name: config.header_name.to_ascii_lowercase(),
            exempt_paths: Arc::new(config.exempt_paths.clone()),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Token for `session_key`, generated on first use
    ///
    /// Concurrent callers for the same key within the TTL all get the same
    /// value.
    pub async fn issue_token(&self, session_key: &str) -> String {
        self.tokens
            .get_with(session_key.to_string(), async { generate_opaque_token() })
            .await
    }

    pub async fn validate(
        &self,
        request_token: Option<&str>,
        session_key: Option<&str>,
    ) -> Result<(), CsrfError> {
        let provided = request_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CsrfError::Missing)?;
        let session_key = session_key.ok_or(CsrfError::Invalid)?;
        let expected = self
            .tokens
            .get(session_key)
            .await
            .ok_or(CsrfError::Invalid)?;

        if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(CsrfError::Invalid)
        }
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Reject state-changing requests without a matching CSRF token
pub async fn csrf_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let guard = &state.csrf;
    if is_safe_method(request.method()) || guard.is_exempt(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(guard.header_name())
        .and_then(|v| v.to_str().ok());
    let session_key = read_cookie(request.headers(), CSRF_SESSION_COOKIE);

    if let Err(e) = guard.validate(provided, session_key.as_deref()).await {
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            reason = %e,
            "CSRF validation failed"
        );
        return Err(e.into());
    }

    Ok(next.run(request).await)
}
