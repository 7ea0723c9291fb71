//! CSRF token handler

use crate::auth::cookies::{read_cookie, set_cookies, CSRF_SESSION_COOKIE};
use crate::auth::jwt::generate_opaque_token;
use crate::error::ApiResponse;
use crate::state::AppState;
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    /// Seconds until the token must be fetched again
    pub expires_in: u64,
}

/// Issue the CSRF token bound to the caller's `csrfSid` cookie
///
/// A caller without the cookie gets a fresh one. Repeated calls within the
/// token lifetime return the same token.
#[utoipa::path(
    get,
    path = "/api/v1/csrf-token",
    tag = "auth",
    responses(
        (status = 200, description = "CSRF token issued", body = CsrfTokenResponse)
    )
)]
pub async fn csrf_token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let sid = read_cookie(&headers, CSRF_SESSION_COOKIE).unwrap_or_else(generate_opaque_token);
    let csrf_token = state.csrf.issue_token(&sid).await;

    let mut response = ApiResponse::new(
        "CSRF token issued",
        CsrfTokenResponse {
            csrf_token,
            expires_in: state.csrf.ttl_secs(),
        },
    )
    .into_response();
    set_cookies(&mut response, [state.cookies.csrf_session(&sid)]);
    response
}
