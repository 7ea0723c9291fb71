//! Request deadline
//!
//! A request that outlives `server.request_timeout_secs` is abandoned and
//! answered with the `UPSTREAM_UNAVAILABLE` envelope.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Duration;

pub async fn timeout_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let limit = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    let path = request.uri().path().to_string();

    tokio::time::timeout(limit, next.run(request))
        .await
        .map_err(|_| {
            tracing::warn!(path = %path, timeout_secs = limit.as_secs(), "Request timed out");
            AppError::UpstreamUnavailable(format!("request exceeded {}s", limit.as_secs()))
        })
}
