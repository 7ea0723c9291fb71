//! Storegate API - session and access-control HTTP service
//!
//! Provides the storefront's authentication surface: account flows,
//! token issuance and rotation, CSRF protection, role-gated administration
//! and the audit trail.

pub mod audit;
pub mod auth;
pub mod csrf;
pub mod email;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use crate::csrf::csrf_middleware;
use crate::email::sender_from_config;
use crate::error::error_details_middleware;
use crate::middleware::{
    client_address_middleware, metrics, metrics_middleware, rate_limit_middleware,
    timeout_middleware,
};
use crate::openapi::ApiDoc;
use crate::state::{AppState, Stores};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use storegate_core::{postgres, AppConfig, StorageBackend, StoreError};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Build the application router with every layer applied
///
/// Layer order, outermost first: trace, CORS, error details, timeout,
/// metrics, client address, rate limit, CSRF. Authentication and role gates
/// are route layers inside.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(
        &state.config.server.cors_origins,
        state.config.csrf.header_name.as_str(),
    );
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(routes::health_routes())
        .merge(routes::api_routes(state.clone()))
        .layer(from_fn_with_state(state.clone(), csrf_middleware))
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(from_fn_with_state(state.clone(), client_address_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn_with_state(state.clone(), timeout_middleware))
        .layer(from_fn_with_state(state.clone(), error_details_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String], csrf_header: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    let mut headers = vec![header::CONTENT_TYPE, header::AUTHORIZATION];
    if let Ok(name) = HeaderName::from_bytes(csrf_header.as_bytes()) {
        headers.push(name);
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(headers)
        .allow_credentials(true)
}

/// Connect the configured backend and wire services
pub async fn build_state(config: AppConfig) -> anyhow::Result<Arc<AppState>> {
    let email = sender_from_config(&config.email)?;

    let (stores, pool) = match config.database.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory store; data is lost on restart");
            (Stores::memory(), None)
        }
        StorageBackend::Postgres => {
            let pool = postgres::connect(&config.database).await?;
            tracing::info!("Connected to PostgreSQL");
            (Stores::postgres(pool.clone()), Some(pool))
        }
    };

    Ok(Arc::new(AppState::new(config, stores, email, pool)))
}

/// Remove expired sessions and one-time tokens, returning both counts
pub async fn purge_expired(state: &AppState) -> Result<(u64, u64), StoreError> {
    let now = Utc::now();
    let sessions = state.stores.sessions.purge_expired(now).await?;
    let tokens = state.stores.tokens.purge_expired(now).await?;
    let active = state.stores.sessions.count_active(now).await?;
    metrics::set_active_sessions(active);
    Ok((sessions, tokens))
}

/// Periodic purge of expired rows and idle rate-limit windows
pub fn spawn_maintenance(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let purge_every = Duration::from_secs(state.config.server.session_purge_interval_secs.max(1));
    let cleanup_every = Duration::from_secs(state.config.rate_limit.cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        let mut purge = tokio::time::interval(purge_every);
        let mut cleanup = tokio::time::interval(cleanup_every);

        loop {
            tokio::select! {
                _ = purge.tick() => match purge_expired(&state).await {
                    Ok((sessions, tokens)) if sessions + tokens > 0 => {
                        tracing::info!(sessions, tokens, "Purged expired rows");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Expired row purge failed"),
                },
                _ = cleanup.tick() => {
                    let removed = state.rate_limiter.cleanup();
                    if removed > 0 {
                        tracing::debug!(removed, "Forgot rate-limit clients with full budgets");
                    }
                }
            }
        }
    })
}
