//! Client address resolution
//!
//! Runs ahead of the rate limiter so every later stage (limiter keys,
//! session metadata, audit entries) sees one address per request.

use crate::audit::{resolve_client_address, ClientAddress};
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn client_address_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(ip) = resolve_client_address(
        request.headers(),
        peer,
        &state.config.server.trusted_proxies,
    ) {
        request.extensions_mut().insert(ClientAddress(ip));
    }

    next.run(request).await
}
