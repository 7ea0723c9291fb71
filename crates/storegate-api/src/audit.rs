//! Security audit logging
//!
//! Every audit record is persisted through the [`AuditStore`] and emitted as
//! a structured tracing event with the "audit" target, so the log pipeline
//! and the queryable audit table see the same events.
//!
//! Two entry points:
//! - [`AuditLogger::record`] is durable. The append runs on its own task
//!   and is awaited, so a dropped request future cannot cancel it.
//! - [`AuditLogger::record_detached`] is fire-and-forget telemetry.
//!
//! Author: hephaex@gmail.com

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use storegate_core::{AuditLogEntry, AuditOutcome, AuditStore, NewAuditEntry, StoreError};
use tracing::info;

/// Audit action names
pub mod actions {
    pub const LOGIN: &str = "auth.login";
    pub const LOGOUT: &str = "auth.logout";
    pub const LOGOUT_ALL: &str = "auth.logout_all";
    pub const REGISTER: &str = "auth.register";
    pub const REFRESH_REUSE: &str = "auth.refresh_reuse";
    pub const EMAIL_VERIFIED: &str = "auth.email_verified";
    pub const PASSWORD_RESET_REQUESTED: &str = "auth.password_reset_requested";
    pub const PASSWORD_RESET: &str = "auth.password_reset";
    pub const PASSWORD_CHANGE: &str = "auth.password_change";
    pub const ACCOUNT_LOCKED: &str = "auth.account_locked";
}

/// Records audit entries
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    timeout: Duration,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Persist an entry before returning
    ///
    /// The write runs on a spawned task so it completes even if the caller
    /// is cancelled. A timeout is reported as `Unavailable`.
    pub async fn record(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError> {
        emit(&entry);
        let store = self.store.clone();
        let handle = tokio::spawn(async move { store.append(entry).await });

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StoreError::Database(format!(
                "audit write task failed: {join_error}"
            ))),
            Err(_) => Err(StoreError::Unavailable("audit write timed out".to_string())),
        }
    }

    /// Persist an entry in the background
    pub fn record_detached(&self, entry: NewAuditEntry) {
        emit(&entry);
        let store = self.store.clone();
        tokio::spawn(async move {
            let action = entry.action.clone();
            if let Err(e) = store.append(entry).await {
                tracing::warn!(action = %action, error = %e, "Failed to persist audit entry");
            }
        });
    }
}

/// Emit the structured "audit" tracing event
fn emit(entry: &NewAuditEntry) {
    info!(
        target: "audit",
        action = %entry.action,
        outcome = entry.outcome.as_str(),
        actor_id = ?entry.actor_id,
        target_id = ?entry.target,
        ip_address = ?entry.source_address,
        detail = ?entry.detail,
        "Audit event"
    );
}

/// Map an HTTP status to an audit outcome
pub fn outcome_for_status(status: axum::http::StatusCode) -> AuditOutcome {
    if status.is_success() || status.is_redirection() {
        AuditOutcome::Success
    } else if status == axum::http::StatusCode::FORBIDDEN {
        AuditOutcome::Denied
    } else {
        AuditOutcome::Failure
    }
}

/// Client address resolved once per request by
/// [`client_address_middleware`](crate::middleware::client_address_middleware)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddress(pub IpAddr);

/// Resolve the address a request is attributed to
///
/// Forwarded headers are believed only when `peer` is a trusted proxy.
/// `X-Forwarded-For` is walked right to left, skipping trusted hops, so a
/// value the client prepended never wins over the hop its proxy appended.
pub fn resolve_client_address(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted_proxies.contains(&peer) {
        return Some(peer);
    }
    Some(forwarded_client(headers, trusted_proxies).unwrap_or(peer))
}

/// Client hop named by proxy headers: X-Forwarded-For, then X-Real-IP
fn forwarded_client(headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let mut last_hop = None;
        for hop in xff.rsplit(',').map(str::trim).filter(|h| !h.is_empty()) {
            let ip: IpAddr = hop.parse().ok()?;
            if !trusted_proxies.contains(&ip) {
                return Some(ip);
            }
            last_hop = Some(ip);
        }
        if last_hop.is_some() {
            return last_hop;
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Extract user agent from request headers
pub fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .map(|s| s.to_string())
}

/// Resolved client address, falling back to the socket peer
pub fn client_address(extensions: &axum::http::Extensions) -> Option<String> {
    if let Some(ClientAddress(ip)) = extensions.get::<ClientAddress>() {
        return Some(ip.to_string());
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Client context attached to sessions and audit entries
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn from_parts(headers: &HeaderMap, extensions: &axum::http::Extensions) -> Self {
        Self {
            ip_address: client_address(extensions),
            user_agent: extract_user_agent(headers),
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(&parts.headers, &parts.extensions))
    }
}
