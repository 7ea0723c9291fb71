/// Authentication and role-gating middleware
///
/// `auth_middleware` resolves the caller from the access token (cookie or
/// Bearer header) and, when the access token has expired but a refresh
/// cookie is present, rotates once and continues the original request.
///
/// `role_gate` restricts a router to a role set and, on privileged routes,
/// writes one durable audit entry per request.
use super::cookies::{read_cookie, set_cookies, ACCESS_COOKIE, REFRESH_COOKIE};
use super::jwt::{role_from_claims, Claims, JwtError, TokenPair};
use crate::audit::{client_address, outcome_for_status, ClientInfo};
use crate::error::AppError;
use crate::middleware::metrics::{is_uuid, normalize_endpoint, record_auth_event};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::sync::Arc;
use storegate_core::{AuditOutcome, Capability, NewAuditEntry, Role};
use uuid::Uuid;

/// Authenticated caller, inserted into request extensions
///
/// Handlers extract it with `Extension<AuthenticatedUser>`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub identity_id: Uuid,
    pub email: String,
    pub role: Role,
    /// Session that minted the access token
    pub session_id: Uuid,
    pub jti: String,
}

impl TryFrom<&Claims> for AuthenticatedUser {
    type Error = JwtError;

    fn try_from(claims: &Claims) -> Result<Self, Self::Error> {
        Ok(Self {
            identity_id: Uuid::parse_str(&claims.sub).map_err(|_| JwtError::InvalidToken)?,
            email: claims.email.clone(),
            role: role_from_claims(claims)?,
            session_id: Uuid::parse_str(&claims.sid).map_err(|_| JwtError::InvalidToken)?,
            jti: claims.jti.clone(),
        })
    }
}

impl From<JwtError> for AppError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::InvalidToken | JwtError::InvalidSignature => AppError::TokenInvalid,
            JwtError::ExpiredToken => AppError::TokenExpired,
            JwtError::ReuseDetected => AppError::ReuseDetected,
            JwtError::Timeout => {
                AppError::UpstreamUnavailable("token rotation timed out".to_string())
            }
            JwtError::Store(e) => e.into(),
            JwtError::EncodingError(e) => AppError::Internal(e.to_string()),
            JwtError::SystemTimeError(e) => AppError::Internal(e.to_string()),
        }
    }
}

/// Bearer token from the Authorization header
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Failed authentication; `clear_cookies` after a failed silent refresh
struct Rejection {
    error: AppError,
    clear_cookies: bool,
}

impl From<AppError> for Rejection {
    fn from(error: AppError) -> Self {
        Self {
            error,
            clear_cookies: false,
        }
    }
}

/// Resolve the caller; returns a fresh pair when a silent refresh happened
async fn authenticate(state: &AppState, request: &mut Request) -> Result<Option<TokenPair>, Rejection> {
    let access = bearer_token(request.headers()).or_else(|| read_cookie(request.headers(), ACCESS_COOKIE));

    let expired = match &access {
        Some(token) => match state.issuer.verify_access(token) {
            Ok(claims) => {
                let user = AuthenticatedUser::try_from(&claims).map_err(AppError::from)?;
                request.extensions_mut().insert(user);
                return Ok(None);
            }
            Err(JwtError::ExpiredToken) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected access token");
                return Err(AppError::TokenInvalid.into());
            }
        },
        None => false,
    };

    let Some(refresh) = read_cookie(request.headers(), REFRESH_COOKIE) else {
        return Err(if expired {
            AppError::TokenExpired
        } else {
            AppError::Unauthenticated
        }
        .into());
    };

    let client = ClientInfo::from_parts(request.headers(), request.extensions());
    match state.issuer.rotate(&refresh, &client).await {
        Ok(pair) => {
            let user = AuthenticatedUser::try_from(&pair.claims).map_err(AppError::from)?;
            tracing::debug!(identity_id = %user.identity_id, "Access token refreshed in-flight");
            record_auth_event("silent_refresh");
            request.extensions_mut().insert(user);
            Ok(Some(pair))
        }
        Err(e) => {
            record_auth_event("silent_refresh_failure");
            Err(Rejection {
                error: e.into(),
                clear_cookies: true,
            })
        }
    }
}

/// Authentication middleware that requires a valid access token
///
/// ```ignore
/// let protected = Router::new()
///     .route("/auth/me", get(me))
///     .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));
/// ```
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&state, &mut request).await {
        Ok(None) => next.run(request).await,
        Ok(Some(pair)) => {
            let mut response = next.run(request).await;
            set_cookies(
                &mut response,
                [
                    state.cookies.access(&pair.access_token),
                    state.cookies.refresh(&pair.refresh_token),
                ],
            );
            response
        }
        Err(rejection) => {
            let mut response = rejection.error.into_response();
            if rejection.clear_cookies {
                set_cookies(&mut response, state.cookies.cleared());
            }
            response
        }
    }
}

/// Capability a router requires, plus whether it is audited
///
/// A role passes when its capability set holds `required`, so superadmin
/// passes every gate.
#[derive(Debug, Clone, Copy)]
pub struct RoleGate {
    pub required: Capability,
    pub privileged: bool,
}

impl RoleGate {
    pub const fn new(required: Capability) -> Self {
        Self {
            required,
            privileged: false,
        }
    }

    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Extra detail a handler attaches to the gate's audit entry
///
/// Returned as a response extension: `(Extension(AuditDetail(..)), Json(..))`.
#[derive(Debug, Clone)]
pub struct AuditDetail(pub String);

/// Audit action for a request, e.g. `DELETE /api/v1/admin/users/:id`
/// becomes `admin.users.delete`
pub fn audit_action(method: &Method, path: &str) -> String {
    let normalized = normalize_endpoint(path);
    let trimmed = normalized
        .trim_start_matches("/api/v1")
        .trim_matches('/');
    let ends_with_id = trimmed.ends_with(":id");

    let mut parts: Vec<String> = trimmed
        .split('/')
        .filter(|s| !s.is_empty() && !s.starts_with(':'))
        .map(|s| s.replace('-', "_"))
        .collect();

    let verb = match *method {
        Method::GET | Method::HEAD if ends_with_id => Some("get"),
        Method::GET | Method::HEAD => Some("view"),
        Method::PATCH | Method::PUT => Some("update"),
        Method::DELETE => Some("delete"),
        _ => None,
    };
    if let Some(verb) = verb {
        parts.push(verb.to_string());
    }
    parts.join(".")
}

/// First UUID path segment, used as the audit target
pub fn audit_target(path: &str) -> Option<String> {
    path.split('/').find(|s| is_uuid(s)).map(str::to_string)
}

/// Role gate middleware; must run inside `auth_middleware`
pub async fn role_gate(
    State((state, gate)): State<(Arc<AppState>, RoleGate)>,
    request: Request,
    next: Next,
) -> Response {
    let Some(user) = request.extensions().get::<AuthenticatedUser>().cloned() else {
        return AppError::Unauthenticated.into_response();
    };

    let action = audit_action(request.method(), request.uri().path());
    let mut entry = NewAuditEntry::new(action, AuditOutcome::Denied)
        .actor(user.identity_id)
        .source(client_address(request.extensions()));
    if let Some(target) = audit_target(request.uri().path()) {
        entry = entry.target(target);
    }

    if !user.role.has_capability(gate.required) {
        tracing::warn!(
            identity_id = %user.identity_id,
            role = %user.role,
            required = ?gate.required,
            action = %entry.action,
            "Insufficient role"
        );
        if gate.privileged {
            let entry = entry.detail(format!("role={}", user.role));
            if let Err(e) = state.audit.record(entry).await {
                tracing::error!(error = %e, "Failed to persist audit entry for denied request");
            }
        }
        return AppError::InsufficientRole.into_response();
    }

    let response = next.run(request).await;

    if gate.privileged {
        entry.outcome = outcome_for_status(response.status());
        if let Some(AuditDetail(detail)) = response.extensions().get::<AuditDetail>() {
            entry = entry.detail(detail.clone());
        }
        if let Err(e) = state.audit.record(entry).await {
            tracing::error!(error = %e, "Failed to persist audit entry for privileged request");
        }
    }

    response
}
