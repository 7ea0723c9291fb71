//! Administration API handlers
//!
//! Every route here sits behind a privileged `RoleGate`, which writes the
//! audit entry for the request. Handlers attach an `AuditDetail` when the
//! entry needs more than the action and target.
//!
//! Author: hephaex@gmail.com

use crate::auth::{AuditDetail, AuthenticatedUser};
use crate::error::{ApiResponse, AppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use storegate_core::{
    AuditFilter, AuditLogEntry, AuditOutcome, Capability, Identity, IdentityFilter, PageRequest,
    Role,
};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

/// Identity as seen by administrators
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AdminUserView {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub email_verified: bool,
    pub locked: bool,
    pub disabled: bool,
    pub failed_login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Identity> for AdminUserView {
    fn from(identity: Identity) -> Self {
        Self {
            id: identity.id,
            email: identity.email,
            name: identity.name,
            role: identity.role.as_str().to_string(),
            email_verified: identity.email_verified,
            locked: identity.locked,
            disabled: identity.disabled,
            failed_login_attempts: identity.failed_login_attempts,
            locked_until: identity.locked_until,
            last_login: identity.last_login,
            created_at: identity.created_at,
            updated_at: identity.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListUsersQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Filter by role name
    pub role: Option<String>,
    /// Substring of email or name
    pub search: Option<String>,
    /// Include soft-deleted identities
    pub include_disabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserListResponse {
    pub users: Vec<AdminUserView>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    pub user: AdminUserView,
}

/// Partial identity update
#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateUserRequest {
    pub role: Option<String>,
    pub locked: Option<bool>,
    pub email_verified: Option<bool>,
    #[validate(length(min = 1, max = 100, message = "must be 1 to 100 characters"))]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionsRevokedResponse {
    pub user_id: Uuid,
    pub sessions_revoked: u64,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditLogQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub action: Option<String>,
    /// Acting identity
    pub user_id: Option<Uuid>,
    /// success, failure or denied
    pub outcome: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditLogView {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub target: Option<String>,
    pub outcome: String,
    pub source_address: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<AuditLogEntry> for AuditLogView {
    fn from(entry: AuditLogEntry) -> Self {
        Self {
            id: entry.id,
            actor_id: entry.actor_id,
            action: entry.action,
            target: entry.target,
            outcome: entry.outcome.as_str().to_string(),
            source_address: entry.source_address,
            detail: entry.detail,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditLogResponse {
    pub logs: Vec<AuditLogView>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    pub total_users: u64,
    pub verified_users: u64,
    pub locked_users: u64,
    pub disabled_users: u64,
    pub users_by_role: BTreeMap<String, u64>,
    pub active_sessions: u64,
    pub audit_events_24h: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CleanupResponse {
    pub sessions_purged: u64,
    pub tokens_purged: u64,
}

async fn load_identity(state: &AppState, id: Uuid) -> Result<Identity, AppError> {
    state
        .stores
        .identities
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound("User".to_string()))
}

fn parse_role(value: &str) -> Result<Role, AppError> {
    value
        .parse()
        .map_err(|e: storegate_core::UnknownRole| AppError::ValidationFailed(e.to_string()))
}

/// List users
#[utoipa::path(
    get,
    path = "/api/v1/admin/users",
    tag = "admin",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "Paginated users", body = UserListResponse),
        (status = 403, description = "Insufficient role", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListUsersQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = IdentityFilter {
        role: query.role.as_deref().map(parse_role).transpose()?,
        search: query.search.filter(|s| !s.trim().is_empty()),
        include_disabled: query.include_disabled.unwrap_or(false),
    };
    let page = state
        .stores
        .identities
        .list(&filter, PageRequest::new(query.page, query.page_size))
        .await?
        .map(AdminUserView::from);

    Ok(ApiResponse::new(
        "Users retrieved",
        UserListResponse {
            users: page.items,
            total: page.total,
            page: page.page,
            page_size: page.page_size,
        },
    ))
}

/// Get one user
#[utoipa::path(
    get,
    path = "/api/v1/admin/users/{id}",
    tag = "admin",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User found", body = UserResponse),
        (status = 404, description = "User not found", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let identity = load_identity(&state, id).await?;
    Ok(ApiResponse::new(
        "User retrieved",
        UserResponse {
            user: identity.into(),
        },
    ))
}

/// Update role, lock state, verification flag or name
///
/// Granting `admin`/`superadmin`, or modifying a superadmin, requires a
/// superadmin. Nobody may change their own role. Locking revokes every
/// session of the user.
#[utoipa::path(
    patch,
    path = "/api/v1/admin/users/{id}",
    tag = "admin",
    params(("id" = Uuid, Path, description = "User ID")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "User updated", body = UserResponse),
        (status = 400, description = "Invalid update", body = crate::error::ApiError),
        (status = 403, description = "Insufficient role", body = crate::error::ApiError),
        (status = 404, description = "User not found", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<UpdateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut identity = load_identity(&state, id).await?;
    let can_assign_privileged = actor.role.has_capability(Capability::AssignPrivilegedRoles);

    if identity.role == Role::Superadmin && !can_assign_privileged {
        return Err(AppError::InsufficientRole);
    }

    let mut changes = Vec::new();

    if let Some(role) = request.role.as_deref() {
        let role = parse_role(role)?;
        if role != identity.role {
            if actor.identity_id == identity.id {
                return Err(AppError::ValidationFailed(
                    "You cannot change your own role".to_string(),
                ));
            }
            if role.is_privileged() && !can_assign_privileged {
                return Err(AppError::InsufficientRole);
            }
            changes.push(format!("role:{}->{}", identity.role, role));
            identity.role = role;
        }
    }

    let mut revoke_sessions = false;
    if let Some(locked) = request.locked {
        if locked != identity.locked {
            if locked && actor.identity_id == identity.id {
                return Err(AppError::ValidationFailed(
                    "You cannot lock your own account".to_string(),
                ));
            }
            identity.locked = locked;
            if locked {
                revoke_sessions = true;
            } else {
                identity.locked_until = None;
                identity.failed_login_attempts = 0;
            }
            changes.push(format!("locked:{locked}"));
        }
    }

    if let Some(verified) = request.email_verified {
        if verified != identity.email_verified {
            identity.email_verified = verified;
            changes.push(format!("email_verified:{verified}"));
        }
    }

    if let Some(name) = request.name {
        let name = name.trim().to_string();
        if name != identity.name {
            identity.name = name;
            changes.push("name".to_string());
        }
    }

    if !changes.is_empty() {
        identity.updated_at = Utc::now();
        state.stores.identities.save(&identity).await?;
    }
    if revoke_sessions {
        let revoked = state.stores.sessions.revoke_all(identity.id).await?;
        changes.push(format!("sessions_revoked={revoked}"));
    }

    tracing::info!(actor = %actor.identity_id, target = %identity.id, changes = ?changes, "User updated");
    let detail = if changes.is_empty() {
        "no changes".to_string()
    } else {
        changes.join(",")
    };

    Ok((
        Extension(AuditDetail(detail)),
        ApiResponse::new(
            "User updated",
            UserResponse {
                user: identity.into(),
            },
        ),
    ))
}

/// Soft-delete a user and revoke every session
#[utoipa::path(
    delete,
    path = "/api/v1/admin/users/{id}",
    tag = "admin",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User disabled", body = SessionsRevokedResponse),
        (status = 400, description = "Cannot delete yourself", body = crate::error::ApiError),
        (status = 404, description = "User not found", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if actor.identity_id == id {
        return Err(AppError::ValidationFailed(
            "You cannot delete your own account".to_string(),
        ));
    }
    let mut identity = load_identity(&state, id).await?;
    if identity.role == Role::Superadmin
        && !actor.role.has_capability(Capability::AssignPrivilegedRoles)
    {
        return Err(AppError::InsufficientRole);
    }

    identity.disabled = true;
    identity.updated_at = Utc::now();
    state.stores.identities.save(&identity).await?;
    let sessions_revoked = state.stores.sessions.revoke_all(id).await?;

    tracing::info!(actor = %actor.identity_id, target = %id, sessions_revoked, "User disabled");
    Ok((
        Extension(AuditDetail(format!("sessions_revoked={sessions_revoked}"))),
        ApiResponse::new(
            "User deleted",
            SessionsRevokedResponse {
                user_id: id,
                sessions_revoked,
            },
        ),
    ))
}

/// Revoke every session of a user
#[utoipa::path(
    post,
    path = "/api/v1/admin/users/{id}/sessions/revoke",
    tag = "admin",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Sessions revoked", body = SessionsRevokedResponse),
        (status = 404, description = "User not found", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn revoke_user_sessions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    load_identity(&state, id).await?;
    let sessions_revoked = state.stores.sessions.revoke_all(id).await?;

    Ok((
        Extension(AuditDetail(format!("sessions_revoked={sessions_revoked}"))),
        ApiResponse::new(
            "Sessions revoked",
            SessionsRevokedResponse {
                user_id: id,
                sessions_revoked,
            },
        ),
    ))
}

/// Query the audit log, newest first
#[utoipa::path(
    get,
    path = "/api/v1/admin/audit-logs",
    tag = "admin",
    params(AuditLogQuery),
    responses(
        (status = 200, description = "Paginated audit entries", body = AuditLogResponse),
        (status = 400, description = "Invalid filter", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditLogQuery>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = query
        .outcome
        .as_deref()
        .map(|o| o.parse::<AuditOutcome>().map_err(AppError::ValidationFailed))
        .transpose()?;
    let filter = AuditFilter {
        action: query.action.filter(|a| !a.is_empty()),
        actor_id: query.user_id,
        outcome,
    };

    let page = state
        .stores
        .audit
        .list(&filter, PageRequest::new(query.page, query.page_size))
        .await?
        .map(AuditLogView::from);

    Ok(ApiResponse::new(
        "Audit logs retrieved",
        AuditLogResponse {
            logs: page.items,
            total: page.total,
            page: page.page,
            page_size: page.page_size,
        },
    ))
}

/// Dashboard statistics
#[utoipa::path(
    get,
    path = "/api/v1/admin/stats",
    tag = "admin",
    responses(
        (status = 200, description = "Aggregate counts", body = StatsResponse),
        (status = 403, description = "Insufficient role", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let (identities, active_sessions, audit_events_24h) = tokio::try_join!(
        state.stores.identities.stats(),
        state.stores.sessions.count_active(now),
        state.stores.audit.count_since(now - Duration::hours(24)),
    )?;

    Ok(ApiResponse::new(
        "Statistics retrieved",
        StatsResponse {
            total_users: identities.total,
            verified_users: identities.verified,
            locked_users: identities.locked,
            disabled_users: identities.disabled,
            users_by_role: identities.by_role,
            active_sessions,
            audit_events_24h,
            uptime_secs: state.uptime_secs(),
        },
    ))
}

/// Purge expired sessions and one-time tokens
#[utoipa::path(
    post,
    path = "/api/v1/admin/sessions/cleanup",
    tag = "admin",
    responses(
        (status = 200, description = "Expired rows purged", body = CleanupResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn cleanup_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let sessions_purged = state.stores.sessions.purge_expired(now).await?;
    let tokens_purged = state.stores.tokens.purge_expired(now).await?;

    Ok((
        Extension(AuditDetail(format!(
            "sessions_purged={sessions_purged},tokens_purged={tokens_purged}"
        ))),
        ApiResponse::new(
            "Expired sessions cleaned up",
            CleanupResponse {
                sessions_purged,
                tokens_purged,
            },
        ),
    ))
}
