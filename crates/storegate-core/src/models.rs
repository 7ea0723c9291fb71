//! Domain models for identities, sessions, one-time tokens and audit entries
//!
//! These map to the `identities`, `sessions`, `one_time_tokens` and
//! `audit_log` tables created by the embedded migrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Roles and capabilities
// ============================================================================

/// Capabilities granted by a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ManageOwnAccount,
    ViewDashboard,
    ModerateContent,
    ManageUsers,
    ViewAuditLog,
    ManageSessions,
    AssignPrivilegedRoles,
}

/// Role assigned to an identity
///
/// Roles are immutable reference data. Many identities share one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Moderator,
    Admin,
    Superadmin,
}

#[derive(Debug, Error)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

impl Role {
    pub const ALL: [Role; 4] = [Role::Customer, Role::Moderator, Role::Admin, Role::Superadmin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    /// Capability set for this role
    pub fn capabilities(&self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Role::Customer => &[ManageOwnAccount],
            Role::Moderator => &[ManageOwnAccount, ViewDashboard, ModerateContent],
            Role::Admin => &[
                ManageOwnAccount,
                ViewDashboard,
                ModerateContent,
                ManageUsers,
                ViewAuditLog,
                ManageSessions,
            ],
            Role::Superadmin => &[
                ManageOwnAccount,
                ViewDashboard,
                ModerateContent,
                ManageUsers,
                ViewAuditLog,
                ManageSessions,
                AssignPrivilegedRoles,
            ],
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Roles that only a superadmin may grant
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::Superadmin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Normalize an email address for storage and lookup
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// User account
///
/// Identities are never hard-deleted; `disabled` marks a soft delete so
/// audit entries keep pointing at a real row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,

    /// Normalized (lowercase) email address, unique
    pub email: String,

    pub name: String,

    /// Argon2id PHC string, never serialized
    #[serde(skip_serializing, default)]
    pub password_hash: String,

    pub role: Role,

    pub email_verified: bool,

    /// Locked by an administrator
    pub locked: bool,

    /// Soft-deleted
    pub disabled: bool,

    pub failed_login_attempts: i32,

    /// Automatic lockout after repeated failed logins
    pub locked_until: Option<DateTime<Utc>>,

    pub last_login: Option<DateTime<Utc>>,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(email: &str, name: impl Into<String>, password_hash: String, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            name: name.into(),
            password_hash,
            role,
            email_verified: false,
            locked: false,
            disabled: false,
            failed_login_attempts: 0,
            locked_until: None,
            last_login: None,
            password_changed_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Inside an automatic lockout window
    pub fn is_temporarily_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| now < until).unwrap_or(false)
    }

    /// Whether this identity may hold live sessions at all
    pub fn can_hold_sessions(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && !self.locked && !self.is_temporarily_locked(now)
    }
}

/// Filter for identity listings
#[derive(Debug, Clone, Default)]
pub struct IdentityFilter {
    pub role: Option<Role>,
    /// Case-insensitive substring match on email or name
    pub search: Option<String>,
    pub include_disabled: bool,
}

impl IdentityFilter {
    pub fn matches(&self, identity: &Identity) -> bool {
        if !self.include_disabled && identity.disabled {
            return false;
        }
        if let Some(role) = self.role {
            if identity.role != role {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !identity.email.contains(&needle) && !identity.name.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// Aggregate identity counts for the admin dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityStats {
    pub total: u64,
    pub verified: u64,
    pub locked: u64,
    pub disabled: u64,
    pub by_role: BTreeMap<String, u64>,
}

// ============================================================================
// Sessions (refresh tokens)
// ============================================================================

/// Refresh-token session
///
/// `family_id` is the id of the first session of the rotation chain; every
/// successor created by rotation inherits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub family_id: Uuid,
    /// SHA-256 of the opaque refresh secret
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<Uuid>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }
}

/// Input for creating a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub identity_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl NewSession {
    /// Materialize into a row; `family_id` of `None` starts a new chain
    pub fn into_session(self, id: Uuid, family_id: Option<Uuid>) -> Session {
        Session {
            id,
            identity_id: self.identity_id,
            family_id: family_id.unwrap_or(id),
            token_hash: self.token_hash,
            issued_at: Utc::now(),
            expires_at: self.expires_at,
            revoked_at: None,
            replaced_by: None,
            user_agent: self.user_agent,
            ip_address: self.ip_address,
        }
    }
}

// ============================================================================
// One-time tokens
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "email_verification",
            TokenPurpose::PasswordReset => "password_reset",
        }
    }
}

impl FromStr for TokenPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_verification" => Ok(TokenPurpose::EmailVerification),
            "password_reset" => Ok(TokenPurpose::PasswordReset),
            other => Err(format!("unknown token purpose: {other}")),
        }
    }
}

/// Email verification or password reset token, stored hashed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimeToken {
    pub token_hash: String,
    pub identity_id: Uuid,
    pub purpose: TokenPurpose,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OneTimeToken {
    pub fn new(
        token_hash: String,
        identity_id: Uuid,
        purpose: TokenPurpose,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_hash,
            identity_id,
            purpose,
            expires_at,
            consumed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Result of consuming a one-time token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// First successful use
    Consumed(Uuid),
    /// Token was already used; carries the owner for idempotent flows
    AlreadyConsumed(Uuid),
    Expired,
    NotFound,
}

// ============================================================================
// Audit log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Denied => "denied",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(AuditOutcome::Success),
            "failure" => Ok(AuditOutcome::Failure),
            "denied" => Ok(AuditOutcome::Denied),
            other => Err(format!("unknown audit outcome: {other}")),
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub target: Option<String>,
    pub outcome: AuditOutcome,
    pub source_address: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit record before it is persisted
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub target: Option<String>,
    pub outcome: AuditOutcome,
    pub source_address: Option<String>,
    pub detail: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            actor_id: None,
            action: action.into(),
            target: None,
            outcome,
            source_address: None,
            detail: None,
        }
    }

    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn source(mut self, source_address: Option<String>) -> Self {
        self.source_address = source_address;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn into_entry(self) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            actor_id: self.actor_id,
            action: self.action,
            target: self.target,
            outcome: self.outcome,
            source_address: self.source_address,
            detail: self.detail,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub actor_id: Option<Uuid>,
    pub outcome: Option<AuditOutcome>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.action.as_deref().map_or(true, |a| entry.action == a)
            && self.actor_id.map_or(true, |id| entry.actor_id == Some(id))
            && self.outcome.map_or(true, |o| entry.outcome == o)
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// One-based page request
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Clamp to `page >= 1` and `1 <= page_size <= MAX_PAGE_SIZE`
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(20).clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Slice an already-ordered collection
    pub fn from_ordered(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.limit() as usize)
            .collect();
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}
