//! Persistence seams
//!
//! Every backend implements these traits so the service layer never
//! depends on a concrete database. Each method is one atomic unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AuditFilter, AuditLogEntry, ConsumeOutcome, Identity, IdentityFilter, IdentityStats,
    NewAuditEntry, NewSession, OneTimeToken, Page, PageRequest, Session, TokenPurpose,
};

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Backend unreachable or timed out
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Result of an atomic rotation
#[derive(Debug, Clone)]
pub enum RotateOutcome {
    /// Predecessor revoked and successor created in one step
    Rotated(Session),
    /// Predecessor was already revoked; nothing was written
    AlreadyRevoked,
    NotFound,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert a new identity; `Conflict` when the email is taken
    async fn insert(&self, identity: Identity) -> StoreResult<Identity>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>>;

    /// Lookup by normalized email
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Identity>>;

    /// Overwrite every mutable field of an existing identity
    async fn save(&self, identity: &Identity) -> StoreResult<()>;

    /// Count one failed login in place. The increment that reaches
    /// `threshold` resets the counter and sets `locked_until`.
    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> StoreResult<Identity>;

    /// Clear the failure counter and lockout, stamping `last_login`
    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<Identity>;

    /// List identities ordered by creation time, oldest first
    async fn list(&self, filter: &IdentityFilter, page: PageRequest) -> StoreResult<Page<Identity>>;

    async fn stats(&self) -> StoreResult<IdentityStats>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: NewSession) -> StoreResult<Session>;

    /// Lookup by refresh-token hash, including revoked and expired rows
    async fn lookup(&self, token_hash: &str) -> StoreResult<Option<Session>>;

    /// Revoke `session_id` and create its successor in the same family.
    ///
    /// At most one concurrent caller observes `Rotated` for a given session.
    async fn rotate(&self, session_id: Uuid, successor: NewSession) -> StoreResult<RotateOutcome>;

    /// Revoke a single session; returns whether it was active
    async fn revoke(&self, session_id: Uuid) -> StoreResult<bool>;

    /// Revoke every session in the rotation family of `session_id`
    async fn revoke_chain(&self, identity_id: Uuid, session_id: Uuid) -> StoreResult<u64>;

    /// Revoke every session of an identity
    async fn revoke_all(&self, identity_id: Uuid) -> StoreResult<u64>;

    /// Active sessions of an identity, newest first
    async fn list_active(&self, identity_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<Session>>;

    async fn count_active(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete sessions expired before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait OneTimeTokenStore: Send + Sync {
    async fn issue(&self, token: OneTimeToken) -> StoreResult<()>;

    /// Mark a token consumed. Only one caller ever sees `Consumed`.
    async fn consume(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome>;

    /// Mark every outstanding token of this purpose consumed
    async fn invalidate_for(&self, identity_id: Uuid, purpose: TokenPurpose) -> StoreResult<u64>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> StoreResult<AuditLogEntry>;

    /// Entries matching `filter`, newest first
    async fn list(&self, filter: &AuditFilter, page: PageRequest) -> StoreResult<Page<AuditLogEntry>>;

    async fn count_since(&self, since: DateTime<Utc>) -> StoreResult<u64>;
}
