//! PostgreSQL store backends
//!
//! Runtime-checked `sqlx` queries against the schema in `migrations/`.
//! Rotation takes the predecessor's row lock inside one transaction, so a
//! concurrent purge or second rotation waits for it to commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{
    AuditFilter, AuditLogEntry, AuditOutcome, ConsumeOutcome, Identity, IdentityFilter,
    IdentityStats, NewAuditEntry, NewSession, OneTimeToken, Page, PageRequest, Role, Session,
    TokenPurpose,
};
use crate::store::{
    AuditStore, IdentityStore, OneTimeTokenStore, RotateOutcome, SessionStore, StoreError,
    StoreResult,
};

/// Connect a pool and apply embedded migrations
pub async fn connect(config: &DatabaseConfig) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_millis(config.store_timeout_ms))
        .connect(&config.postgres_url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;

    Ok(pool)
}

/// Connectivity check used by readiness
pub async fn ping(pool: &PgPool) -> StoreResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// ============================================================================
// Row records
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
struct IdentityRecord {
    id: Uuid,
    email: String,
    name: String,
    password_hash: String,
    role: String,
    email_verified: bool,
    locked: bool,
    disabled: bool,
    failed_login_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    last_login: Option<DateTime<Utc>>,
    password_changed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRecord> for Identity {
    type Error = StoreError;

    fn try_from(row: IdentityRecord) -> Result<Self, Self::Error> {
        let role: Role = row
            .role
            .parse()
            .map_err(|e: crate::models::UnknownRole| StoreError::Corrupt(e.to_string()))?;
        Ok(Identity {
            id: row.id,
            email: row.email,
            name: row.name,
            password_hash: row.password_hash,
            role,
            email_verified: row.email_verified,
            locked: row.locked,
            disabled: row.disabled,
            failed_login_attempts: row.failed_login_attempts,
            locked_until: row.locked_until,
            last_login: row.last_login,
            password_changed_at: row.password_changed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRecord {
    id: Uuid,
    identity_id: Uuid,
    family_id: Uuid,
    token_hash: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    replaced_by: Option<Uuid>,
    user_agent: Option<String>,
    ip_address: Option<String>,
}

impl From<SessionRecord> for Session {
    fn from(row: SessionRecord) -> Self {
        Session {
            id: row.id,
            identity_id: row.identity_id,
            family_id: row.family_id,
            token_hash: row.token_hash,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
            replaced_by: row.replaced_by,
            user_agent: row.user_agent,
            ip_address: row.ip_address,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AuditRecord {
    id: Uuid,
    actor_id: Option<Uuid>,
    action: String,
    target: Option<String>,
    outcome: String,
    source_address: Option<String>,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRecord> for AuditLogEntry {
    type Error = StoreError;

    fn try_from(row: AuditRecord) -> Result<Self, Self::Error> {
        let outcome: AuditOutcome = row.outcome.parse().map_err(StoreError::Corrupt)?;
        Ok(AuditLogEntry {
            id: row.id,
            actor_id: row.actor_id,
            action: row.action,
            target: row.target,
            outcome,
            source_address: row.source_address,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

const IDENTITY_COLUMNS: &str = "id, email, name, password_hash, role, email_verified, locked, \
     disabled, failed_login_attempts, locked_until, last_login, password_changed_at, \
     created_at, updated_at";

const SESSION_COLUMNS: &str = "id, identity_id, family_id, token_hash, issued_at, expires_at, \
     revoked_at, replaced_by, user_agent, ip_address";

// ============================================================================
// Identities
// ============================================================================

#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn insert(&self, identity: Identity) -> StoreResult<Identity> {
        sqlx::query(
            "INSERT INTO identities (id, email, name, password_hash, role, email_verified, locked, \
             disabled, failed_login_attempts, locked_until, last_login, password_changed_at, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(identity.id)
        .bind(&identity.email)
        .bind(&identity.name)
        .bind(&identity.password_hash)
        .bind(identity.role.as_str())
        .bind(identity.email_verified)
        .bind(identity.locked)
        .bind(identity.disabled)
        .bind(identity.failed_login_attempts)
        .bind(identity.locked_until)
        .bind(identity.last_login)
        .bind(identity.password_changed_at)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(identity)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        sqlx::query_as::<_, IdentityRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Identity::try_from)
            .transpose()
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE email = $1");
        sqlx::query_as::<_, IdentityRecord>(&sql)
            .bind(crate::models::normalize_email(email))
            .fetch_optional(&self.pool)
            .await?
            .map(Identity::try_from)
            .transpose()
    }

    async fn save(&self, identity: &Identity) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE identities SET name = $2, password_hash = $3, role = $4, email_verified = $5, \
             locked = $6, disabled = $7, failed_login_attempts = $8, locked_until = $9, \
             last_login = $10, password_changed_at = $11, updated_at = NOW() WHERE id = $1",
        )
        .bind(identity.id)
        .bind(&identity.name)
        .bind(&identity.password_hash)
        .bind(identity.role.as_str())
        .bind(identity.email_verified)
        .bind(identity.locked)
        .bind(identity.disabled)
        .bind(identity.failed_login_attempts)
        .bind(identity.locked_until)
        .bind(identity.last_login)
        .bind(identity.password_changed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("identity {}", identity.id)));
        }
        Ok(())
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> StoreResult<Identity> {
        // The row lock taken by UPDATE serializes concurrent failures
        let sql = format!(
            "UPDATE identities SET \
             failed_login_attempts = CASE WHEN failed_login_attempts + 1 >= $2 THEN 0 \
                 ELSE failed_login_attempts + 1 END, \
             locked_until = CASE WHEN failed_login_attempts + 1 >= $2 THEN $3 \
                 ELSE locked_until END, \
             updated_at = NOW() \
             WHERE id = $1 RETURNING {IDENTITY_COLUMNS}"
        );
        sqlx::query_as::<_, IdentityRecord>(&sql)
            .bind(id)
            .bind(threshold)
            .bind(lock_until)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))
            .and_then(Identity::try_from)
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<Identity> {
        let sql = format!(
            "UPDATE identities SET failed_login_attempts = 0, locked_until = NULL, \
             last_login = $2, updated_at = $2 WHERE id = $1 RETURNING {IDENTITY_COLUMNS}"
        );
        sqlx::query_as::<_, IdentityRecord>(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))
            .and_then(Identity::try_from)
    }

    async fn list(&self, filter: &IdentityFilter, page: PageRequest) -> StoreResult<Page<Identity>> {
        const WHERE: &str = "($1::text IS NULL OR role = $1) \
             AND ($2::text IS NULL OR email ILIKE '%' || $2 || '%' OR name ILIKE '%' || $2 || '%') \
             AND ($3 OR NOT disabled)";

        let role = filter.role.map(|r| r.as_str());
        let search = filter.search.as_deref();

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM identities WHERE {WHERE}"))
            .bind(role)
            .bind(search)
            .bind(filter.include_disabled)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE {WHERE} \
             ORDER BY created_at ASC, id ASC LIMIT $4 OFFSET $5"
        );
        let items = sqlx::query_as::<_, IdentityRecord>(&sql)
            .bind(role)
            .bind(search)
            .bind(filter.include_disabled)
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Identity::try_from)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn stats(&self) -> StoreResult<IdentityStats> {
        let (total, verified, locked, disabled): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
             COUNT(*) FILTER (WHERE email_verified), \
             COUNT(*) FILTER (WHERE locked), \
             COUNT(*) FILTER (WHERE disabled) \
             FROM identities",
        )
        .fetch_one(&self.pool)
        .await?;

        let by_role: Vec<(String, i64)> =
            sqlx::query_as("SELECT role, COUNT(*) FROM identities GROUP BY role")
                .fetch_all(&self.pool)
                .await?;

        Ok(IdentityStats {
            total: total as u64,
            verified: verified as u64,
            locked: locked as u64,
            disabled: disabled as u64,
            by_role: by_role.into_iter().map(|(r, c)| (r, c as u64)).collect(),
        })
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: NewSession) -> StoreResult<Session> {
        let id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO sessions (id, identity_id, family_id, token_hash, expires_at, user_agent, ip_address) \
             VALUES ($1, $2, $1, $3, $4, $5, $6) RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(id)
            .bind(session.identity_id)
            .bind(&session.token_hash)
            .bind(session.expires_at)
            .bind(&session.user_agent)
            .bind(&session.ip_address)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn lookup(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = $1");
        Ok(sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?
            .map(Session::from))
    }

    async fn rotate(&self, session_id: Uuid, successor: NewSession) -> StoreResult<RotateOutcome> {
        let mut tx = self.pool.begin().await?;
        let successor_id = Uuid::new_v4();

        let revoked = sqlx::query(
            "UPDATE sessions SET revoked_at = NOW(), replaced_by = $2 \
             WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(session_id)
        .bind(successor_id)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM sessions WHERE id = $1)")
                    .bind(session_id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(if exists {
                RotateOutcome::AlreadyRevoked
            } else {
                RotateOutcome::NotFound
            });
        }

        let sql = format!(
            "INSERT INTO sessions (id, identity_id, family_id, token_hash, expires_at, user_agent, ip_address) \
             SELECT $1, identity_id, family_id, $3, $4, $5, $6 FROM sessions WHERE id = $2 \
             RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(successor_id)
            .bind(session_id)
            .bind(&successor.token_hash)
            .bind(successor.expires_at)
            .bind(&successor.user_agent)
            .bind(&successor.ip_address)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RotateOutcome::Rotated(row.into()))
    }

    async fn revoke(&self, session_id: Uuid) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE sessions SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL")
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_chain(&self, identity_id: Uuid, session_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked_at = NOW() \
             WHERE identity_id = $1 AND revoked_at IS NULL \
             AND family_id = (SELECT family_id FROM sessions WHERE id = $2)",
        )
        .bind(identity_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all(&self, identity_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked_at = NOW() WHERE identity_id = $1 AND revoked_at IS NULL",
        )
        .bind(identity_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_active(&self, identity_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE identity_id = $1 AND revoked_at IS NULL AND expires_at > $2 \
             ORDER BY issued_at DESC"
        );
        Ok(sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(identity_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Session::from)
            .collect())
    }

    async fn count_active(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE revoked_at IS NULL AND expires_at > $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// One-time tokens
// ============================================================================

#[derive(Clone)]
pub struct PgOneTimeTokenStore {
    pool: PgPool,
}

impl PgOneTimeTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OneTimeTokenStore for PgOneTimeTokenStore {
    async fn issue(&self, token: OneTimeToken) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO one_time_tokens (token_hash, identity_id, purpose, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&token.token_hash)
        .bind(token.identity_id)
        .bind(token.purpose.as_str())
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome> {
        let consumed: Option<Uuid> = sqlx::query_scalar(
            "UPDATE one_time_tokens SET consumed_at = $3 \
             WHERE token_hash = $1 AND purpose = $2 AND consumed_at IS NULL AND expires_at > $3 \
             RETURNING identity_id",
        )
        .bind(token_hash)
        .bind(purpose.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(identity_id) = consumed {
            return Ok(ConsumeOutcome::Consumed(identity_id));
        }

        let existing: Option<(Uuid, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT identity_id, consumed_at FROM one_time_tokens WHERE token_hash = $1 AND purpose = $2",
        )
        .bind(token_hash)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            None => ConsumeOutcome::NotFound,
            Some((identity_id, Some(_))) => ConsumeOutcome::AlreadyConsumed(identity_id),
            Some((_, None)) => ConsumeOutcome::Expired,
        })
    }

    async fn invalidate_for(&self, identity_id: Uuid, purpose: TokenPurpose) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE one_time_tokens SET consumed_at = NOW() \
             WHERE identity_id = $1 AND purpose = $2 AND consumed_at IS NULL",
        )
        .bind(identity_id)
        .bind(purpose.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM one_time_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Audit log
// ============================================================================

#[derive(Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, entry: NewAuditEntry) -> StoreResult<AuditLogEntry> {
        let entry = entry.into_entry();
        sqlx::query(
            "INSERT INTO audit_log (id, actor_id, action, target, outcome, source_address, detail, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(entry.actor_id)
        .bind(&entry.action)
        .bind(&entry.target)
        .bind(entry.outcome.as_str())
        .bind(&entry.source_address)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn list(&self, filter: &AuditFilter, page: PageRequest) -> StoreResult<Page<AuditLogEntry>> {
        const WHERE: &str = "($1::text IS NULL OR action = $1) \
             AND ($2::uuid IS NULL OR actor_id = $2) \
             AND ($3::text IS NULL OR outcome = $3)";

        let outcome = filter.outcome.map(|o| o.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM audit_log WHERE {WHERE}"))
            .bind(filter.action.as_deref())
            .bind(filter.actor_id)
            .bind(outcome)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT id, actor_id, action, target, outcome, source_address, detail, created_at \
             FROM audit_log WHERE {WHERE} ORDER BY created_at DESC, id DESC LIMIT $4 OFFSET $5"
        );
        let items = sqlx::query_as::<_, AuditRecord>(&sql)
            .bind(filter.action.as_deref())
            .bind(filter.actor_id)
            .bind(outcome)
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AuditLogEntry::try_from)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn count_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE created_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
