//! In-memory store backends
//!
//! Used for development and tests. Each table sits behind a single
//! `tokio::sync::RwLock`; reads share the lock and every write is serialized,
//! which gives rotation and purge the same per-row exclusion the Postgres
//! backend gets from row locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    AuditFilter, AuditLogEntry, ConsumeOutcome, Identity, IdentityFilter, IdentityStats,
    NewAuditEntry, NewSession, OneTimeToken, Page, PageRequest, Session, TokenPurpose,
};
use crate::store::{
    AuditStore, IdentityStore, OneTimeTokenStore, RotateOutcome, SessionStore, StoreError,
    StoreResult,
};

// ============================================================================
// Identities
// ============================================================================

#[derive(Default)]
pub struct MemoryIdentityStore {
    rows: RwLock<HashMap<Uuid, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn insert(&self, identity: Identity) -> StoreResult<Identity> {
        let mut rows = self.rows.write().await;
        if rows.values().any(|row| row.email == identity.email) {
            return Err(StoreError::Conflict(format!(
                "email already registered: {}",
                identity.email
            )));
        }
        rows.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        let email = crate::models::normalize_email(email);
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|row| row.email == email)
            .cloned())
    }

    async fn save(&self, identity: &Identity) -> StoreResult<()> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&identity.id) {
            Some(row) => {
                *row = identity.clone();
                row.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("identity {}", identity.id))),
        }
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> StoreResult<Identity> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))?;
        row.failed_login_attempts += 1;
        if row.failed_login_attempts >= threshold {
            row.failed_login_attempts = 0;
            row.locked_until = Some(lock_until);
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<Identity> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))?;
        row.failed_login_attempts = 0;
        row.locked_until = None;
        row.last_login = Some(at);
        row.updated_at = at;
        Ok(row.clone())
    }

    async fn list(&self, filter: &IdentityFilter, page: PageRequest) -> StoreResult<Page<Identity>> {
        let mut matching: Vec<Identity> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(Page::from_ordered(matching, page))
    }

    async fn stats(&self) -> StoreResult<IdentityStats> {
        let rows = self.rows.read().await;
        let mut stats = IdentityStats::default();
        for row in rows.values() {
            stats.total += 1;
            if row.email_verified {
                stats.verified += 1;
            }
            if row.locked {
                stats.locked += 1;
            }
            if row.disabled {
                stats.disabled += 1;
            }
            *stats.by_role.entry(row.role.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Default)]
struct SessionTable {
    rows: HashMap<Uuid, Session>,
    by_hash: HashMap<String, Uuid>,
}

impl SessionTable {
    fn insert(&mut self, session: Session) {
        self.by_hash.insert(session.token_hash.clone(), session.id);
        self.rows.insert(session.id, session);
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    table: RwLock<SessionTable>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: NewSession) -> StoreResult<Session> {
        let mut table = self.table.write().await;
        if table.by_hash.contains_key(&session.token_hash) {
            return Err(StoreError::Conflict("duplicate refresh token hash".to_string()));
        }
        let session = session.into_session(Uuid::new_v4(), None);
        table.insert(session.clone());
        Ok(session)
    }

    async fn lookup(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let table = self.table.read().await;
        Ok(table
            .by_hash
            .get(token_hash)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn rotate(&self, session_id: Uuid, successor: NewSession) -> StoreResult<RotateOutcome> {
        let mut table = self.table.write().await;

        let family_id = match table.rows.get(&session_id) {
            None => return Ok(RotateOutcome::NotFound),
            Some(current) if current.is_revoked() => return Ok(RotateOutcome::AlreadyRevoked),
            Some(current) => current.family_id,
        };

        let next = successor.into_session(Uuid::new_v4(), Some(family_id));
        if let Some(current) = table.rows.get_mut(&session_id) {
            current.revoked_at = Some(Utc::now());
            current.replaced_by = Some(next.id);
        }
        table.insert(next.clone());
        Ok(RotateOutcome::Rotated(next))
    }

    async fn revoke(&self, session_id: Uuid) -> StoreResult<bool> {
        let mut table = self.table.write().await;
        match table.rows.get_mut(&session_id) {
            Some(session) if !session.is_revoked() => {
                session.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_chain(&self, identity_id: Uuid, session_id: Uuid) -> StoreResult<u64> {
        let mut table = self.table.write().await;
        let Some(family_id) = table.rows.get(&session_id).map(|s| s.family_id) else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut revoked = 0;
        for session in table.rows.values_mut() {
            if session.family_id == family_id
                && session.identity_id == identity_id
                && !session.is_revoked()
            {
                session.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_all(&self, identity_id: Uuid) -> StoreResult<u64> {
        let mut table = self.table.write().await;
        let now = Utc::now();
        let mut revoked = 0;
        for session in table.rows.values_mut() {
            if session.identity_id == identity_id && !session.is_revoked() {
                session.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn list_active(&self, identity_id: Uuid, now: DateTime<Utc>) -> StoreResult<Vec<Session>> {
        let table = self.table.read().await;
        let mut sessions: Vec<Session> = table
            .rows
            .values()
            .filter(|s| s.identity_id == identity_id && s.is_active(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(sessions)
    }

    async fn count_active(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let table = self.table.read().await;
        Ok(table.rows.values().filter(|s| s.is_active(now)).count() as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut table = self.table.write().await;
        let expired: Vec<Uuid> = table
            .rows
            .values()
            .filter(|s| s.expires_at < now)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            if let Some(session) = table.rows.remove(id) {
                table.by_hash.remove(&session.token_hash);
            }
        }
        Ok(expired.len() as u64)
    }
}

// ============================================================================
// One-time tokens
// ============================================================================

#[derive(Default)]
pub struct MemoryOneTimeTokenStore {
    rows: RwLock<HashMap<String, OneTimeToken>>,
}

impl MemoryOneTimeTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OneTimeTokenStore for MemoryOneTimeTokenStore {
    async fn issue(&self, token: OneTimeToken) -> StoreResult<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("duplicate one-time token".to_string()));
        }
        rows.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn consume(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StoreResult<ConsumeOutcome> {
        let mut rows = self.rows.write().await;
        let Some(token) = rows.get_mut(token_hash).filter(|t| t.purpose == purpose) else {
            return Ok(ConsumeOutcome::NotFound);
        };
        if token.consumed_at.is_some() {
            return Ok(ConsumeOutcome::AlreadyConsumed(token.identity_id));
        }
        if now >= token.expires_at {
            return Ok(ConsumeOutcome::Expired);
        }
        token.consumed_at = Some(now);
        Ok(ConsumeOutcome::Consumed(token.identity_id))
    }

    async fn invalidate_for(&self, identity_id: Uuid, purpose: TokenPurpose) -> StoreResult<u64> {
        let mut rows = self.rows.write().await;
        let now = Utc::now();
        let mut count = 0;
        for token in rows.values_mut() {
            if token.identity_id == identity_id
                && token.purpose == purpose
                && token.consumed_at.is_none()
            {
                token.consumed_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, token| token.expires_at >= now);
        Ok((before - rows.len()) as u64)
    }
}

// ============================================================================
// Audit log
// ============================================================================

#[derive(Default)]
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: NewAuditEntry) -> StoreResult<AuditLogEntry> {
        let entry = entry.into_entry();
        self.entries.write().await.push(entry.clone());
        Ok(entry)
    }

    async fn list(&self, filter: &AuditFilter, page: PageRequest) -> StoreResult<Page<AuditLogEntry>> {
        // Appended in time order; reversing gives newest first
        let matching: Vec<AuditLogEntry> = self
            .entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        Ok(Page::from_ordered(matching, page))
    }

    async fn count_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.created_at >= since)
            .count() as u64)
    }
}
