//! Application state management
//!
//! Author: hephaex@gmail.com

use crate::audit::AuditLogger;
use crate::auth::{AuthService, CookieSettings, TokenIssuer};
use crate::csrf::CsrfGuard;
use crate::email::EmailSender;
use crate::middleware::RateLimiter;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storegate_core::{
    postgres, AppConfig, AuditStore, IdentityStore, MemoryAuditStore, MemoryIdentityStore,
    MemoryOneTimeTokenStore, MemorySessionStore, OneTimeTokenStore, PgAuditStore,
    PgIdentityStore, PgOneTimeTokenStore, PgSessionStore, SessionStore, StoreError,
};

/// The four persistence seams, behind one backend
#[derive(Clone)]
pub struct Stores {
    pub identities: Arc<dyn IdentityStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub tokens: Arc<dyn OneTimeTokenStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            identities: Arc::new(MemoryIdentityStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            tokens: Arc::new(MemoryOneTimeTokenStore::new()),
            audit: Arc::new(MemoryAuditStore::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            identities: Arc::new(PgIdentityStore::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            tokens: Arc::new(PgOneTimeTokenStore::new(pool.clone())),
            audit: Arc::new(PgAuditStore::new(pool)),
        }
    }
}

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Server start time
    pub start_time: Instant,
    /// Ready status
    pub is_ready: AtomicBool,
    pub stores: Stores,
    pub issuer: TokenIssuer,
    pub csrf: CsrfGuard,
    pub rate_limiter: RateLimiter,
    pub audit: AuditLogger,
    pub email: Arc<dyn EmailSender>,
    pub auth: AuthService,
    pub cookies: CookieSettings,
    /// Present when running on the Postgres backend
    pub pg_pool: Option<PgPool>,
}

impl AppState {
    /// Wire services over the given stores
    pub fn new(
        config: AppConfig,
        stores: Stores,
        email: Arc<dyn EmailSender>,
        pg_pool: Option<PgPool>,
    ) -> Self {
        let audit = AuditLogger::new(
            stores.audit.clone(),
            Duration::from_millis(config.database.store_timeout_ms),
        );
        let issuer = TokenIssuer::new(
            &config.auth,
            stores.sessions.clone(),
            stores.identities.clone(),
            audit.clone(),
        );
        let auth = AuthService::new(
            stores.identities.clone(),
            stores.sessions.clone(),
            stores.tokens.clone(),
            issuer.clone(),
            audit.clone(),
            email.clone(),
            &config.auth,
        );

        Self {
            csrf: CsrfGuard::new(&config.csrf),
            rate_limiter: RateLimiter::new(&config.rate_limit),
            cookies: CookieSettings::from_config(&config),
            start_time: Instant::now(),
            is_ready: AtomicBool::new(true),
            config,
            stores,
            issuer,
            audit,
            email,
            auth,
            pg_pool,
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check if service is ready
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    /// Set ready status
    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the backing store answers
    pub async fn check_store(&self) -> Result<(), StoreError> {
        match &self.pg_pool {
            Some(pool) => postgres::ping(pool).await,
            None => Ok(()),
        }
    }
}
