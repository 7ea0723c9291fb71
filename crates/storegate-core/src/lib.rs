//! Storegate Core - Domain models, configuration and persistence seams
//!
//! This crate defines the shared abstractions for the session and
//! access-control service:
//! - Identity, role and capability models
//! - Refresh-token sessions with rotation chains
//! - One-time tokens for email verification and password reset
//! - Append-only audit log entries
//! - Store traits with in-memory and PostgreSQL implementations
//! - Configuration management

pub mod config;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use config::{
    AppConfig, AuthConfig, ConfigError, CookieConfig, CsrfConfig, DatabaseConfig, EmailConfig,
    EmailProvider, Environment, LoggingConfig, RateLimitConfig, ServerConfig, StorageBackend,
    WindowBudget,
};
pub use memory::{MemoryAuditStore, MemoryIdentityStore, MemoryOneTimeTokenStore, MemorySessionStore};
pub use models::{
    normalize_email, AuditFilter, AuditLogEntry, AuditOutcome, Capability, ConsumeOutcome,
    Identity, IdentityFilter, IdentityStats, NewAuditEntry, NewSession, OneTimeToken, Page,
    PageRequest, Role, Session, TokenPurpose, UnknownRole,
};
pub use postgres::{PgAuditStore, PgIdentityStore, PgOneTimeTokenStore, PgSessionStore};
pub use store::{
    AuditStore, IdentityStore, OneTimeTokenStore, RotateOutcome, SessionStore, StoreError,
    StoreResult,
};
