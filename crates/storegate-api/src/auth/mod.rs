//! Authentication and authorization module
//!
//! - Token issuance, verification and refresh rotation
//! - Password hashing with Argon2id
//! - Session cookies
//! - Middleware for request authentication and role gating
//! - Authentication service for account flows

pub mod cookies;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod service;

pub use cookies::CookieSettings;
pub use jwt::{Claims, JwtConfig, JwtError, TokenIssuer, TokenPair};
pub use middleware::{auth_middleware, role_gate, AuditDetail, AuthenticatedUser, RoleGate};
pub use password::{validate_password_strength, PasswordConfig, PasswordError};
pub use service::{AuthResponse, AuthService, UserInfo, VerifyOutcome};
