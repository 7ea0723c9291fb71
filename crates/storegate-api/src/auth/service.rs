//! Authentication service layer
//!
//! Account flows on top of the stores and the token issuer: registration,
//! login with lockout, logout, email verification and password recovery.

use super::jwt::{generate_opaque_token, hash_token, TokenIssuer, TokenPair};
use super::middleware::AuthenticatedUser;
use super::password::{
    hash_password_blocking, hash_password_with_config, validate_password_strength,
    verify_password_blocking, PasswordConfig,
};
use crate::audit::{actions, AuditLogger, ClientInfo};
use crate::email::EmailSender;
use crate::error::AppError;
use crate::middleware::metrics::record_auth_event;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storegate_core::{
    normalize_email, AuditOutcome, AuthConfig, ConsumeOutcome, Identity, IdentityStore,
    NewAuditEntry, OneTimeToken, OneTimeTokenStore, Role, Session, SessionStore, TokenPurpose,
};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// User registration request
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    #[validate(length(min = 8, max = 128, message = "must be 8 to 128 characters"))]
    pub password: String,
    #[validate(length(min = 1, max = 100, message = "must be 1 to 100 characters"))]
    pub name: String,
}

/// User login request
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    #[validate(length(min = 1, message = "is required"))]
    pub password: String,
}

/// Token refresh request; the refresh cookie takes precedence
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

/// Request carrying only an email address
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct EmailRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1, message = "is required"))]
    pub token: String,
    #[validate(length(min = 8, max = 128, message = "must be 8 to 128 characters"))]
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "is required"))]
    pub current_password: String,
    #[validate(length(min = 8, max = 128, message = "must be 8 to 128 characters"))]
    pub new_password: String,
}

/// Public profile
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub email_verified: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Identity> for UserInfo {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            email: identity.email.clone(),
            name: identity.name.clone(),
            role: identity.role.as_str().to_string(),
            email_verified: identity.email_verified,
            last_login: identity.last_login,
            created_at: identity.created_at,
        }
    }
}

/// Token payload returned by login and refresh
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

impl AuthResponse {
    pub fn new(pair: &TokenPair, identity: Option<&Identity>) -> Self {
        Self {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
            token_type: "Bearer".to_string(),
            expires_in: pair.access_expires_in,
            refresh_expires_in: pair.refresh_expires_in,
            user: identity.map(UserInfo::from),
        }
    }
}

/// Result of registration
#[derive(Debug)]
pub struct Registered {
    pub identity: Identity,
    pub email_sent: bool,
}

/// Result of a successful login
#[derive(Debug)]
pub struct LoggedIn {
    pub identity: Identity,
    pub tokens: TokenPair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService {
    identities: Arc<dyn IdentityStore>,
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn OneTimeTokenStore>,
    issuer: TokenIssuer,
    audit: AuditLogger,
    email: Arc<dyn EmailSender>,
    password: PasswordConfig,
    /// Verified against for unknown emails so every login pays one Argon2 check
    dummy_hash: String,
    config: AuthConfig,
}

/// Well-formed Argon2id PHC string, used only if hashing fails at startup
const DUMMY_HASH_FALLBACK: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c3RvcmVnYXRlZHVtbXk$0bJ0R6wKjtxdM4Kk9NvWcR1Pd3Hn5QFbYbC7xX8e2Yw";

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<dyn OneTimeTokenStore>,
        issuer: TokenIssuer,
        audit: AuditLogger,
        email: Arc<dyn EmailSender>,
        config: &AuthConfig,
    ) -> Self {
        let password = PasswordConfig::from_auth_config(config);
        let dummy_hash = hash_password_with_config(&generate_opaque_token(), &password)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default parameters for the dummy hash");
                DUMMY_HASH_FALLBACK.to_string()
            });
        Self {
            identities,
            sessions,
            tokens,
            issuer,
            audit,
            email,
            password,
            dummy_hash,
            config: config.clone(),
        }
    }

    pub fn password_config(&self) -> &PasswordConfig {
        &self.password
    }

    /// Hash a password with the configured parameters
    pub async fn hash_password(&self, password: &str) -> Result<String, AppError> {
        hash_password_blocking(password.to_string(), self.password.clone())
            .await
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    /// Register a new customer and send the verification email
    pub async fn register(
        &self,
        request: RegisterRequest,
        client: &ClientInfo,
    ) -> Result<Registered, AppError> {
        validate_password_strength(&request.password).map_err(AppError::ValidationFailed)?;

        let email = normalize_email(&request.email);
        if self.identities.find_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict("Email is already registered".to_string()));
        }

        let hash = self.hash_password(&request.password).await?;
        let identity = self
            .identities
            .insert(Identity::new(&email, request.name.trim(), hash, Role::Customer))
            .await?;

        let email_sent = match self.send_verification(&identity).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(identity_id = %identity.id, error = %e, "Verification email not sent");
                false
            }
        };

        tracing::info!(identity_id = %identity.id, "Identity registered");
        self.audit.record_detached(
            NewAuditEntry::new(actions::REGISTER, AuditOutcome::Success)
                .actor(identity.id)
                .target(identity.id.to_string())
                .source(client.ip_address.clone()),
        );
        record_auth_event("register");

        Ok(Registered {
            identity,
            email_sent,
        })
    }

    /// Authenticate with email and password
    ///
    /// Account state is checked before the password: disabled, admin lock,
    /// then the automatic lockout window.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<LoggedIn, AppError> {
        let email = normalize_email(email);
        let Some(identity) = self.identities.find_by_email(&email).await? else {
            // Same Argon2 cost as a wrong password for a known account
            let _ = verify_password_blocking(password.to_string(), self.dummy_hash.clone()).await;
            self.login_failed(None, client, "unknown email");
            return Err(AppError::InvalidCredentials);
        };

        let now = Utc::now();
        if identity.disabled {
            self.login_failed(Some(identity.id), client, "account disabled");
            return Err(AppError::AccountUnavailable("Account is disabled".to_string()));
        }
        if identity.locked {
            self.login_failed(Some(identity.id), client, "account locked");
            return Err(AppError::AccountUnavailable("Account is locked".to_string()));
        }
        if identity.is_temporarily_locked(now) {
            self.login_failed(Some(identity.id), client, "lockout window");
            return Err(AppError::AccountUnavailable(
                "Account is temporarily locked after repeated failed logins".to_string(),
            ));
        }

        let valid = verify_password_blocking(password.to_string(), identity.password_hash.clone())
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        if !valid {
            let threshold = self.config.max_failed_attempts.max(1) as i32;
            let lock_until = now + Duration::minutes(self.config.lockout_duration_mins);
            let updated = self
                .identities
                .record_failed_login(identity.id, threshold, lock_until)
                .await?;
            if updated.locked_until == Some(lock_until) {
                tracing::warn!(identity_id = %identity.id, "Account locked after repeated failed logins");
                self.audit.record_detached(
                    NewAuditEntry::new(actions::ACCOUNT_LOCKED, AuditOutcome::Success)
                        .target(identity.id.to_string())
                        .source(client.ip_address.clone())
                        .detail(format!("lockout_mins={}", self.config.lockout_duration_mins)),
                );
            }
            self.login_failed(Some(identity.id), client, "wrong password");
            return Err(AppError::InvalidCredentials);
        }

        if self.config.require_verified_email && !identity.email_verified {
            self.login_failed(Some(identity.id), client, "email not verified");
            return Err(AppError::AccountUnavailable(
                "Email address has not been verified".to_string(),
            ));
        }

        let identity = self.identities.record_login(identity.id, now).await?;

        let tokens = self.issuer.issue(&identity, client).await?;

        tracing::info!(identity_id = %identity.id, session_id = %tokens.session.id, "Login succeeded");
        self.audit.record_detached(
            NewAuditEntry::new(actions::LOGIN, AuditOutcome::Success)
                .actor(identity.id)
                .source(client.ip_address.clone()),
        );
        record_auth_event("login_success");

        Ok(LoggedIn { identity, tokens })
    }

    fn login_failed(&self, identity_id: Option<Uuid>, client: &ClientInfo, reason: &str) {
        let mut entry = NewAuditEntry::new(actions::LOGIN, AuditOutcome::Failure)
            .source(client.ip_address.clone())
            .detail(reason);
        if let Some(id) = identity_id {
            entry = entry.target(id.to_string());
        }
        self.audit.record_detached(entry);
        record_auth_event("login_failure");
    }

    /// Exchange a refresh token
    pub async fn refresh(&self, refresh_token: &str, client: &ClientInfo) -> Result<TokenPair, AppError> {
        let pair = self.issuer.rotate(refresh_token, client).await?;
        record_auth_event("refresh");
        Ok(pair)
    }

    /// Revoke the caller's current session
    pub async fn logout(&self, user: &AuthenticatedUser, client: &ClientInfo) -> Result<(), AppError> {
        let revoked = self.sessions.revoke(user.session_id).await?;
        tracing::info!(identity_id = %user.identity_id, revoked, "Logged out");
        self.audit.record_detached(
            NewAuditEntry::new(actions::LOGOUT, AuditOutcome::Success)
                .actor(user.identity_id)
                .target(user.session_id.to_string())
                .source(client.ip_address.clone()),
        );
        Ok(())
    }

    /// Revoke every session of the caller
    pub async fn logout_all(&self, user: &AuthenticatedUser, client: &ClientInfo) -> Result<u64, AppError> {
        let revoked = self.sessions.revoke_all(user.identity_id).await?;
        self.audit
            .record(
                NewAuditEntry::new(actions::LOGOUT_ALL, AuditOutcome::Success)
                    .actor(user.identity_id)
                    .target(user.identity_id.to_string())
                    .source(client.ip_address.clone())
                    .detail(format!("sessions_revoked={revoked}")),
            )
            .await?;
        Ok(revoked)
    }

    /// Confirm an email address; repeat use of the same token is a no-op
    pub async fn verify_email(&self, token: &str) -> Result<VerifyOutcome, AppError> {
        let outcome = self
            .tokens
            .consume(&hash_token(token), TokenPurpose::EmailVerification, Utc::now())
            .await?;

        match outcome {
            ConsumeOutcome::Consumed(identity_id) => {
                let mut identity = self.require_identity(identity_id).await?;
                if !identity.email_verified {
                    identity.email_verified = true;
                    identity.updated_at = Utc::now();
                    self.identities.save(&identity).await?;
                }
                self.audit.record_detached(
                    NewAuditEntry::new(actions::EMAIL_VERIFIED, AuditOutcome::Success)
                        .actor(identity_id),
                );
                Ok(VerifyOutcome::Verified)
            }
            ConsumeOutcome::AlreadyConsumed(identity_id) => {
                let identity = self.require_identity(identity_id).await?;
                if identity.email_verified {
                    Ok(VerifyOutcome::AlreadyVerified)
                } else {
                    Err(AppError::ValidationFailed(
                        "Verification link is no longer valid".to_string(),
                    ))
                }
            }
            ConsumeOutcome::Expired => Err(AppError::ValidationFailed(
                "Verification link has expired".to_string(),
            )),
            ConsumeOutcome::NotFound => Err(AppError::ValidationFailed(
                "Invalid verification link".to_string(),
            )),
        }
    }

    /// Send a fresh verification email; the answer never reveals whether
    /// the address exists
    pub async fn resend_verification(&self, email: &str) -> Result<(), AppError> {
        let email = normalize_email(email);
        if let Some(identity) = self.identities.find_by_email(&email).await? {
            if !identity.email_verified && !identity.disabled {
                self.tokens
                    .invalidate_for(identity.id, TokenPurpose::EmailVerification)
                    .await?;
                if let Err(e) = self.send_verification(&identity).await {
                    tracing::warn!(identity_id = %identity.id, error = %e, "Verification email not sent");
                }
            }
        }
        Ok(())
    }

    /// Start password recovery; uniform answer for unknown addresses
    pub async fn forgot_password(&self, email: &str, client: &ClientInfo) -> Result<(), AppError> {
        let email = normalize_email(email);
        let Some(identity) = self.identities.find_by_email(&email).await? else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        };
        if identity.disabled {
            return Ok(());
        }

        self.tokens
            .invalidate_for(identity.id, TokenPurpose::PasswordReset)
            .await?;
        let token = generate_opaque_token();
        self.tokens
            .issue(OneTimeToken::new(
                hash_token(&token),
                identity.id,
                TokenPurpose::PasswordReset,
                Utc::now() + Duration::minutes(self.config.reset_token_ttl_mins),
            ))
            .await?;

        if let Err(e) = self
            .email
            .send_password_reset(&identity.email, &identity.name, &token)
            .await
        {
            tracing::warn!(identity_id = %identity.id, error = %e, "Password reset email not sent");
        }

        self.audit.record_detached(
            NewAuditEntry::new(actions::PASSWORD_RESET_REQUESTED, AuditOutcome::Success)
                .target(identity.id.to_string())
                .source(client.ip_address.clone()),
        );
        Ok(())
    }

    /// Set a new password with a single-use reset token
    ///
    /// Clears any lockout and revokes every session.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        client: &ClientInfo,
    ) -> Result<u64, AppError> {
        validate_password_strength(new_password).map_err(AppError::ValidationFailed)?;

        let identity_id = match self
            .tokens
            .consume(&hash_token(token), TokenPurpose::PasswordReset, Utc::now())
            .await?
        {
            ConsumeOutcome::Consumed(identity_id) => identity_id,
            ConsumeOutcome::AlreadyConsumed(_) => {
                return Err(AppError::ValidationFailed(
                    "Reset link has already been used".to_string(),
                ))
            }
            ConsumeOutcome::Expired => {
                return Err(AppError::ValidationFailed("Reset link has expired".to_string()))
            }
            ConsumeOutcome::NotFound => {
                return Err(AppError::ValidationFailed("Invalid reset link".to_string()))
            }
        };

        let mut identity = self.require_identity(identity_id).await?;
        let now = Utc::now();
        identity.password_hash = self.hash_password(new_password).await?;
        identity.password_changed_at = now;
        identity.failed_login_attempts = 0;
        identity.locked_until = None;
        identity.updated_at = now;
        self.identities.save(&identity).await?;

        let revoked = self.sessions.revoke_all(identity.id).await?;
        tracing::info!(identity_id = %identity.id, revoked, "Password reset");
        self.audit
            .record(
                NewAuditEntry::new(actions::PASSWORD_RESET, AuditOutcome::Success)
                    .actor(identity.id)
                    .target(identity.id.to_string())
                    .source(client.ip_address.clone())
                    .detail(format!("sessions_revoked={revoked}")),
            )
            .await?;
        Ok(revoked)
    }

    /// Change the caller's password and revoke every session
    pub async fn change_password(
        &self,
        user: &AuthenticatedUser,
        request: &ChangePasswordRequest,
        client: &ClientInfo,
    ) -> Result<u64, AppError> {
        let mut identity = self.require_identity(user.identity_id).await?;

        let valid = verify_password_blocking(
            request.current_password.clone(),
            identity.password_hash.clone(),
        )
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
        if !valid {
            return Err(AppError::InvalidCredentials);
        }
        if request.current_password == request.new_password {
            return Err(AppError::ValidationFailed(
                "New password must differ from the current password".to_string(),
            ));
        }
        validate_password_strength(&request.new_password).map_err(AppError::ValidationFailed)?;

        let now = Utc::now();
        identity.password_hash = self.hash_password(&request.new_password).await?;
        identity.password_changed_at = now;
        identity.updated_at = now;
        self.identities.save(&identity).await?;

        let revoked = self.sessions.revoke_all(identity.id).await?;
        self.audit
            .record(
                NewAuditEntry::new(actions::PASSWORD_CHANGE, AuditOutcome::Success)
                    .actor(identity.id)
                    .target(identity.id.to_string())
                    .source(client.ip_address.clone())
                    .detail(format!("sessions_revoked={revoked}")),
            )
            .await?;
        Ok(revoked)
    }

    pub async fn me(&self, user: &AuthenticatedUser) -> Result<Identity, AppError> {
        self.require_identity(user.identity_id).await
    }

    /// Active sessions of the caller, newest first
    pub async fn sessions(&self, user: &AuthenticatedUser) -> Result<Vec<Session>, AppError> {
        Ok(self.sessions.list_active(user.identity_id, Utc::now()).await?)
    }

    async fn require_identity(&self, id: Uuid) -> Result<Identity, AppError> {
        self.identities
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound("User".to_string()))
    }

    async fn send_verification(&self, identity: &Identity) -> Result<(), AppError> {
        let token = generate_opaque_token();
        self.tokens
            .issue(OneTimeToken::new(
                hash_token(&token),
                identity.id,
                TokenPurpose::EmailVerification,
                Utc::now() + Duration::hours(self.config.verification_token_ttl_hours),
            ))
            .await?;
        self.email
            .send_verification(&identity.email, &identity.name, &token)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{EmailKind, RecordingEmailSender};
    use std::time::Duration as StdDuration;
    use storegate_core::{
        AuditFilter, AuditStore, MemoryAuditStore, MemoryIdentityStore, MemoryOneTimeTokenStore,
        MemorySessionStore, PageRequest,
    };

    struct Fixture {
        service: AuthService,
        identities: Arc<MemoryIdentityStore>,
        emails: Arc<RecordingEmailSender>,
        sessions: Arc<MemorySessionStore>,
        audit: Arc<MemoryAuditStore>,
    }

    fn fixture() -> Fixture {
        let config = AuthConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            max_failed_attempts: 3,
            ..Default::default()
        };
        let identities = Arc::new(MemoryIdentityStore::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let tokens = Arc::new(MemoryOneTimeTokenStore::new());
        let audit_store = Arc::new(MemoryAuditStore::new());
        let audit = AuditLogger::new(audit_store.clone(), StdDuration::from_secs(1));
        let emails = Arc::new(RecordingEmailSender::new());
        let issuer = TokenIssuer::new(&config, sessions.clone(), identities.clone(), audit.clone());
        let service = AuthService::new(
            identities.clone(),
            sessions.clone(),
            tokens,
            issuer,
            audit,
            emails.clone(),
            &config,
        );
        Fixture {
            service,
            identities,
            emails,
            sessions,
            audit: audit_store,
        }
    }

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            password: "Str0ng!Pass".to_string(),
            name: "Shopper".to_string(),
        }
    }

    async fn verified_user(f: &Fixture, email: &str) -> Identity {
        let registered = f
            .service
            .register(register_request(email), &ClientInfo::default())
            .await
            .unwrap();
        let token = f
            .emails
            .last_token(&registered.identity.email, EmailKind::Verification)
            .unwrap();
        f.service.verify_email(&token).await.unwrap();
        registered.identity
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_case_insensitive() {
        let f = fixture();
        let registered = f
            .service
            .register(register_request("Shopper@Example.com"), &ClientInfo::default())
            .await
            .unwrap();
        assert!(registered.email_sent);
        assert_eq!(registered.identity.email, "shopper@example.com");
        assert_eq!(registered.identity.role, Role::Customer);

        let duplicate = f
            .service
            .register(register_request("SHOPPER@example.COM"), &ClientInfo::default())
            .await;
        assert!(matches!(duplicate, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_register_reports_email_failure() {
        let f = fixture();
        f.emails.set_failing(true);
        let registered = f
            .service
            .register(register_request("a@example.com"), &ClientInfo::default())
            .await
            .unwrap();
        assert!(!registered.email_sent);
    }

    #[tokio::test]
    async fn test_register_rejects_weak_password() {
        let f = fixture();
        let mut request = register_request("weak@example.com");
        request.password = "password".to_string();
        let result = f.service.register(request, &ClientInfo::default()).await;
        assert!(matches!(result, Err(AppError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_login_requires_verified_email() {
        let f = fixture();
        f.service
            .register(register_request("new@example.com"), &ClientInfo::default())
            .await
            .unwrap();
        let result = f
            .service
            .login("new@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await;
        assert!(matches!(result, Err(AppError::AccountUnavailable(_))));
    }

    #[tokio::test]
    async fn test_login_then_verify_access() {
        let f = fixture();
        let identity = verified_user(&f, "buyer@example.com").await;
        let logged_in = f
            .service
            .login("BUYER@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await
            .unwrap();

        let claims = f.service.issuer.verify_access(&logged_in.tokens.access_token).unwrap();
        assert_eq!(claims.sub, identity.id.to_string());
        assert_eq!(claims.role, "customer");
        assert!(logged_in.identity.last_login.is_some());
    }

    #[tokio::test]
    async fn test_verify_email_is_idempotent() {
        let f = fixture();
        let registered = f
            .service
            .register(register_request("idem@example.com"), &ClientInfo::default())
            .await
            .unwrap();
        let token = f
            .emails
            .last_token(&registered.identity.email, EmailKind::Verification)
            .unwrap();

        assert_eq!(f.service.verify_email(&token).await.unwrap(), VerifyOutcome::Verified);
        assert_eq!(
            f.service.verify_email(&token).await.unwrap(),
            VerifyOutcome::AlreadyVerified
        );
        assert!(matches!(
            f.service.verify_email("bogus").await,
            Err(AppError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_resend_invalidates_previous_token() {
        let f = fixture();
        f.service
            .register(register_request("resend@example.com"), &ClientInfo::default())
            .await
            .unwrap();
        let first = f
            .emails
            .last_token("resend@example.com", EmailKind::Verification)
            .unwrap();

        f.service.resend_verification("resend@example.com").await.unwrap();
        let second = f
            .emails
            .last_token("resend@example.com", EmailKind::Verification)
            .unwrap();
        assert_ne!(first, second);

        assert!(f.service.verify_email(&first).await.is_err());
        assert_eq!(f.service.verify_email(&second).await.unwrap(), VerifyOutcome::Verified);

        // Unknown addresses answer the same way
        assert!(f.service.resend_verification("nobody@example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let f = fixture();
        verified_user(&f, "lock@example.com").await;

        for _ in 0..3 {
            let result = f
                .service
                .login("lock@example.com", "Wrong!Pass1", &ClientInfo::default())
                .await;
            assert!(matches!(result, Err(AppError::InvalidCredentials)));
        }

        let result = f
            .service
            .login("lock@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await;
        assert!(matches!(result, Err(AppError::AccountUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_failures_all_count_toward_lockout() {
        let f = Arc::new(fixture());
        let identity = verified_user(&f, "burst@example.com").await;

        let attempts = (0..12).map(|_| {
            let f = f.clone();
            tokio::spawn(async move {
                let client = ClientInfo::default();
                let outcome = f.service.login("burst@example.com", "Wrong!Pass1", &client).await;
                outcome
            })
        });
        for outcome in futures::future::join_all(attempts).await {
            assert!(matches!(
                outcome.unwrap(),
                Err(AppError::InvalidCredentials) | Err(AppError::AccountUnavailable(_))
            ));
        }

        let stored = f.identities.find_by_id(identity.id).await.unwrap().unwrap();
        assert!(stored.is_temporarily_locked(Utc::now()));

        let result = f
            .service
            .login("burst@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await;
        assert!(matches!(result, Err(AppError::AccountUnavailable(_))));
    }

    #[tokio::test]
    async fn test_successful_login_clears_failures() {
        let f = fixture();
        let identity = verified_user(&f, "again@example.com").await;

        for _ in 0..2 {
            let _ = f
                .service
                .login("again@example.com", "Wrong!Pass1", &ClientInfo::default())
                .await;
        }
        let logged_in = f
            .service
            .login("again@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await
            .unwrap();
        assert_eq!(logged_in.identity.failed_login_attempts, 0);
        assert!(logged_in.identity.last_login.is_some());

        let stored = f.identities.find_by_id(identity.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn test_unknown_email_pays_for_password_check() {
        let f = fixture();
        assert!(f.service.dummy_hash.starts_with("$argon2id$"));
        assert!(f.service.dummy_hash.contains("m=1024,t=1"));

        let result = f
            .service
            .login("nobody@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await;
        assert!(matches!(result, Err(AppError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_reset_token_single_use_and_revokes_sessions() {
        let f = fixture();
        let identity = verified_user(&f, "reset@example.com").await;
        let login = f
            .service
            .login("reset@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await
            .unwrap();

        f.service
            .forgot_password("reset@example.com", &ClientInfo::default())
            .await
            .unwrap();
        let token = f
            .emails
            .last_token("reset@example.com", EmailKind::PasswordReset)
            .unwrap();

        let revoked = f
            .service
            .reset_password(&token, "N3w!Password", &ClientInfo::default())
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(f
            .sessions
            .list_active(identity.id, Utc::now())
            .await
            .unwrap()
            .is_empty());
        assert!(f
            .service
            .refresh(&login.tokens.refresh_token, &ClientInfo::default())
            .await
            .is_err());

        let reuse = f
            .service
            .reset_password(&token, "An0ther!Password", &ClientInfo::default())
            .await;
        assert!(matches!(reuse, Err(AppError::ValidationFailed(_))));

        assert!(f
            .service
            .login("reset@example.com", "N3w!Password", &ClientInfo::default())
            .await
            .is_ok());

        let audited = f
            .audit
            .list(
                &AuditFilter {
                    action: Some(actions::PASSWORD_RESET.to_string()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(audited.total, 1);
    }

    #[tokio::test]
    async fn test_forgot_password_unknown_email_is_uniform() {
        let f = fixture();
        assert!(f
            .service
            .forgot_password("ghost@example.com", &ClientInfo::default())
            .await
            .is_ok());
        assert!(f.emails.sent().is_empty());
    }

    #[tokio::test]
    async fn test_change_password() {
        let f = fixture();
        verified_user(&f, "change@example.com").await;
        let login = f
            .service
            .login("change@example.com", "Str0ng!Pass", &ClientInfo::default())
            .await
            .unwrap();
        let user = AuthenticatedUser::try_from(&login.tokens.claims).unwrap();

        let wrong = ChangePasswordRequest {
            current_password: "nope".to_string(),
            new_password: "N3w!Password".to_string(),
        };
        assert!(matches!(
            f.service.change_password(&user, &wrong, &ClientInfo::default()).await,
            Err(AppError::InvalidCredentials)
        ));

        let request = ChangePasswordRequest {
            current_password: "Str0ng!Pass".to_string(),
            new_password: "N3w!Password".to_string(),
        };
        assert_eq!(
            f.service
                .change_password(&user, &request, &ClientInfo::default())
                .await
                .unwrap(),
            1
        );
        assert!(f.service.sessions(&user).await.unwrap().is_empty());
    }
}
