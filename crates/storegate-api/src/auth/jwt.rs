//! JWT access tokens and refresh-token rotation
//!
//! Access tokens are HS256 JWTs checked by signature, issuer and expiry
//! alone. Refresh tokens are opaque 256-bit secrets; only their SHA-256 hash
//! is stored, as a [`Session`] row. Rotation revokes the presented session
//! and creates its successor in one atomic store call.

use crate::audit::{actions, AuditLogger, ClientInfo};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use storegate_core::{
    AuditOutcome, AuthConfig, Identity, IdentityStore, NewAuditEntry, NewSession, Role,
    RotateOutcome, Session, SessionStore, StoreError,
};
use thiserror::Error;
use uuid::Uuid;

/// JWT Claims structure containing identity information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Token issuer
    pub iss: String,
    /// Subject - identity ID
    pub sub: String,
    /// JWT ID - unique token identifier
    pub jti: String,
    /// Issued at timestamp (Unix epoch)
    pub iat: u64,
    /// Expiration timestamp (Unix epoch)
    pub exp: u64,
    pub email: String,
    pub role: String,
    /// Session that minted this token
    pub sid: String,
}

/// Token generation, validation and rotation errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Failed to encode JWT: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid token format")]
    InvalidToken,

    #[error("Token has expired")]
    ExpiredToken,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    #[error("Token rotation timed out")]
    Timeout,

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("System time error: {0}")]
    SystemTimeError(#[from] std::time::SystemTimeError),
}

/// JWT Configuration
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Secret key for HMAC signing
    pub secret: String,
    /// Access token lifetime in seconds
    pub access_expiration_secs: u64,
    /// Token issuer identifier
    pub issuer: String,
    /// Leeway applied to `exp`
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self::from_auth_config(&AuthConfig::default())
    }
}

impl JwtConfig {
    pub fn from_auth_config(config: &AuthConfig) -> Self {
        Self {
            secret: config.jwt_secret.clone(),
            access_expiration_secs: config.access_token_ttl_secs,
            issuer: config.issuer.clone(),
            leeway_secs: config.clock_skew_secs,
        }
    }
}

/// Generate a JWT access token for an identity bound to `session_id`
pub fn generate_access_token(
    config: &JwtConfig,
    identity: &Identity,
    session_id: Uuid,
) -> Result<(String, Claims), JwtError> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();

    let claims = Claims {
        iss: config.issuer.clone(),
        sub: identity.id.to_string(),
        jti: Uuid::new_v4().to_string(),
        iat: now,
        exp: now + config.access_expiration_secs,
        email: identity.email.clone(),
        role: identity.role.as_str().to_string(),
        sid: session_id.to_string(),
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )?;

    Ok((token, claims))
}

/// Validate a JWT access token and extract claims
///
/// No I/O: signature, issuer and expiry only.
pub fn validate_access_token(config: &JwtConfig, token: &str) -> Result<Claims, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&config.issuer]);
    validation.leeway = config.leeway_secs;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::ExpiredToken,
        jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::InvalidSignature,
        _ => JwtError::InvalidToken,
    })?;

    Ok(token_data.claims)
}

/// Generate an opaque 256-bit secret, URL-safe base64 encoded
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest used to store refresh and one-time tokens
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Access/refresh pair returned by issue and rotate
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_in: u64,
    pub refresh_expires_in: u64,
    pub claims: Claims,
    pub session: Session,
}

/// Mints, verifies and rotates tokens
#[derive(Clone)]
pub struct TokenIssuer {
    jwt: JwtConfig,
    sessions: Arc<dyn SessionStore>,
    identities: Arc<dyn IdentityStore>,
    audit: AuditLogger,
    refresh_ttl: ChronoDuration,
    rotation_timeout: Duration,
}

impl TokenIssuer {
    pub fn new(
        config: &AuthConfig,
        sessions: Arc<dyn SessionStore>,
        identities: Arc<dyn IdentityStore>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            jwt: JwtConfig::from_auth_config(config),
            sessions,
            identities,
            audit,
            refresh_ttl: ChronoDuration::days(config.refresh_token_ttl_days as i64),
            rotation_timeout: Duration::from_millis(config.rotation_timeout_ms),
        }
    }

    pub fn jwt_config(&self) -> &JwtConfig {
        &self.jwt
    }

    pub fn refresh_ttl_secs(&self) -> u64 {
        self.refresh_ttl.num_seconds().max(0) as u64
    }

    /// Start a new session family for `identity`
    pub async fn issue(&self, identity: &Identity, client: &ClientInfo) -> Result<TokenPair, JwtError> {
        let refresh_token = generate_opaque_token();
        let session = self
            .sessions
            .create(self.new_session(identity.id, &refresh_token, client))
            .await?;
        self.pair_for(identity, session, refresh_token)
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, JwtError> {
        validate_access_token(&self.jwt, token)
    }

    /// Exchange a refresh token for a new pair
    ///
    /// Runs on its own task so a disconnecting client cannot leave a
    /// revoked-but-unreplaced session behind. A timeout is a failure.
    pub async fn rotate(&self, refresh_token: &str, client: &ClientInfo) -> Result<TokenPair, JwtError> {
        let issuer = self.clone();
        let refresh_token = refresh_token.to_string();
        let client = client.clone();
        let handle = tokio::spawn(async move { issuer.rotate_inner(&refresh_token, &client).await });

        match tokio::time::timeout(self.rotation_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(JwtError::Store(StoreError::Database(format!(
                "rotation task failed: {join_error}"
            )))),
            Err(_) => {
                tracing::warn!("Refresh token rotation timed out");
                Err(JwtError::Timeout)
            }
        }
    }

    async fn rotate_inner(&self, refresh_token: &str, client: &ClientInfo) -> Result<TokenPair, JwtError> {
        let now = Utc::now();
        let Some(session) = self.sessions.lookup(&hash_token(refresh_token)).await? else {
            return Err(JwtError::InvalidToken);
        };

        if session.is_revoked() {
            self.revoke_family(&session, client).await?;
            return Err(JwtError::ReuseDetected);
        }
        if session.is_expired(now) {
            return Err(JwtError::ExpiredToken);
        }

        let identity = match self.identities.find_by_id(session.identity_id).await? {
            Some(identity) if identity.can_hold_sessions(now) => identity,
            _ => {
                self.sessions.revoke(session.id).await?;
                return Err(JwtError::InvalidToken);
            }
        };

        let next_secret = generate_opaque_token();
        let successor = self.new_session(identity.id, &next_secret, client);
        match self.sessions.rotate(session.id, successor).await? {
            RotateOutcome::Rotated(next) => {
                tracing::debug!(identity_id = %identity.id, family_id = %next.family_id, "Refresh token rotated");
                self.pair_for(&identity, next, next_secret)
            }
            RotateOutcome::AlreadyRevoked => {
                // Lost the race against a concurrent rotation of the same token
                self.revoke_family(&session, client).await?;
                Err(JwtError::ReuseDetected)
            }
            RotateOutcome::NotFound => Err(JwtError::InvalidToken),
        }
    }

    async fn revoke_family(&self, session: &Session, client: &ClientInfo) -> Result<(), JwtError> {
        let revoked = self
            .sessions
            .revoke_chain(session.identity_id, session.id)
            .await?;
        tracing::warn!(
            identity_id = %session.identity_id,
            family_id = %session.family_id,
            revoked,
            "Refresh token reuse detected, session family revoked"
        );
        self.audit.record_detached(
            NewAuditEntry::new(actions::REFRESH_REUSE, AuditOutcome::Denied)
                .actor(session.identity_id)
                .target(session.family_id.to_string())
                .source(client.ip_address.clone())
                .detail(format!("sessions_revoked={revoked}")),
        );
        Ok(())
    }

    fn new_session(&self, identity_id: Uuid, secret: &str, client: &ClientInfo) -> NewSession {
        NewSession {
            identity_id,
            token_hash: hash_token(secret),
            expires_at: Utc::now() + self.refresh_ttl,
            user_agent: client.user_agent.clone(),
            ip_address: client.ip_address.clone(),
        }
    }

    fn pair_for(&self, identity: &Identity, session: Session, refresh_token: String) -> Result<TokenPair, JwtError> {
        let (access_token, claims) = generate_access_token(&self.jwt, identity, session.id)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_in: self.jwt.access_expiration_secs,
            refresh_expires_in: self.refresh_ttl_secs(),
            claims,
            session,
        })
    }
}

/// Parse the role claim
pub fn role_from_claims(claims: &Claims) -> Result<Role, JwtError> {
    claims.role.parse().map_err(|_| JwtError::InvalidToken)
}
