//! Storegate Client - typed access to the Storegate HTTP API
//!
//! The client authenticates with bearer tokens and carries the CSRF
//! session cookie itself, so it needs no cookie store. Two failures are
//! recovered automatically, each at most once per call:
//! - `CSRF_MISSING` / `CSRF_INVALID`: fetch a fresh token and resend
//! - `TOKEN_EXPIRED`: exchange the refresh token and resend
//!
//! Every other error is returned to the caller as is.
//!
//! Author: hephaex@gmail.com

use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const CSRF_SESSION_COOKIE: &str = "csrfSid";
const DEFAULT_CSRF_HEADER: &str = "x-csrf-token";

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{status} {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Not logged in")]
    NotAuthenticated,
}

impl ClientError {
    /// Stable error code reported by the server, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    fn is_csrf(&self) -> bool {
        matches!(self.code(), Some("CSRF_MISSING" | "CSRF_INVALID"))
    }

    fn is_expired(&self) -> bool {
        self.code() == Some("TOKEN_EXPIRED")
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Profile returned by `/auth/me` and embedded in login responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub email_verified: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Token pair from login or refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub refresh_expires_in: u64,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub current: bool,
}

#[derive(Debug, Default)]
struct Credentials {
    csrf_sid: Option<String>,
    csrf_token: Option<String>,
    tokens: Option<AuthTokens>,
}

/// Storegate API client
pub struct StoregateClient {
    http: Client,
    base_url: String,
    csrf_header: String,
    credentials: Mutex<Credentials>,
}

impl StoregateClient {
    /// Create a client for `base_url`, e.g. `http://localhost:8080`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("storegate-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            csrf_header: DEFAULT_CSRF_HEADER.to_string(),
            credentials: Mutex::new(Credentials::default()),
        })
    }

    /// Use a different CSRF header name than the server default
    pub fn with_csrf_header(mut self, name: impl Into<String>) -> Self {
        self.csrf_header = name.into();
        self
    }

    /// Current token pair, if logged in
    pub fn tokens(&self) -> Option<AuthTokens> {
        self.with_credentials(|c| c.tokens.clone())
    }

    /// Replace the CSRF token sent on mutating requests
    pub fn set_csrf_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.with_credentials(|c| c.csrf_token = Some(token));
    }

    fn with_credentials<T>(&self, f: impl FnOnce(&mut Credentials) -> T) -> T {
        let mut guard = match self.credentials.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    // ------------------------------------------------------------------
    // Account flows
    // ------------------------------------------------------------------

    /// Fetch (and remember) a CSRF token
    pub async fn fetch_csrf_token(&self) -> Result<String> {
        let response = self
            .http
            .get(self.url("/api/v1/csrf-token"))
            .headers(self.cookie_headers())
            .send()
            .await?;

        let sid = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| cookie_value(v, CSRF_SESSION_COOKIE));
        let body = read_body(response).await?;
        let token = body["csrf_token"]
            .as_str()
            .ok_or_else(|| ClientError::Decode("missing csrf_token".to_string()))?
            .to_string();

        self.with_credentials(|c| {
            if sid.is_some() {
                c.csrf_sid = sid;
            }
            c.csrf_token = Some(token.clone());
        });
        Ok(token)
    }

    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<UserProfile> {
        let body = self
            .execute(
                Method::POST,
                "/api/v1/auth/register",
                Some(json!({ "email": email, "password": password, "name": name })),
                false,
            )
            .await?;
        decode(body["user"].clone())
    }

    /// Log in and keep the token pair for later calls
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthTokens> {
        let body = self
            .execute(
                Method::POST,
                "/api/v1/auth/login",
                Some(json!({ "email": email, "password": password })),
                false,
            )
            .await?;
        let tokens: AuthTokens = decode(body)?;
        self.with_credentials(|c| c.tokens = Some(tokens.clone()));
        Ok(tokens)
    }

    /// Exchange the refresh token for a new pair
    ///
    /// A rejected refresh forgets the stored pair.
    pub async fn refresh(&self) -> Result<AuthTokens> {
        let refresh_token = self
            .with_credentials(|c| c.tokens.as_ref().map(|t| t.refresh_token.clone()))
            .ok_or(ClientError::NotAuthenticated)?;

        let body = json!({ "refresh_token": refresh_token });
        let result = self
            .send_with_csrf(Method::POST, "/api/v1/auth/refresh", Some(&body), false)
            .await;

        match result {
            Ok(body) => {
                let tokens: AuthTokens = decode(body)?;
                self.with_credentials(|c| c.tokens = Some(tokens.clone()));
                tracing::debug!("Refreshed access token");
                Ok(tokens)
            }
            Err(e) => {
                if matches!(e, ClientError::Api { status: StatusCode::UNAUTHORIZED, .. }) {
                    self.with_credentials(|c| c.tokens = None);
                }
                Err(e)
            }
        }
    }

    pub async fn logout(&self) -> Result<()> {
        self.execute(Method::POST, "/api/v1/auth/logout", None, true)
            .await?;
        self.with_credentials(|c| c.tokens = None);
        Ok(())
    }

    /// Revoke every session of the current user
    pub async fn logout_all(&self) -> Result<u64> {
        let body = self
            .execute(Method::POST, "/api/v1/auth/logout-all", None, true)
            .await?;
        self.with_credentials(|c| c.tokens = None);
        Ok(body["sessions_revoked"].as_u64().unwrap_or_default())
    }

    pub async fn me(&self) -> Result<UserProfile> {
        let body = self.execute(Method::GET, "/api/v1/auth/me", None, true).await?;
        decode(body["user"].clone())
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let body = self
            .execute(Method::GET, "/api/v1/auth/sessions", None, true)
            .await?;
        decode(body["sessions"].clone())
    }

    pub async fn change_password(&self, current: &str, new_password: &str) -> Result<()> {
        self.execute(
            Method::POST,
            "/api/v1/auth/change-password",
            Some(json!({ "current_password": current, "new_password": new_password })),
            true,
        )
        .await?;
        self.with_credentials(|c| c.tokens = None);
        Ok(())
    }

    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        self.execute(
            Method::POST,
            "/api/v1/auth/forgot-password",
            Some(json!({ "email": email })),
            false,
        )
        .await
        .map(|_| ())
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<()> {
        self.execute(
            Method::POST,
            "/api/v1/auth/reset-password",
            Some(json!({ "token": token, "new_password": new_password })),
            false,
        )
        .await
        .map(|_| ())
    }

    pub async fn verify_email(&self, token: &str) -> Result<()> {
        self.execute(
            Method::GET,
            &format!("/api/v1/auth/verify-email/{token}"),
            None,
            false,
        )
        .await
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Generic access for the remaining endpoints
    // ------------------------------------------------------------------

    /// Authenticated GET returning the success envelope
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        decode(self.execute(Method::GET, path, None, true).await?)
    }

    /// Authenticated request with a JSON body returning the success envelope
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        decode(self.execute(method, path, body, true).await?)
    }

    /// Send with the CSRF and expiry recoveries applied
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
    ) -> Result<Value> {
        match self
            .send_with_csrf(method.clone(), path, body.as_ref(), authenticated)
            .await
        {
            Err(e) if authenticated && e.is_expired() => {
                tracing::debug!(path, "Access token expired, refreshing");
                self.refresh().await?;
                self.send_with_csrf(method, path, body.as_ref(), authenticated)
                    .await
            }
            result => result,
        }
    }

    /// Send once, retrying a single time with a fresh CSRF token
    async fn send_with_csrf(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        authenticated: bool,
    ) -> Result<Value> {
        let mutating = !matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);
        if mutating && self.with_credentials(|c| c.csrf_token.is_none()) {
            self.fetch_csrf_token().await?;
        }

        match self.send_once(method.clone(), path, body, authenticated).await {
            Err(e) if mutating && e.is_csrf() => {
                tracing::debug!(path, "CSRF token rejected, fetching a new one");
                self.fetch_csrf_token().await?;
                self.send_once(method, path, body, authenticated).await
            }
            result => result,
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        authenticated: bool,
    ) -> Result<Value> {
        let (csrf_token, access_token) = self.with_credentials(|c| {
            (
                c.csrf_token.clone(),
                c.tokens.as_ref().map(|t| t.access_token.clone()),
            )
        });

        let mut request = self
            .http
            .request(method, self.url(path))
            .headers(self.cookie_headers());
        if let Some(token) = csrf_token {
            request = request.header(self.csrf_header.as_str(), token);
        }
        if authenticated {
            let token = access_token.ok_or(ClientError::NotAuthenticated)?;
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        read_body(request.send().await?).await
    }

    fn cookie_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        if let Some(sid) = self.with_credentials(|c| c.csrf_sid.clone()) {
            if let Ok(value) = header::HeaderValue::from_str(&format!("{CSRF_SESSION_COOKIE}={sid}")) {
                headers.insert(header::COOKIE, value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Value of cookie `name` in a `Set-Cookie` header
fn cookie_value(set_cookie: &str, name: &str) -> Option<String> {
    let (key, value) = set_cookie.split(';').next()?.split_once('=')?;
    (key.trim() == name && !value.is_empty()).then(|| value.trim().to_string())
}

async fn read_body(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let retry_after_secs = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let text = response.text().await?;
    let body: Value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))?
    };

    if status.is_success() {
        return Ok(body);
    }
    Err(ClientError::Api {
        status,
        code: body["code"].as_str().unwrap_or("UNKNOWN").to_string(),
        message: body["message"]
            .as_str()
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"))
            .to_string(),
        retry_after_secs: body["retry_after_secs"].as_u64().or(retry_after_secs),
    })
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value_parsing() {
        let header = "csrfSid=abc123; HttpOnly; SameSite=Strict; Max-Age=3600";
        assert_eq!(cookie_value(header, "csrfSid"), Some("abc123".to_string()));
        assert_eq!(cookie_value(header, "accessToken"), None);
        assert_eq!(cookie_value("csrfSid=; Max-Age=0", "csrfSid"), None);
    }

    #[test]
    fn test_error_classification() {
        let api = |code: &str| ClientError::Api {
            status: StatusCode::FORBIDDEN,
            code: code.to_string(),
            message: String::new(),
            retry_after_secs: None,
        };
        assert!(api("CSRF_MISSING").is_csrf());
        assert!(api("CSRF_INVALID").is_csrf());
        assert!(!api("INSUFFICIENT_ROLE").is_csrf());
        assert!(api("TOKEN_EXPIRED").is_expired());
        assert_eq!(ClientError::NotAuthenticated.code(), None);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = StoregateClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }
}
