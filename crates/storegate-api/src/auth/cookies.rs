//! Session cookies
//!
//! All cookies are HttpOnly and `SameSite=Strict`. The refresh cookie is
//! scoped to `/api/v1` so it never travels with static asset requests.

use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::Response;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use storegate_core::AppConfig;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";
pub const CSRF_SESSION_COOKIE: &str = "csrfSid";

const REFRESH_PATH: &str = "/api/v1";

#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub secure: bool,
    pub domain: Option<String>,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub csrf_ttl_secs: u64,
}

impl CookieSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            secure: config.secure_cookies(),
            domain: config.cookies.domain.clone(),
            access_ttl_secs: config.auth.access_token_ttl_secs,
            refresh_ttl_secs: config.auth.refresh_token_ttl_days * 86_400,
            csrf_ttl_secs: config.csrf.token_ttl_secs,
        }
    }

    pub fn access(&self, token: &str) -> Cookie<'static> {
        self.build(ACCESS_COOKIE, token.to_string(), "/", self.access_ttl_secs)
    }

    pub fn refresh(&self, token: &str) -> Cookie<'static> {
        self.build(REFRESH_COOKIE, token.to_string(), REFRESH_PATH, self.refresh_ttl_secs)
    }

    pub fn csrf_session(&self, sid: &str) -> Cookie<'static> {
        self.build(CSRF_SESSION_COOKIE, sid.to_string(), "/", self.csrf_ttl_secs)
    }

    /// Expired copies of the access and refresh cookies
    pub fn cleared(&self) -> [Cookie<'static>; 2] {
        [
            self.build(ACCESS_COOKIE, String::new(), "/", 0),
            self.build(REFRESH_COOKIE, String::new(), REFRESH_PATH, 0),
        ]
    }

    fn build(&self, name: &'static str, value: String, path: &'static str, max_age_secs: u64) -> Cookie<'static> {
        let mut builder = Cookie::build((name, value))
            .path(path)
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .max_age(time::Duration::seconds(max_age_secs.min(i64::MAX as u64) as i64));
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }
}

/// Append `Set-Cookie` headers to a response
pub fn set_cookies<I>(response: &mut Response, cookies: I)
where
    I: IntoIterator<Item = Cookie<'static>>,
{
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::error!(cookie = cookie.name(), error = %e, "Unrepresentable cookie"),
        }
    }
}

/// Read a cookie value from request headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}
