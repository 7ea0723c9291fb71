//! Shared helpers for the API integration tests
//!
//! `TestClient` drives the router in-process and behaves like a browser:
//! it keeps cookies between requests and echoes the CSRF token header.
//! Requests arrive from a loopback peer, which `test_config` trusts as a
//! proxy, so `from_address` sets the client address through
//! `X-Forwarded-For`.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use axum_extra::extract::cookie::Cookie;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use tower::ServiceExt;

pub const PASSWORD: &str = "Str0ng!Passw0rd";

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn code(&self) -> &str {
        self.body["code"].as_str().unwrap_or_default()
    }

    /// `Set-Cookie` headers for `name`
    pub fn set_cookies(&self, name: &str) -> Vec<Cookie<'static>> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|s| Cookie::parse(s.to_string()).ok())
            .filter(|c| c.name() == name)
            .collect()
    }
}

pub struct TestClient {
    router: Router,
    cookies: HashMap<String, String>,
    csrf_token: Option<String>,
    forwarded_for: String,
    peer: SocketAddr,
}

impl TestClient {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            cookies: HashMap::new(),
            csrf_token: None,
            forwarded_for: "203.0.113.10".to_string(),
            peer: SocketAddr::from(([127, 0, 0, 1], 40_000)),
        }
    }

    /// Present requests as coming from `ip`
    pub fn from_address(mut self, ip: &str) -> Self {
        self.forwarded_for = ip.to_string();
        self
    }

    /// Connect from `peer` instead of the loopback proxy
    pub fn via_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = peer;
        self
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.cookies.insert(name.to_string(), value.to_string());
    }

    pub fn remove_cookie(&mut self, name: &str) {
        self.cookies.remove(name);
    }

    pub async fn send(
        &mut self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(self.peer))
            .header("x-forwarded-for", &self.forwarded_for)
            .header(header::USER_AGENT, "storegate-tests");

        if !self.cookies.is_empty() {
            let cookie_header = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(header::COOKIE, cookie_header);
        }
        if let Some(token) = &self.csrf_token {
            builder = builder.header("x-csrf-token", token);
        }
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        self.store_cookies(&headers);
        TestResponse {
            status,
            headers,
            body,
        }
    }

    fn store_cookies(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(header::SET_COOKIE) {
            let Some(cookie) = value.to_str().ok().and_then(|s| Cookie::parse(s).ok()) else {
                continue;
            };
            let expired = cookie.max_age().map(|age| age.is_zero()).unwrap_or(false);
            if expired || cookie.value().is_empty() {
                self.cookies.remove(cookie.name());
            } else {
                self.cookies
                    .insert(cookie.name().to_string(), cookie.value().to_string());
            }
        }
    }

    pub async fn get(&mut self, uri: &str) -> TestResponse {
        self.send(Method::GET, uri, None, None).await
    }

    pub async fn post(&mut self, uri: &str, body: Value) -> TestResponse {
        self.send(Method::POST, uri, Some(body), None).await
    }

    /// Fetch a CSRF token and send it on every later request
    pub async fn fetch_csrf(&mut self) -> String {
        let response = self.get("/api/v1/csrf-token").await;
        assert_eq!(response.status, StatusCode::OK);
        let token = response.body["csrf_token"].as_str().unwrap().to_string();
        self.csrf_token = Some(token.clone());
        token
    }

    pub async fn login(&mut self, email: &str, password: &str) -> TestResponse {
        if self.csrf_token.is_none() {
            self.fetch_csrf().await;
        }
        self.post(
            "/api/v1/auth/login",
            serde_json::json!({ "email": email, "password": password }),
        )
        .await
    }
}
