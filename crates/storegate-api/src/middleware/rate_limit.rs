//! Rate limiting middleware for API endpoints
//!
//! One keyed GCRA limiter per endpoint class, keyed by client address:
//! - Global: every `/api/` request
//! - Auth: login and register
//! - Recovery: forgot-password, reset-password, resend-verification
//!
//! A budget of N requests per window is a burst of N that refills one
//! request every window / N. A request must fit the global budget and, when
//! it has one, the budget of its class. Rejections are 429 with `Retry-After`.
//!
//! Author: hephaex@gmail.com

use crate::audit::ClientAddress;
use crate::error::AppError;
use crate::middleware::metrics::record_auth_event;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota,
};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use storegate_core::{RateLimitConfig, WindowBudget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Global,
    Auth,
    Recovery,
}

impl EndpointClass {
    /// The stricter class of a path, if any
    pub fn for_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/api/v1/auth/login" | "/api/v1/auth/register" => Some(EndpointClass::Auth),
            "/api/v1/auth/forgot-password"
            | "/api/v1/auth/reset-password"
            | "/api/v1/auth/resend-verification" => Some(EndpointClass::Recovery),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Global => "global",
            EndpointClass::Auth => "auth",
            EndpointClass::Recovery => "recovery",
        }
    }
}

/// Quota granting `max_requests` at once, refilled evenly over the window
fn quota_for(budget: WindowBudget) -> Quota {
    let burst = NonZeroU32::new(budget.max_requests).unwrap_or(NonZeroU32::MIN);
    let window = Duration::from_secs(budget.window_secs.max(1));
    Quota::with_period(window / burst.get())
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

/// Per-client limiter over the three endpoint classes
pub struct RateLimiter {
    enabled: bool,
    global: DefaultKeyedRateLimiter<IpAddr>,
    auth: DefaultKeyedRateLimiter<IpAddr>,
    recovery: DefaultKeyedRateLimiter<IpAddr>,
    clock: DefaultClock,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            global: governor::RateLimiter::keyed(quota_for(config.global)),
            auth: governor::RateLimiter::keyed(quota_for(config.auth)),
            recovery: governor::RateLimiter::keyed(quota_for(config.recovery)),
            clock: DefaultClock::default(),
        }
    }

    fn limiter(&self, class: EndpointClass) -> &DefaultKeyedRateLimiter<IpAddr> {
        match class {
            EndpointClass::Global => &self.global,
            EndpointClass::Auth => &self.auth,
            EndpointClass::Recovery => &self.recovery,
        }
    }

    /// Check the global budget and then the path's class budget
    ///
    /// Returns the seconds to wait when either is exhausted.
    pub fn check_request(&self, client: IpAddr, path: &str) -> Result<(), u64> {
        if !self.enabled {
            return Ok(());
        }
        self.check(client, EndpointClass::Global)?;
        match EndpointClass::for_path(path) {
            Some(class) => self.check(client, class),
            None => Ok(()),
        }
    }

    /// Count one request against `class`
    pub fn check(&self, client: IpAddr, class: EndpointClass) -> Result<(), u64> {
        self.limiter(class).check_key(&client).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            secs.max(1)
        })
    }

    /// Forget clients whose budgets have fully refilled
    pub fn cleanup(&self) -> usize {
        let before = self.tracked_clients();
        for class in [EndpointClass::Global, EndpointClass::Auth, EndpointClass::Recovery] {
            let limiter = self.limiter(class);
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
        before.saturating_sub(self.tracked_clients())
    }

    pub fn tracked_clients(&self) -> usize {
        self.global.len() + self.auth.len() + self.recovery.len()
    }
}

/// Apply the limiter to `/api/` routes
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let path = request.uri().path();
    if !path.starts_with("/api/") {
        return Ok(next.run(request).await);
    }

    let client = request
        .extensions()
        .get::<ClientAddress>()
        .map(|ClientAddress(ip)| *ip)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if let Err(retry_after_secs) = state.rate_limiter.check_request(client, path) {
        let class = EndpointClass::for_path(path).unwrap_or(EndpointClass::Global);
        tracing::warn!(
            client = %client,
            path = %path,
            class = class.as_str(),
            retry_after_secs,
            "Rate limit exceeded"
        );
        record_auth_event("rate_limited");
        return Err(AppError::RateLimited { retry_after_secs });
    }

    Ok(next.run(request).await)
}
