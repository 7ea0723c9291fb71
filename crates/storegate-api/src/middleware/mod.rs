//! Request pipeline middleware
//!
//! Author: hephaex@gmail.com

pub mod client_address;
pub mod metrics;
pub mod rate_limit;
pub mod timeout;

pub use client_address::client_address_middleware;
pub use metrics::metrics_middleware;
pub use rate_limit::{rate_limit_middleware, EndpointClass, RateLimiter};
pub use timeout::timeout_middleware;
