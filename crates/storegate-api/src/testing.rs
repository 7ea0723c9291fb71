//! Test utilities for unit and integration tests
//!
//! Enabled under `cfg(test)` and the `test-utils` feature.

use crate::create_router;
use crate::email::RecordingEmailSender;
use crate::state::{AppState, Stores};
use axum::Router;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use storegate_core::{AppConfig, Identity, Role, WindowBudget};

/// Default configuration with cheap hashing and generous rate limits.
/// Loopback is a trusted proxy so in-process tests can set client addresses.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.trusted_proxies = vec![IpAddr::from([127, 0, 0, 1])];
    config.auth.argon2_memory_kib = 1024;
    config.auth.argon2_iterations = 1;
    config.rate_limit.global = WindowBudget::new(10_000, 60);
    config.rate_limit.auth = WindowBudget::new(1_000, 60);
    config.rate_limit.recovery = WindowBudget::new(1_000, 60);
    config.database.store_timeout_ms = 2_000;
    config
}

/// In-memory service with a recording email sender
pub struct TestHarness {
    pub state: Arc<AppState>,
    pub router: Router,
    pub emails: Arc<RecordingEmailSender>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let emails = Arc::new(RecordingEmailSender::new());
        let state = Arc::new(AppState::new(
            config,
            Stores::memory(),
            emails.clone(),
            None,
        ));
        let router = create_router(state.clone());
        Self {
            state,
            router,
            emails,
        }
    }

    /// Insert a verified identity with the given role
    pub async fn seed_identity(&self, email: &str, password: &str, role: Role) -> Identity {
        let hash = self
            .state
            .auth
            .hash_password(password)
            .await
            .expect("hash test password");
        let mut identity = Identity::new(email, "Test User", hash, role);
        identity.email_verified = true;
        self.state
            .stores
            .identities
            .insert(identity)
            .await
            .expect("insert test identity")
    }

    /// Serve the router on an ephemeral local port
    pub async fn spawn_server(&self) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let app = self.router.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                tracing::error!(error = %e, "Test server stopped");
            }
        });

        (format!("http://{addr}"), handle)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
