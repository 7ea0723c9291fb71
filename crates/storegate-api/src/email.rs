//! Outbound email seam
//!
//! Delivery itself lives outside this service. A sender only reports
//! whether the request was accepted.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use storegate_core::{EmailConfig, EmailProvider};
use thiserror::Error;

use crate::error::AppError;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("Email dispatch timed out")]
    Timeout,

    #[error("Email dispatch failed: {0}")]
    Delivery(String),

    #[error("Invalid email configuration: {0}")]
    Configuration(String),
}

impl From<EmailError> for AppError {
    fn from(err: EmailError) -> Self {
        AppError::UpstreamUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    Verification,
    PasswordReset,
}

/// One outbound email request
#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub name: String,
    pub kind: EmailKind,
    pub link: String,
    #[serde(skip)]
    pub token: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_verification(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError>;

    async fn send_password_reset(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError>;
}

/// Builds links into the storefront
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    base_url: String,
}

impl LinkBuilder {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn verification(&self, token: &str) -> String {
        format!("{}/verify-email/{}", self.base_url, token)
    }

    pub fn password_reset(&self, token: &str) -> String {
        format!("{}/reset-password?token={}", self.base_url, token)
    }

    fn message(&self, kind: EmailKind, to: &str, name: &str, token: &str) -> EmailMessage {
        let link = match kind {
            EmailKind::Verification => self.verification(token),
            EmailKind::PasswordReset => self.password_reset(token),
        };
        EmailMessage {
            to: to.to_string(),
            name: name.to_string(),
            kind,
            link,
            token: token.to_string(),
        }
    }
}

/// Development sender: logs the link
pub struct LogEmailSender {
    links: LinkBuilder,
}

impl LogEmailSender {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            links: LinkBuilder::new(&config.app_base_url),
        }
    }

    fn log(&self, message: EmailMessage) {
        tracing::info!(
            to = %message.to,
            kind = ?message.kind,
            link = %message.link,
            "Email dispatched to log"
        );
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_verification(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError> {
        self.log(self.links.message(EmailKind::Verification, to, name, token));
        Ok(())
    }

    async fn send_password_reset(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError> {
        self.log(self.links.message(EmailKind::PasswordReset, to, name, token));
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    from: &'a str,
    #[serde(flatten)]
    message: &'a EmailMessage,
}

/// Posts each email as JSON to a delivery webhook
pub struct WebhookEmailSender {
    client: reqwest::Client,
    url: String,
    from: String,
    links: LinkBuilder,
}

impl WebhookEmailSender {
    pub fn new(config: &EmailConfig) -> Result<Self, EmailError> {
        let url = config
            .webhook_url
            .clone()
            .ok_or_else(|| EmailError::Configuration("webhook_url is not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EmailError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            url,
            from: config.from_address.clone(),
            links: LinkBuilder::new(&config.app_base_url),
        })
    }

    async fn post(&self, message: EmailMessage) -> Result<(), EmailError> {
        let payload = WebhookPayload {
            from: &self.from,
            message: &message,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmailError::Timeout
                } else {
                    EmailError::Delivery(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(EmailError::Delivery(format!(
                "webhook responded with {}",
                response.status()
            )));
        }
        tracing::debug!(to = %message.to, kind = ?message.kind, "Email accepted by webhook");
        Ok(())
    }
}

#[async_trait]
impl EmailSender for WebhookEmailSender {
    async fn send_verification(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError> {
        self.post(self.links.message(EmailKind::Verification, to, name, token))
            .await
    }

    async fn send_password_reset(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError> {
        self.post(self.links.message(EmailKind::PasswordReset, to, name, token))
            .await
    }
}

/// Build the sender selected by `email.provider`
pub fn sender_from_config(
    config: &EmailConfig,
) -> Result<std::sync::Arc<dyn EmailSender>, EmailError> {
    Ok(match config.provider {
        EmailProvider::Log => std::sync::Arc::new(LogEmailSender::new(config)),
        EmailProvider::Webhook => std::sync::Arc::new(WebhookEmailSender::new(config)?),
    })
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::RecordingEmailSender;

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Keeps every message in memory; can be told to fail
    #[derive(Default)]
    pub struct RecordingEmailSender {
        sent: Mutex<Vec<EmailMessage>>,
        fail: AtomicBool,
    }

    impl RecordingEmailSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }

        /// Most recent token sent to `to` for `kind`
        pub fn last_token(&self, to: &str, kind: EmailKind) -> Option<String> {
            self.sent()
                .into_iter()
                .rev()
                .find(|m| m.to == to && m.kind == kind)
                .map(|m| m.token)
        }

        fn record(&self, kind: EmailKind, to: &str, name: &str, token: &str) -> Result<(), EmailError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmailError::Delivery("recording sender set to fail".to_string()));
            }
            let message = LinkBuilder::new("http://localhost:3000").message(kind, to, name, token);
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(message);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EmailSender for RecordingEmailSender {
        async fn send_verification(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError> {
            self.record(EmailKind::Verification, to, name, token)
        }

        async fn send_password_reset(&self, to: &str, name: &str, token: &str) -> Result<(), EmailError> {
            self.record(EmailKind::PasswordReset, to, name, token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links() {
        let links = LinkBuilder::new("https://shop.example.com/");
        assert_eq!(
            links.verification("tok"),
            "https://shop.example.com/verify-email/tok"
        );
        assert_eq!(
            links.password_reset("tok"),
            "https://shop.example.com/reset-password?token=tok"
        );
    }

    #[test]
    fn test_webhook_requires_url() {
        let config = EmailConfig {
            provider: EmailProvider::Webhook,
            webhook_url: None,
            ..Default::default()
        };
        assert!(matches!(
            WebhookEmailSender::new(&config),
            Err(EmailError::Configuration(_))
        ));
    }

    #[test]
    fn test_payload_omits_raw_token() {
        let message = LinkBuilder::new("http://x").message(EmailKind::Verification, "a@b.c", "A", "secret");
        let json = serde_json::to_value(WebhookPayload {
            from: "no-reply@example.com",
            message: &message,
        })
        .unwrap();
        assert_eq!(json["kind"], "verification");
        assert_eq!(json["link"], "http://x/verify-email/secret");
        assert!(json.get("token").is_none());
    }

    #[tokio::test]
    async fn test_recording_sender() {
        let sender = RecordingEmailSender::new();
        sender.send_verification("a@example.com", "A", "t1").await.unwrap();
        sender.send_password_reset("a@example.com", "A", "t2").await.unwrap();
        assert_eq!(
            sender.last_token("a@example.com", EmailKind::PasswordReset).as_deref(),
            Some("t2")
        );

        sender.set_failing(true);
        assert!(sender.send_verification("a@example.com", "A", "t3").await.is_err());
        assert_eq!(sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_error() {
        let config = EmailConfig {
            provider: EmailProvider::Webhook,
            webhook_url: Some("http://127.0.0.1:1/hook".to_string()),
            timeout_ms: 500,
            ..Default::default()
        };
        let sender = WebhookEmailSender::new(&config).unwrap();
        assert!(sender.send_verification("a@example.com", "A", "t").await.is_err());
    }
}
