//! Alert delivery by email.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EmailConfig;

/// Errors that can occur while sending alerts.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Notifier disabled: {0}")]
    Disabled(String),

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP delivery failed: {0}")]
    Transport(String),
}

/// An alert email.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Image attached when the file can still be read
    pub attachment: Option<PathBuf>,
}

/// Delivers alert messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Whether alerts can be delivered at all.
    fn is_enabled(&self) -> bool;

    async fn send_alert(&self, message: &AlertMessage) -> Result<(), NotifyError>;
}

/// Parse and sanity check a recipient address.
pub fn validate_email(email: &str) -> Result<Address, NotifyError> {
    let trimmed = email.trim();
    let address: Address = trimmed
        .parse()
        .map_err(|_| NotifyError::InvalidAddress(trimmed.to_string()))?;
    if !address.domain().contains('.') {
        return Err(NotifyError::InvalidAddress(trimmed.to_string()));
    }
    Ok(address)
}

/// SMTP delivery over STARTTLS.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &EmailConfig) -> Result<Self, NotifyError> {
        let sender = validate_email(&config.sender_email)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.sender_email.clone(),
                config.sender_password.clone(),
            ))
            .build();

        info!(
            server = %config.smtp_server,
            port = config.smtp_port,
            sender = %config.sender_email,
            "SMTP notifier configured"
        );

        Ok(Self {
            transport,
            sender: Mailbox::new(Some("Laser Monitor".to_string()), sender),
        })
    }

    async fn build_message(&self, message: &AlertMessage) -> Result<Message, NotifyError> {
        let to = validate_email(&message.to)?;
        let builder = Message::builder()
            .from(self.sender.clone())
            .to(Mailbox::new(None, to))
            .subject(message.subject.clone());

        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone()));
        if let Some(path) = &message.attachment {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "capture.jpg".to_string());
                    let content_type = ContentType::parse("image/jpeg")
                        .map_err(|e| NotifyError::Build(e.to_string()))?;
                    parts = parts.singlepart(Attachment::new(file_name).body(bytes, content_type));
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Attachment unreadable, sending without it");
                }
            }
        }

        builder
            .multipart(parts)
            .map_err(|e| NotifyError::Build(e.to_string()))
    }
}

#[async_trait]
impl AlertNotifier for SmtpNotifier {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send_alert(&self, message: &AlertMessage) -> Result<(), NotifyError> {
        let email = self.build_message(message).await?;
        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        metrics::counter!("monitor.alerts.sent").increment(1);
        info!(to = %message.to, "Alert email sent");
        Ok(())
    }
}

/// Notifier used when SMTP credentials are not configured.
pub struct DisabledNotifier {
    reason: String,
}

impl DisabledNotifier {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AlertNotifier for DisabledNotifier {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn send_alert(&self, message: &AlertMessage) -> Result<(), NotifyError> {
        warn!(to = %message.to, reason = %self.reason, "Alert dropped, notifier disabled");
        Err(NotifyError::Disabled(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(attachment: Option<PathBuf>) -> AlertMessage {
        AlertMessage {
            to: "ops@example.com".to_string(),
            subject: "[Laser Monitor] Alert".to_string(),
            body: "Abnormal state detected".to_string(),
            attachment,
        }
    }

    fn smtp_config() -> EmailConfig {
        EmailConfig {
            sender_email: "monitor@example.com".to_string(),
            sender_password: "secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ops@example.com").is_ok());
        assert!(validate_email("  ops@example.com ").is_ok());
        assert!(validate_email("ops@localhost").is_err());
        assert!(validate_email("not-an-address").is_err());
        assert!(validate_email("").is_err());
    }

    #[tokio::test]
    async fn test_disabled_notifier_rejects() {
        let notifier = DisabledNotifier::new("no SMTP credentials");
        assert!(!notifier.is_enabled());
        let result = notifier.send_alert(&message(None)).await;
        assert!(matches!(result, Err(NotifyError::Disabled(_))));
    }

    #[tokio::test]
    async fn test_message_with_attachment() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manual_capture_1.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xD9]).unwrap();

        let notifier = SmtpNotifier::new(&smtp_config()).unwrap();
        let email = notifier.build_message(&message(Some(path))).await.unwrap();
        let formatted = String::from_utf8_lossy(&email.formatted()).into_owned();
        assert!(formatted.contains("manual_capture_1.jpg"));
        assert!(formatted.contains("image/jpeg"));
    }

    #[tokio::test]
    async fn test_missing_attachment_still_builds() {
        let notifier = SmtpNotifier::new(&smtp_config()).unwrap();
        let email = notifier
            .build_message(&message(Some(PathBuf::from("/nonexistent/capture.jpg"))))
            .await;
        assert!(email.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_recipient_rejected() {
        let notifier = SmtpNotifier::new(&smtp_config()).unwrap();
        let mut bad = message(None);
        bad.to = "nobody".to_string();
        assert!(matches!(
            notifier.build_message(&bad).await,
            Err(NotifyError::InvalidAddress(_))
        ));
    }
}
