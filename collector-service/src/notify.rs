use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailConfig;

/// Outbound alert delivery. Modeled as a trait so the health monitor can be
/// exercised against a sink that fails on demand.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from: Mailbox = config
            .from_address
            .parse()
            .with_context(|| format!("invalid from_address: {}", config.from_address))?;

        let creds = Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());

        let transport = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .with_context(|| format!("failed to create SMTP relay: {}", config.smtp_host))?
                .port(config.smtp_port)
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
                .port(config.smtp_port)
                .credentials(creds)
                .build()
        };

        Ok(Self { transport, from })
    }
}

#[async_trait::async_trait]
impl NotificationSink for EmailNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient
                .parse()
                .with_context(|| format!("invalid recipient address: {recipient}"))?)
            .subject(subject)
            .body(body.to_string())?;

        self.transport.send(message).await?;
        Ok(())
    }
}
