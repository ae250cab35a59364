use super::{Email, Mailer};
use anyhow::Result;
use async_trait::async_trait;

/// Logs emails through `tracing` instead of sending them.
///
/// Bodies carry live sign-in links, so they are only logged when
/// `with_full_output(true)` is set.
#[derive(Debug, Clone, Default)]
pub struct ConsoleMailer {
    show_full_content: bool,
}

impl ConsoleMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_full_output(mut self, show: bool) -> Self {
        self.show_full_content = show;
        self
    }
}

#[async_trait]
impl Mailer for ConsoleMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;
        if self.show_full_content {
            tracing::info!(
                to = %email.to,
                subject = %email.subject,
                text = email.text.as_deref().unwrap_or(""),
                "email (console)"
            );
        } else {
            tracing::info!(to = %email.to, subject = %email.subject, "email (console, body redacted)");
        }
        Ok(())
    }
}
