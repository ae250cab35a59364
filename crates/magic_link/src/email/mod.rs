//! Outbound email for sign-in links.
//!
//! - [`SmtpMailer`] sends through an SMTP relay using lettre
//! - [`ConsoleMailer`] logs instead of sending (development)

mod console;
mod smtp;

pub use console::ConsoleMailer;
pub use smtp::{SmtpConfig, SmtpMailer};

use anyhow::{bail, Result};
use async_trait::async_trait;

/// A transactional email with text and/or HTML bodies.
#[derive(Debug, Clone)]
pub struct Email {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl Email {
    pub fn new(from: impl Into<String>, to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            text: None,
            html: None,
        }
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.to.is_empty() {
            bail!("Email 'to' is required");
        }
        if self.subject.is_empty() {
            bail!("Email 'subject' is required");
        }
        if self.text.is_none() && self.html.is_none() {
            bail!("Email must have either 'text' or 'html' body");
        }
        Ok(())
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns once the relay accepted the message.
    async fn send(&self, email: &Email) -> Result<()>;
}
