use super::{Email, Mailer};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    /// 465 for implicit TLS, 587 for STARTTLS
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_from: Option<String>,
    pub starttls: bool,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 587,
            username: None,
            password: None,
            default_from: None,
            starttls: true,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.default_from = Some(address.into());
        self
    }

    /// Implicit TLS instead of STARTTLS.
    pub fn no_starttls(mut self) -> Self {
        self.starttls = false;
        self
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .context("Failed to create SMTP transport")?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .context("Failed to create SMTP transport")?
        };

        builder = builder.port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            config,
        })
    }

    fn build_message(&self, email: &Email) -> Result<Message> {
        let from_str = if email.from.is_empty() {
            self.config
                .default_from
                .as_deref()
                .ok_or_else(|| anyhow!("No 'from' address specified and no default configured"))?
        } else {
            email.from.as_str()
        };

        let from: Mailbox = from_str
            .parse()
            .map_err(|e| anyhow!("Invalid 'from' address: {}", e))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| anyhow!("Invalid 'to' address '{}': {}", email.to, e))?;

        let builder = Message::builder().from(from).to(to).subject(&email.subject);

        let message = match (&email.text, &email.html) {
            (Some(text), Some(html)) => builder
                .multipart(
                    MultiPart::alternative()
                        .singlepart(
                            SinglePart::builder()
                                .header(ContentType::TEXT_PLAIN)
                                .body(text.clone()),
                        )
                        .singlepart(
                            SinglePart::builder()
                                .header(ContentType::TEXT_HTML)
                                .body(html.clone()),
                        ),
                )
                .context("Failed to build email")?,
            (Some(text), None) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone())
                .context("Failed to build email")?,
            (None, Some(html)) => builder
                .header(ContentType::TEXT_HTML)
                .body(html.clone())
                .context("Failed to build email")?,
            (None, None) => bail!("Email must have either text or HTML body"),
        };

        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;
        let message = self.build_message(email)?;
        let response = self
            .transport
            .send(message)
            .await
            .context("Failed to send email")?;
        tracing::debug!(to = %email.to, code = %response.code(), "email accepted by relay");
        Ok(())
    }
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish()
    }
}
