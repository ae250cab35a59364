use crate::email::{Email, Mailer};
use crate::error::MagicLinkError;
use crate::identity::{normalize_email, IdentityProvider};
use crate::token::{MagicLinkToken, TokenStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Longest lifetime a caller may request for a link.
pub const MAX_EXPIRATION_MINUTES: i64 = 24 * 60;

/// Service-wide settings for issued links.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Public origin serving `/magicLinkHandler`.
    pub public_base_url: String,
    pub from_address: String,
    pub app_name: String,
    pub support_email: String,
    pub expiration_minutes: i64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            public_base_url: "http://127.0.0.1:8080".to_string(),
            from_address: String::new(),
            app_name: "Bill App".to_string(),
            support_email: "support@example.com".to_string(),
            expiration_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MagicLinkRequest {
    #[serde(default)]
    pub to: String,
    pub app_name: Option<String>,
    pub recipient_name: Option<String>,
    pub expiration_minutes: Option<i64>,
    pub support_email: Option<String>,
    /// Expected account existence: `true` for login, `false` for sign-up.
    pub exist: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInfo {
    pub to: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MagicLinkResponse {
    pub success: bool,
    pub info: SendInfo,
}

#[derive(Clone)]
pub struct MagicLinkIssuer {
    tokens: TokenStore,
    identity: Arc<dyn IdentityProvider>,
    mailer: Arc<dyn Mailer>,
    settings: LinkSettings,
}

impl MagicLinkIssuer {
    pub fn new(
        tokens: TokenStore,
        identity: Arc<dyn IdentityProvider>,
        mailer: Arc<dyn Mailer>,
        settings: LinkSettings,
    ) -> Self {
        Self {
            tokens,
            identity,
            mailer,
            settings,
        }
    }

    pub async fn send(&self, request: MagicLinkRequest) -> Result<MagicLinkResponse, MagicLinkError> {
        self.send_at(request, Utc::now()).await
    }

    pub async fn send_at(
        &self,
        request: MagicLinkRequest,
        now: DateTime<Utc>,
    ) -> Result<MagicLinkResponse, MagicLinkError> {
        let to = normalize_email(&request.to);
        if to.is_empty() {
            return Err(MagicLinkError::MissingEmail);
        }

        if let Some(expected_exists) = request.exist {
            let exists = self.identity.find_by_email(&to).await?.is_some();
            if exists != expected_exists {
                tracing::info!(expected_exists, "magic link refused: account state mismatch");
                return Err(MagicLinkError::AccountStateMismatch { expected_exists });
            }
        }

        let minutes = request
            .expiration_minutes
            .unwrap_or(self.settings.expiration_minutes);
        if !(1..=MAX_EXPIRATION_MINUTES).contains(&minutes) {
            return Err(MagicLinkError::InvalidExpiration(minutes));
        }

        let token = self.tokens.issue(&to, Duration::minutes(minutes), now)?;
        let email = self.render(&request, &to, &token, minutes);

        if let Err(err) = self.mailer.send(&email).await {
            // an unsent link can never be clicked
            self.tokens.take(&token.token)?;
            tracing::error!(error = %err, "failed to send magic link email");
            return Err(MagicLinkError::Mail(err));
        }

        tracing::info!(expires_at = %token.expires_at, "magic link sent");
        Ok(MagicLinkResponse {
            success: true,
            info: SendInfo {
                to,
                expires_at: token.expires_at,
            },
        })
    }

    pub fn link_for(&self, token: &str) -> String {
        format!(
            "{}/magicLinkHandler?token={}",
            self.settings.public_base_url.trim_end_matches('/'),
            token
        )
    }

    fn render(&self, request: &MagicLinkRequest, to: &str, token: &MagicLinkToken, minutes: i64) -> Email {
        let app_name = request.app_name.as_deref().unwrap_or(&self.settings.app_name);
        let support = request
            .support_email
            .as_deref()
            .unwrap_or(&self.settings.support_email);
        let greeting = match request.recipient_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("Hi {name},"),
            _ => "Hi,".to_string(),
        };
        let link = self.link_for(&token.token);

        let text = format!(
            "{greeting}\n\n\
             We received a request to sign in to your {app_name} account.\n\n\
             Click the link below to confirm and sign in:\n{link}\n\n\
             This link will expire in {minutes} minutes. If you didn't request this, you can safely ignore this email.\n\n\
             The {app_name} Team\n{support}\n"
        );
        let subject = format!("{app_name} Sign-In Confirmation");

        let (app_name, greeting, link, support) = (
            escape_html(app_name),
            escape_html(&greeting),
            escape_html(&link),
            escape_html(support),
        );
        let html = format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; line-height: 1.5; color: #333;">
  <h2>Sign in to {app_name}</h2>
  <p>{greeting}</p>
  <p>We received a request to sign in to your {app_name} account.</p>
  <p>
    <a href="{link}" style="background-color: #4CAF50; color: white; padding: 10px 20px;
       text-decoration: none; border-radius: 4px; display: inline-block;">
      Confirm Sign-In
    </a>
  </p>
  <p>This link will expire in <strong>{minutes} minutes</strong>.</p>
  <p>If you didn't request this, you can safely ignore this email.</p>
  <p>The {app_name} Team<br>
     <a href="mailto:{support}">{support}</a></p>
</body>
</html>
"#
        );

        Email::new(self.settings.from_address.clone(), to, subject)
            .text(text)
            .html(html)
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
