use crate::credentials::{CredentialStore, ReadyCredential};
use crate::error::MagicLinkError;
use crate::identity::{IdentityProvider, Role};
use crate::session::SessionIssuer;
use crate::token::TokenStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedLink {
    pub email: String,
    pub uid: String,
    pub created_account: bool,
}

/// Redeems emailed tokens and parks a session credential for the waiter.
#[derive(Clone)]
pub struct LinkConsumer {
    tokens: TokenStore,
    identity: Arc<dyn IdentityProvider>,
    sessions: SessionIssuer,
    credentials: CredentialStore,
}

impl LinkConsumer {
    pub fn new(
        tokens: TokenStore,
        identity: Arc<dyn IdentityProvider>,
        sessions: SessionIssuer,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            tokens,
            identity,
            sessions,
            credentials,
        }
    }

    pub async fn consume(&self, token: Option<&str>) -> Result<ConsumedLink, MagicLinkError> {
        self.consume_at(token, Utc::now()).await
    }

    pub async fn consume_at(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ConsumedLink, MagicLinkError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(MagicLinkError::MissingToken)?;

        // removal is the redemption: a second click finds nothing
        let pending = self
            .tokens
            .take(token)?
            .ok_or(MagicLinkError::InvalidOrExpired)?;
        if pending.is_expired(now) {
            tracing::info!(expired_at = %pending.expires_at, "expired magic link presented");
            return Err(MagicLinkError::Expired);
        }

        let (mut account, created_account) = match self.identity.find_by_email(&pending.email).await? {
            Some(account) => (account, false),
            None => (self.identity.create_user(&pending.email).await?, true),
        };
        if account.role.is_none() {
            account = self.identity.set_role(&pending.email, Role::User).await?;
        }

        let credential = self.sessions.mint(&account, now)?;
        self.credentials.publish(
            &pending.email,
            &ReadyCredential {
                token: credential,
                created_at: now,
            },
        )?;

        tracing::info!(uid = %account.uid, created_account, "magic link redeemed");
        Ok(ConsumedLink {
            email: pending.email,
            uid: account.uid,
            created_account,
        })
    }
}
