use crate::error::{FlowError, MagicLinkError};
use crate::identity::{normalize_email, Account, IdentityProvider, UserProfile};
use crate::issuer::{MagicLinkIssuer, MagicLinkRequest};
use crate::session::Session;
use crate::waiter::LinkWaiter;
use std::sync::Arc;

/// Login and sign-up built on the link handshake.
#[derive(Clone)]
pub struct AuthFlows {
    issuer: MagicLinkIssuer,
    waiter: LinkWaiter,
    identity: Arc<dyn IdentityProvider>,
}

impl AuthFlows {
    pub fn new(issuer: MagicLinkIssuer, waiter: LinkWaiter, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            issuer,
            waiter,
            identity,
        }
    }

    /// Requires an existing account.
    pub async fn login(&self, email: &str) -> Result<Session, FlowError> {
        self.issuer
            .send(MagicLinkRequest {
                to: email.to_string(),
                exist: Some(true),
                ..Default::default()
            })
            .await?;
        Ok(self.waiter.wait(email).await?)
    }

    /// Requires that no account exists yet; stores the profile once signed in.
    pub async fn sign_up(&self, email: &str, profile: UserProfile) -> Result<(Session, Account), FlowError> {
        let recipient_name = match (&profile.first_name, &profile.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.clone()),
            _ => None,
        };
        self.issuer
            .send(MagicLinkRequest {
                to: email.to_string(),
                recipient_name,
                exist: Some(false),
                ..Default::default()
            })
            .await?;
        let session = self.waiter.wait(email).await?;

        let account = self
            .identity
            .set_profile(&normalize_email(email), profile)
            .await?;
        if account.uid != session.uid {
            return Err(MagicLinkError::InvalidCredential("session does not match account".into()).into());
        }
        Ok((session, account))
    }
}
