use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MagicLinkError {
    #[error("Missing email address")]
    MissingEmail,

    #[error("Invalid link expiration: {0} minutes")]
    InvalidExpiration(i64),

    /// The caller expected the account to exist (login) or not (sign-up)
    /// and the identity store disagrees.
    #[error("Account state does not match the requested flow")]
    AccountStateMismatch { expected_exists: bool },

    #[error("Missing token")]
    MissingToken,

    #[error("Invalid or expired link")]
    InvalidOrExpired,

    #[error("Link expired")]
    Expired,

    #[error("Invalid session credential: {0}")]
    InvalidCredential(String),

    #[error("Unknown account {0}")]
    UnknownAccount(String),

    #[error("Failed to send email: {0:#}")]
    Mail(anyhow::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl MagicLinkError {
    /// Errors caused by the request itself rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MagicLinkError::MissingEmail
                | MagicLinkError::InvalidExpiration(_)
                | MagicLinkError::AccountStateMismatch { .. }
                | MagicLinkError::MissingToken
                | MagicLinkError::InvalidOrExpired
                | MagicLinkError::Expired
                | MagicLinkError::InvalidCredential(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Sign-in timed out after {0:?}. Please try again.")]
    Timeout(Duration),

    #[error("Sign-in rejected: {0}")]
    Rejected(#[source] MagicLinkError),

    #[error("credential subscription closed")]
    Closed,

    #[error("credential store: {0}")]
    Store(#[source] MagicLinkError),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Issue(#[from] MagicLinkError),

    #[error(transparent)]
    Wait(#[from] WaitError),
}
