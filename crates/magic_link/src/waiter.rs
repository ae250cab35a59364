use crate::credentials::CredentialStore;
use crate::error::WaitError;
use crate::identity::normalize_email;
use crate::session::{Session, SessionExchange};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(5 * 60);

/// Waits for a redeemed link's credential to appear and exchanges it.
///
/// [`LinkWaiter::wait`] is an ordinary future: dropping it before it
/// resolves releases the subscription and the timer.
///
/// Credentials parked longer than [`LinkWaiter::stale_after`] belong to a
/// click nobody collected; they are discarded and the wait goes on.
#[derive(Clone)]
pub struct LinkWaiter {
    credentials: CredentialStore,
    exchange: Arc<dyn SessionExchange>,
    timeout: Duration,
    stale_after: chrono::Duration,
}

impl LinkWaiter {
    pub fn new(credentials: CredentialStore, exchange: Arc<dyn SessionExchange>) -> Self {
        Self {
            credentials,
            exchange,
            timeout: DEFAULT_WAIT,
            stale_after: chrono::Duration::minutes(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, max_age: chrono::Duration) -> Self {
        self.stale_after = max_age;
        self
    }

    pub fn stale_after(&self) -> chrono::Duration {
        self.stale_after
    }

    pub async fn wait(&self, email: &str) -> Result<Session, WaitError> {
        let email = normalize_email(email);
        match tokio::time::timeout(self.timeout, self.watch(&email)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(timeout_secs = self.timeout.as_secs(), "sign-in wait timed out");
                Err(WaitError::Timeout(self.timeout))
            }
        }
    }

    async fn watch(&self, email: &str) -> Result<Session, WaitError> {
        // subscribe before the first read so nothing published in between is missed
        let mut subscriber = self.credentials.watch(email);

        if let Some(session) = self.try_claim(email).await? {
            return Ok(session);
        }
        while (&mut subscriber).await.is_some() {
            if let Some(session) = self.try_claim(email).await? {
                return Ok(session);
            }
        }
        Err(WaitError::Closed)
    }

    async fn try_claim(&self, email: &str) -> Result<Option<Session>, WaitError> {
        let Some((raw, credential)) = self.credentials.get(email).map_err(WaitError::Store)? else {
            return Ok(None);
        };
        // another waiter may have taken it first
        if !self.credentials.claim(email, &raw).map_err(WaitError::Store)? {
            return Ok(None);
        }
        if credential.is_stale(self.stale_after, Utc::now()) {
            tracing::info!(created_at = %credential.created_at, "discarded uncollected sign-in credential");
            return Ok(None);
        }
        let session = self
            .exchange
            .exchange(&credential.token)
            .await
            .map_err(WaitError::Rejected)?;
        tracing::info!(uid = %session.uid, "sign-in completed");
        Ok(Some(session))
    }
}
