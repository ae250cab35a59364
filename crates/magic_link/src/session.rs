use crate::error::MagicLinkError;
use crate::identity::{Account, Role};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub uid: String,
    pub email: String,
    pub role: Option<Role>,
    /// Expiry as unix seconds.
    pub exp: i64,
}

/// A live, verified session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// The bearer credential this session was verified from.
    pub credential: String,
    pub uid: String,
    pub email: String,
    pub role: Option<Role>,
    pub expires_at: DateTime<Utc>,
}

/// Turns a parked credential into a live session.
#[async_trait]
pub trait SessionExchange: Send + Sync {
    async fn exchange(&self, credential: &str) -> Result<Session, MagicLinkError>;
}

/// Mints and verifies HMAC-signed session credentials:
/// `base64url(claims json) "." hex(hmac_sha256(payload))`.
#[derive(Clone)]
pub struct SessionIssuer {
    key: Vec<u8>,
    ttl: Duration,
}

impl SessionIssuer {
    pub fn new(key: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self { key: key.into(), ttl }
    }

    fn mac(&self) -> Result<HmacSha256, MagicLinkError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| MagicLinkError::InvalidCredential(format!("signing key rejected: {e}")))
    }

    pub fn mint(&self, account: &Account, now: DateTime<Utc>) -> Result<String, MagicLinkError> {
        let claims = SessionClaims {
            uid: account.uid.clone(),
            email: account.email.clone(),
            role: account.role,
            exp: (now + self.ttl).timestamp(),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify(&self, credential: &str, now: DateTime<Utc>) -> Result<Session, MagicLinkError> {
        let invalid = |reason: &str| MagicLinkError::InvalidCredential(reason.to_string());

        let credential = credential.trim();
        let (payload, signature) = credential
            .split_once('.')
            .ok_or_else(|| invalid("malformed"))?;
        let signature = hex::decode(signature).map_err(|_| invalid("malformed signature"))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| invalid("bad signature"))?;

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| invalid("malformed payload"))?;
        let claims: SessionClaims = serde_json::from_slice(&raw)?;

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| invalid("bad expiry"))?;
        if now >= expires_at {
            return Err(invalid("expired"));
        }

        Ok(Session {
            credential: credential.to_string(),
            uid: claims.uid,
            email: claims.email,
            role: claims.role,
            expires_at,
        })
    }
}

#[async_trait]
impl SessionExchange for SessionIssuer {
    async fn exchange(&self, credential: &str) -> Result<Session, MagicLinkError> {
        self.verify(credential, Utc::now())
    }
}
