use crate::error::MagicLinkError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

const TOKENS_TREE: &str = "pending_magic_links";

/// A pending sign-in link, keyed by its token value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MagicLinkToken {
    pub token: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MagicLinkToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Clone)]
pub struct TokenStore {
    tree: Tree,
}

impl TokenStore {
    pub fn open(db: &Db) -> Result<Self, MagicLinkError> {
        Ok(Self {
            tree: db.open_tree(TOKENS_TREE)?,
        })
    }

    pub fn issue(&self, email: &str, ttl: Duration, now: DateTime<Utc>) -> Result<MagicLinkToken, MagicLinkError> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or(MagicLinkError::InvalidExpiration(ttl.num_minutes()))?;
        let token = MagicLinkToken {
            token: uuid::Uuid::new_v4().to_string(),
            email: email.to_string(),
            created_at: now,
            expires_at,
        };
        self.tree
            .insert(token.token.as_bytes(), serde_json::to_vec(&token)?)?;
        Ok(token)
    }

    pub fn get(&self, token: &str) -> Result<Option<MagicLinkToken>, MagicLinkError> {
        match self.tree.get(token.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove and return the token. Of any number of concurrent callers,
    /// exactly one gets `Some`.
    pub fn take(&self, token: &str) -> Result<Option<MagicLinkToken>, MagicLinkError> {
        match self.tree.remove(token.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop every token past its expiry. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, MagicLinkError> {
        let mut removed = 0;
        for item in self.tree.iter() {
            let (key, raw) = item?;
            let expired = match serde_json::from_slice::<MagicLinkToken>(&raw) {
                Ok(token) => token.is_expired(now),
                // unreadable entries can never be redeemed
                Err(_) => true,
            };
            if expired && self.tree.compare_and_swap(&key, Some(&raw), None::<&[u8]>)?.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "purged expired magic link tokens");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
