use crate::error::MagicLinkError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, IVec, Subscriber, Tree};

const READY_TREE: &str = "magic_links";

/// Session credential minted for a redeemed link, waiting to be picked up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCredential {
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl ReadyCredential {
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > max_age
    }
}

/// Well-known per-email location where redeemed links park credentials.
#[derive(Clone)]
pub struct CredentialStore {
    tree: Tree,
}

impl CredentialStore {
    pub fn open(db: &Db) -> Result<Self, MagicLinkError> {
        Ok(Self {
            tree: db.open_tree(READY_TREE)?,
        })
    }

    pub fn publish(&self, email: &str, credential: &ReadyCredential) -> Result<(), MagicLinkError> {
        self.tree
            .insert(email.as_bytes(), serde_json::to_vec(credential)?)?;
        Ok(())
    }

    pub fn get(&self, email: &str) -> Result<Option<(IVec, ReadyCredential)>, MagicLinkError> {
        match self.tree.get(email.as_bytes())? {
            Some(raw) => {
                let credential = serde_json::from_slice(&raw)?;
                Ok(Some((raw, credential)))
            }
            None => Ok(None),
        }
    }

    /// Delete the record only if it still holds `seen`. Returns whether this
    /// caller removed it.
    pub fn claim(&self, email: &str, seen: &IVec) -> Result<bool, MagicLinkError> {
        Ok(self
            .tree
            .compare_and_swap(email.as_bytes(), Some(seen), None::<&[u8]>)?
            .is_ok())
    }

    /// Drop credentials parked longer than `max_age`. Returns how many were
    /// removed.
    pub fn purge_stale(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize, MagicLinkError> {
        let mut removed = 0;
        for item in self.tree.iter() {
            let (key, raw) = item?;
            let stale = match serde_json::from_slice::<ReadyCredential>(&raw) {
                Ok(credential) => credential.is_stale(max_age, now),
                Err(_) => true,
            };
            if stale && self.tree.compare_and_swap(&key, Some(&raw), None::<&[u8]>)?.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "purged uncollected sign-in credentials");
        }
        Ok(removed)
    }

    /// Change notifications for keys starting with `email`.
    pub fn watch(&self, email: &str) -> Subscriber {
        self.tree.watch_prefix(email.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        CredentialStore::open(&db).unwrap()
    }

    fn parked(minutes_ago: i64, now: DateTime<Utc>) -> ReadyCredential {
        ReadyCredential {
            token: format!("cred-{minutes_ago}"),
            created_at: now - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn purge_drops_only_uncollected_credentials() {
        let credentials = store();
        let now = Utc::now();
        credentials.publish("old@example.com", &parked(180, now)).unwrap();
        credentials.publish("new@example.com", &parked(1, now)).unwrap();

        assert_eq!(credentials.purge_stale(Duration::minutes(5), now).unwrap(), 1);
        assert!(credentials.get("old@example.com").unwrap().is_none());
        assert!(credentials.get("new@example.com").unwrap().is_some());
    }

    #[test]
    fn claim_only_succeeds_for_the_seen_value() {
        let credentials = store();
        let now = Utc::now();
        credentials.publish("a@example.com", &parked(1, now)).unwrap();
        let (seen, _) = credentials.get("a@example.com").unwrap().unwrap();
        credentials.publish("a@example.com", &parked(0, now)).unwrap();

        assert!(!credentials.claim("a@example.com", &seen).unwrap());
        let (current, _) = credentials.get("a@example.com").unwrap().unwrap();
        assert!(credentials.claim("a@example.com", &current).unwrap());
        assert!(credentials.get("a@example.com").unwrap().is_none());
    }
}
