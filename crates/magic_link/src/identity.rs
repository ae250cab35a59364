use crate::error::MagicLinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

const ACCOUNTS_TREE: &str = "accounts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    User,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub uid: String,
    pub email: String,
    pub role: Option<Role>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub profile: Option<UserProfile>,
}

/// Lower-cased, trimmed form used as the key for everything per-email.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, MagicLinkError>;

    /// Create the account, or return the existing one if another caller won.
    async fn create_user(&self, email: &str) -> Result<Account, MagicLinkError>;

    async fn set_role(&self, email: &str, role: Role) -> Result<Account, MagicLinkError>;

    async fn set_profile(&self, email: &str, profile: UserProfile) -> Result<Account, MagicLinkError>;
}

#[derive(Clone)]
pub struct SledIdentityStore {
    tree: Tree,
}

impl SledIdentityStore {
    pub fn open(db: &Db) -> Result<Self, MagicLinkError> {
        Ok(Self {
            tree: db.open_tree(ACCOUNTS_TREE)?,
        })
    }

    fn update<F>(&self, email: &str, f: F) -> Result<Account, MagicLinkError>
    where
        F: FnOnce(&mut Account),
    {
        let raw = self
            .tree
            .get(email.as_bytes())?
            .ok_or_else(|| MagicLinkError::UnknownAccount(email.to_string()))?;
        let mut account: Account = serde_json::from_slice(&raw)?;
        f(&mut account);
        self.tree.insert(email.as_bytes(), serde_json::to_vec(&account)?)?;
        Ok(account)
    }
}

#[async_trait]
impl IdentityProvider for SledIdentityStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, MagicLinkError> {
        match self.tree.get(email.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn create_user(&self, email: &str) -> Result<Account, MagicLinkError> {
        let account = Account {
            uid: uuid::Uuid::new_v4().simple().to_string(),
            email: email.to_string(),
            role: None,
            created_at: Utc::now(),
            profile: None,
        };
        let encoded = serde_json::to_vec(&account)?;
        match self
            .tree
            .compare_and_swap(email.as_bytes(), None::<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                tracing::info!(uid = %account.uid, "account created");
                Ok(account)
            }
            Err(existing) => match existing.current {
                Some(raw) => Ok(serde_json::from_slice(&raw)?),
                None => Err(MagicLinkError::UnknownAccount(email.to_string())),
            },
        }
    }

    async fn set_role(&self, email: &str, role: Role) -> Result<Account, MagicLinkError> {
        self.update(email, |a| a.role = Some(role))
    }

    async fn set_profile(&self, email: &str, profile: UserProfile) -> Result<Account, MagicLinkError> {
        self.update(email, |a| a.profile = Some(profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent_per_email() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledIdentityStore::open(&db).unwrap();

        let first = store.create_user("a@example.com").await.unwrap();
        let second = store.create_user("a@example.com").await.unwrap();
        assert_eq!(first.uid, second.uid);

        let updated = store.set_role("a@example.com", Role::User).await.unwrap();
        assert_eq!(updated.role, Some(Role::User));
        assert!(store.set_role("missing@example.com", Role::User).await.is_err());
    }

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Ana@Example.COM "), "ana@example.com");
    }
}
