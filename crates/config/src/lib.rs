use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_NAME: &str = "billchain";
const KEYCHAIN_SERVICE: &str = "billchain.credentials";

/// Keychain entry names for the secrets the server reads.
pub mod secrets {
    pub const AEAT_API_KEY: &str = "aeat_api_key";
    pub const AEAT_CLIENT_SECRET: &str = "aeat_client_secret";
    pub const SMTP_PASSWORD: &str = "smtp_password";
    pub const SESSION_KEY: &str = "session_signing_key";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
    #[serde(default)]
    pub magic_link: MagicLinkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String, // "mock" | "aeat"
    pub base_url: Option<String>,
    pub client_id: Option<String>,
    pub token_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: None,
            client_id: None,
            token_url: None,
        }
    }
}

fn default_provider_kind() -> String {
    "mock".to_string()
}

/// SMTP relay; the password lives in the keychain or `SMTP_PASSWORD`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub from: String,
    #[serde(default = "default_true")]
    pub starttls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagicLinkConfig {
    pub public_base_url: String,
    pub app_name: String,
    pub support_email: String,
    pub expiration_minutes: i64,
    pub session_ttl_minutes: i64,
    /// Interval of the expired-token sweep.
    pub sweep_interval_secs: u64,
}

impl Default for MagicLinkConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://127.0.0.1:8080".to_string(),
            app_name: "Bill App".to_string(),
            support_email: "support@example.com".to_string(),
            expiration_minutes: 5,
            session_ttl_minutes: 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Write the JSONL audit trail next to the database.
    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".billchain"),
            audit: true,
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn audit_path(&self) -> Option<PathBuf> {
        self.audit.then(|| self.data_dir.join("audit.jsonl"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    /// Retry worker backoff, in seconds.
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub retry_tick_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            retry_base_secs: 5,
            retry_max_secs: 300,
            retry_tick_secs: 5,
        }
    }
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

/// Load from an explicit file instead of the platform config dir.
pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let cfg: AppConfig = confy::load_path(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

pub fn store_to(path: impl AsRef<Path>, cfg: &AppConfig) -> Result<()> {
    let path = path.as_ref();
    confy::store_path(path, cfg)
        .with_context(|| format!("Failed to store config to {}", path.display()))?;
    Ok(())
}

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry
        .get_password()
        .with_context(|| format!("secret '{key}' not found in keychain"))?;
    Ok(password)
}

pub fn delete_secret(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.delete_password()?;
    Ok(())
}

/// Environment variable first, then the keychain.
pub fn resolve_secret(env_var: &str, key: &str) -> Result<String> {
    match std::env::var(env_var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => {
            tracing::debug!(env_var, "secret not in environment, trying keychain");
            get_secret(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_a_local_mock_setup() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.provider.kind, "mock");
        assert!(cfg.smtp.is_none());
        assert_eq!(cfg.magic_link.expiration_minutes, 5);
        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
        assert_eq!(
            cfg.storage.audit_path(),
            Some(PathBuf::from(".billchain").join("audit.jsonl"))
        );
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("billchain.toml");
        std::fs::write(
            &path,
            "[provider]\nkind = \"aeat\"\nbase_url = \"https://aeat.example\"\n\n\
             [smtp]\nhost = \"smtp.example.com\"\nfrom = \"noreply@example.com\"\n",
        )
        .unwrap();

        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.provider.kind, "aeat");
        assert_eq!(cfg.provider.base_url.as_deref(), Some("https://aeat.example"));
        let smtp = cfg.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert!(smtp.starttls);
        assert_eq!(cfg.magic_link, MagicLinkConfig::default());
    }

    #[test]
    fn store_then_load_keeps_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("billchain.toml");
        let mut cfg = AppConfig::default();
        cfg.storage.data_dir = dir.path().join("data");
        cfg.magic_link.app_name = "Facturas".to_string();

        store_to(&path, &cfg).unwrap();
        assert_eq!(load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn env_secret_wins_over_keychain() {
        std::env::set_var("BILLCHAIN_TEST_SECRET", "from-env");
        assert_eq!(
            resolve_secret("BILLCHAIN_TEST_SECRET", "unused-key").unwrap(),
            "from-env"
        );
        std::env::remove_var("BILLCHAIN_TEST_SECRET");
    }
}
