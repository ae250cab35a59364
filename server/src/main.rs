mod routes;

use access_point::{
    aeat::{AeatAuth, AeatClient},
    mock::MockClient,
    AccessPointClient,
};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use config::{secrets, AppConfig};
use ledger::{AuditLog, BackoffPolicy, Emitter, LedgerStore, QueueProcessor, RetryWorker};
use magic_link::email::{ConsoleMailer, Mailer, SmtpConfig, SmtpMailer};
use magic_link::{
    CredentialStore, LinkConsumer, LinkSettings, LinkWaiter, MagicLinkIssuer, SessionIssuer,
    SledIdentityStore, TokenStore,
};
use routes::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sled=warn".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> Result<AppConfig> {
    match std::env::var("BILLCHAIN_CONFIG") {
        Ok(path) => config::load_from(path),
        Err(_) => Ok(config::load().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "using default config");
            AppConfig::default()
        })),
    }
}

fn create_access_point_client(cfg: &AppConfig) -> Result<Arc<dyn AccessPointClient>> {
    match cfg.provider.kind.as_str() {
        "aeat" => {
            let base_url = cfg
                .provider
                .base_url
                .clone()
                .ok_or_else(|| anyhow!("AEAT base_url not configured"))?;

            // Try API key first from env or keychain
            if let Ok(api_key) = config::resolve_secret("AEAT_API_KEY", secrets::AEAT_API_KEY) {
                tracing::info!("Using AEAT gateway with API key auth");
                let auth = AeatAuth::ApiKey { key: api_key };
                return Ok(AeatClient::new(base_url, auth)?);
            }

            let client_id = cfg
                .provider
                .client_id
                .clone()
                .ok_or_else(|| anyhow!("AEAT client_id not configured"))?;
            let client_secret = config::resolve_secret("AEAT_CLIENT_SECRET", secrets::AEAT_CLIENT_SECRET)
                .map_err(|_| anyhow!("AEAT client_secret not found in env or keychain"))?;
            let token_url = cfg
                .provider
                .token_url
                .clone()
                .unwrap_or_else(|| format!("{}/oauth/token", base_url));

            tracing::info!("Using AEAT gateway with OAuth2 auth");
            let auth = AeatAuth::OAuth2 {
                client_id,
                client_secret,
                token_url,
            };
            Ok(AeatClient::new(base_url, auth)?)
        }
        _ => {
            tracing::info!("Using mock access point");
            Ok(MockClient::new())
        }
    }
}

fn create_mailer(cfg: &AppConfig) -> Result<Arc<dyn Mailer>> {
    let Some(smtp) = &cfg.smtp else {
        tracing::warn!("SMTP not configured, sign-in emails are logged to the console");
        return Ok(Arc::new(ConsoleMailer::new().with_full_output(true)));
    };

    let mut smtp_config = SmtpConfig::new(&smtp.host).port(smtp.port).from(&smtp.from);
    if let Some(username) = &smtp.username {
        let password = config::resolve_secret("SMTP_PASSWORD", secrets::SMTP_PASSWORD)
            .context("SMTP username set but no password in env or keychain")?;
        smtp_config = smtp_config.credentials(username, password);
    }
    if !smtp.starttls {
        smtp_config = smtp_config.no_starttls();
    }

    tracing::info!(host = %smtp.host, port = smtp.port, "Using SMTP mailer");
    Ok(Arc::new(SmtpMailer::new(smtp_config)?))
}

fn session_key() -> Vec<u8> {
    match config::resolve_secret("BILLCHAIN_SESSION_KEY", secrets::SESSION_KEY) {
        Ok(key) => key.into_bytes(),
        Err(_) => {
            // sessions will not survive a restart
            tracing::warn!("no session signing key configured, generating an ephemeral one");
            rand::random::<[u8; 32]>().to_vec()
        }
    }
}

fn spawn_token_sweeper(
    tokens: TokenStore,
    credentials: CredentialStore,
    stale_after: chrono::Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(err) = tokens.purge_expired(now) {
                        tracing::error!(error = %err, "magic link sweep failed");
                    }
                    if let Err(err) = credentials.purge_stale(stale_after, now) {
                        tracing::error!(error = %err, "sign-in credential sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("magic link sweeper stopped");
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = load_config()?;

    std::fs::create_dir_all(&cfg.storage.data_dir).with_context(|| {
        format!("Failed to create data dir {}", cfg.storage.data_dir.display())
    })?;
    let db = sled::open(cfg.storage.db_path()).context("Failed to open database")?;

    let audit = cfg
        .storage
        .audit_path()
        .map(AuditLog::new)
        .unwrap_or_else(AuditLog::disabled);
    let store = LedgerStore::from_db(db.clone())?;
    let processor = QueueProcessor::new(store.clone(), create_access_point_client(&cfg)?, audit.clone());
    let emitter = Emitter::new(processor.clone(), audit);

    let tokens = TokenStore::open(&db)?;
    let credentials = CredentialStore::open(&db)?;
    let identity = Arc::new(SledIdentityStore::open(&db)?);
    let sessions = SessionIssuer::new(
        session_key(),
        chrono::Duration::minutes(cfg.magic_link.session_ttl_minutes),
    );
    let settings = LinkSettings {
        public_base_url: cfg.magic_link.public_base_url.clone(),
        from_address: cfg
            .smtp
            .as_ref()
            .map(|s| s.from.clone())
            .unwrap_or_else(|| format!("noreply@{}", cfg.magic_link.app_name.replace(' ', "").to_lowercase())),
        app_name: cfg.magic_link.app_name.clone(),
        support_email: cfg.magic_link.support_email.clone(),
        expiration_minutes: cfg.magic_link.expiration_minutes,
    };
    let issuer = MagicLinkIssuer::new(tokens.clone(), identity.clone(), create_mailer(&cfg)?, settings);
    let consumer = LinkConsumer::new(tokens.clone(), identity, sessions.clone(), credentials.clone());
    let waiter = LinkWaiter::new(credentials.clone(), Arc::new(sessions.clone()));
    let stale_after = waiter.stale_after();

    let state = AppState {
        emitter,
        issuer,
        consumer,
        waiter,
        sessions,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let policy = BackoffPolicy {
        base: Duration::from_secs(cfg.server.retry_base_secs),
        max: Duration::from_secs(cfg.server.retry_max_secs),
        ..Default::default()
    };
    let worker = RetryWorker::new(processor, policy, Duration::from_secs(cfg.server.retry_tick_secs))
        .spawn(shutdown_rx.clone());
    let sweeper = spawn_token_sweeper(
        tokens,
        credentials,
        stale_after,
        Duration::from_secs(cfg.magic_link.sweep_interval_secs),
        shutdown_rx,
    );

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind))?;
    tracing::info!(addr = %cfg.server.bind, "billchain listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(worker, sweeper);
    store.flush().await.context("Failed to flush database")?;
    Ok(())
}
