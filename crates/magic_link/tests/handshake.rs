use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use magic_link::email::{Email, Mailer};
use magic_link::{
    AuthFlows, CredentialStore, FlowError, IdentityProvider, LinkConsumer, LinkSettings, LinkWaiter,
    MagicLinkError, MagicLinkIssuer, MagicLinkRequest, Role, SessionIssuer, SledIdentityStore,
    TokenStore, UserProfile, WaitError, MAX_EXPIRATION_MINUTES,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

struct ChannelMailer(mpsc::UnboundedSender<Email>);

#[async_trait]
impl Mailer for ChannelMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;
        self.0.send(email.clone())?;
        Ok(())
    }
}

struct FailingMailer;

#[async_trait]
impl Mailer for FailingMailer {
    async fn send(&self, _email: &Email) -> Result<()> {
        bail!("relay refused connection")
    }
}

struct Harness {
    issuer: MagicLinkIssuer,
    consumer: LinkConsumer,
    waiter: LinkWaiter,
    identity: Arc<SledIdentityStore>,
    tokens: TokenStore,
    credentials: CredentialStore,
    outbox: Mutex<mpsc::UnboundedReceiver<Email>>,
}

impl Harness {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::with_mailer(Arc::new(ChannelMailer(tx)), rx)
    }

    fn with_mailer(mailer: Arc<dyn Mailer>, outbox: mpsc::UnboundedReceiver<Email>) -> Self {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tokens = TokenStore::open(&db).unwrap();
        let credentials = CredentialStore::open(&db).unwrap();
        let identity = Arc::new(SledIdentityStore::open(&db).unwrap());
        let sessions = SessionIssuer::new(b"test-signing-key".to_vec(), ChronoDuration::hours(1));
        let settings = LinkSettings {
            public_base_url: "https://bills.example.com/".to_string(),
            from_address: "noreply@example.com".to_string(),
            ..Default::default()
        };

        Self {
            issuer: MagicLinkIssuer::new(tokens.clone(), identity.clone(), mailer, settings),
            consumer: LinkConsumer::new(tokens.clone(), identity.clone(), sessions.clone(), credentials.clone()),
            waiter: LinkWaiter::new(credentials.clone(), Arc::new(sessions)),
            identity,
            tokens,
            credentials,
            outbox: Mutex::new(outbox),
        }
    }

    fn flows(&self) -> AuthFlows {
        AuthFlows::new(self.issuer.clone(), self.waiter.clone(), self.identity.clone())
    }

    async fn next_token(&self) -> String {
        let email = self.outbox.lock().await.recv().await.expect("an email was sent");
        token_from(&email)
    }
}

fn token_from(email: &Email) -> String {
    let text = email.text.as_deref().unwrap();
    let start = text.find("token=").expect("link in body") + "token=".len();
    text[start..]
        .split_whitespace()
        .next()
        .unwrap()
        .to_string()
}

fn request(to: &str) -> MagicLinkRequest {
    MagicLinkRequest {
        to: to.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn email_carries_link_and_expiry() {
    let h = Harness::new();
    let resp = h
        .issuer
        .send(MagicLinkRequest {
            to: "Ana@Example.com".into(),
            recipient_name: Some("Ana".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.info.to, "ana@example.com");

    let email = h.outbox.lock().await.recv().await.unwrap();
    assert_eq!(email.to, "ana@example.com");
    assert_eq!(email.subject, "Bill App Sign-In Confirmation");
    let text = email.text.as_deref().unwrap();
    assert!(text.starts_with("Hi Ana,"));
    assert!(text.contains("https://bills.example.com/magicLinkHandler?token="));
    assert!(text.contains("expire in 5 minutes"));
    assert!(email.html.as_deref().unwrap().contains("Confirm Sign-In"));

    let stored = h.tokens.get(&token_from(&email)).unwrap().unwrap();
    assert_eq!(stored.expires_at - stored.created_at, ChronoDuration::minutes(5));
}

#[tokio::test]
async fn link_is_consumed_at_most_once() {
    let h = Harness::new();
    h.issuer.send(request("a@example.com")).await.unwrap();
    let token = h.next_token().await;

    let consumed = h.consumer.consume(Some(&token)).await.unwrap();
    assert_eq!(consumed.email, "a@example.com");
    assert!(consumed.created_account);

    let again = h.consumer.consume(Some(&token)).await.unwrap_err();
    assert!(matches!(again, MagicLinkError::InvalidOrExpired));
    assert_eq!(again.to_string(), "Invalid or expired link");
}

#[tokio::test]
async fn concurrent_clicks_redeem_once() {
    let h = Harness::new();
    h.issuer.send(request("a@example.com")).await.unwrap();
    let token = h.next_token().await;

    let (a, b) = tokio::join!(h.consumer.consume(Some(&token)), h.consumer.consume(Some(&token)));
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
}

#[tokio::test]
async fn expired_link_is_rejected_and_deleted() {
    let h = Harness::new();
    let issued_at = Utc::now() - ChronoDuration::minutes(6);
    h.issuer
        .send_at(
            MagicLinkRequest {
                expiration_minutes: Some(5),
                ..request("a@example.com")
            },
            issued_at,
        )
        .await
        .unwrap();
    let token = h.next_token().await;

    let err = h.consumer.consume(Some(&token)).await.unwrap_err();
    assert!(matches!(err, MagicLinkError::Expired));
    assert!(h.tokens.is_empty());
    assert!(h.identity.find_by_email("a@example.com").await.unwrap().is_none());

    let err = h.consumer.consume(Some(&token)).await.unwrap_err();
    assert!(matches!(err, MagicLinkError::InvalidOrExpired));
}

#[tokio::test]
async fn missing_token_and_email_are_rejected() {
    let h = Harness::new();
    assert!(matches!(h.consumer.consume(None).await, Err(MagicLinkError::MissingToken)));
    assert!(matches!(h.consumer.consume(Some("  ")).await, Err(MagicLinkError::MissingToken)));
    assert!(matches!(h.issuer.send(request(" ")).await, Err(MagicLinkError::MissingEmail)));
    assert!(matches!(
        h.issuer
            .send(MagicLinkRequest {
                expiration_minutes: Some(0),
                ..request("a@example.com")
            })
            .await,
        Err(MagicLinkError::InvalidExpiration(0))
    ));
}

#[tokio::test]
async fn oversized_expiration_is_refused() {
    let h = Harness::new();
    for minutes in [MAX_EXPIRATION_MINUTES + 1, 1_000_000_000_000, i64::MAX] {
        let err = h
            .issuer
            .send(MagicLinkRequest {
                expiration_minutes: Some(minutes),
                ..request("a@example.com")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MagicLinkError::InvalidExpiration(m) if m == minutes));
        assert!(err.is_client_error());
    }
    assert!(h.tokens.is_empty());
    assert!(h.outbox.lock().await.try_recv().is_err());

    h.issuer
        .send(MagicLinkRequest {
            expiration_minutes: Some(MAX_EXPIRATION_MINUTES),
            ..request("a@example.com")
        })
        .await
        .unwrap();
    assert_eq!(h.tokens.len(), 1);
}

#[tokio::test]
async fn html_body_escapes_caller_supplied_text() {
    let h = Harness::new();
    h.issuer
        .send(MagicLinkRequest {
            app_name: Some("Bills & <b>Co</b>".into()),
            recipient_name: Some("<script>alert(1)</script>".into()),
            support_email: Some("\"><img src=x>@example.com".into()),
            ..request("a@example.com")
        })
        .await
        .unwrap();

    let email = h.outbox.lock().await.recv().await.unwrap();
    let html = email.html.as_deref().unwrap();
    assert!(!html.contains("<script>"));
    assert!(!html.contains("<img"));
    assert!(html.contains("Hi &lt;script&gt;alert(1)&lt;/script&gt;,"));
    assert!(html.contains("Sign in to Bills &amp; &lt;b&gt;Co&lt;/b&gt;"));
    assert!(html.contains("mailto:&quot;&gt;&lt;img src=x&gt;@example.com"));

    // plain text and subject stay verbatim
    assert!(email.text.as_deref().unwrap().starts_with("Hi <script>alert(1)</script>,"));
    assert_eq!(email.subject, "Bills & <b>Co</b> Sign-In Confirmation");
}

#[tokio::test]
async fn account_state_mismatch_sends_nothing() {
    let h = Harness::new();
    let err = h
        .issuer
        .send(MagicLinkRequest {
            exist: Some(true),
            ..request("nobody@example.com")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MagicLinkError::AccountStateMismatch { expected_exists: true }));
    assert!(h.tokens.is_empty());
    assert!(h.outbox.lock().await.try_recv().is_err());
}

#[tokio::test]
async fn mail_failure_revokes_the_token() {
    let (_tx, rx) = mpsc::unbounded_channel();
    let h = Harness::with_mailer(Arc::new(FailingMailer), rx);
    let err = h.issuer.send(request("a@example.com")).await.unwrap_err();
    assert!(matches!(err, MagicLinkError::Mail(_)));
    assert!(h.tokens.is_empty());
}

#[tokio::test]
async fn redemption_assigns_default_role_once() {
    let h = Harness::new();
    h.identity.create_user("boss@example.com").await.unwrap();
    h.identity.set_role("boss@example.com", Role::Admin).await.unwrap();

    h.issuer.send(request("boss@example.com")).await.unwrap();
    let token = h.next_token().await;
    let consumed = h.consumer.consume(Some(&token)).await.unwrap();
    assert!(!consumed.created_account);
    let account = h.identity.find_by_email("boss@example.com").await.unwrap().unwrap();
    assert_eq!(account.role, Some(Role::Admin));

    h.issuer.send(request("new@example.com")).await.unwrap();
    let token = h.next_token().await;
    h.consumer.consume(Some(&token)).await.unwrap();
    let account = h.identity.find_by_email("new@example.com").await.unwrap().unwrap();
    assert_eq!(account.role, Some(Role::User));
}

#[tokio::test]
async fn waiter_resolves_when_link_is_clicked() {
    let h = Arc::new(Harness::new());
    h.issuer.send(request("a@example.com")).await.unwrap();
    let token = h.next_token().await;

    let waiting = {
        let h = h.clone();
        tokio::spawn(async move { h.waiter.wait("A@example.com").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let consumed = h.consumer.consume(Some(&token)).await.unwrap();
    let session = waiting.await.unwrap().unwrap();
    assert_eq!(session.uid, consumed.uid);
    assert_eq!(session.role, Some(Role::User));

    // the parked credential is consumed with the session
    assert!(h.credentials.get("a@example.com").unwrap().is_none());
}

#[tokio::test]
async fn waiter_picks_up_credential_published_before_it_started() {
    let h = Harness::new();
    h.issuer.send(request("a@example.com")).await.unwrap();
    let token = h.next_token().await;
    h.consumer.consume(Some(&token)).await.unwrap();

    let session = h.waiter.wait("a@example.com").await.unwrap();
    assert_eq!(session.email, "a@example.com");
}

#[tokio::test]
async fn uncollected_credential_does_not_end_a_later_wait() {
    let h = Arc::new(Harness::new());
    let three_hours_ago = Utc::now() - ChronoDuration::hours(3);
    h.issuer
        .send_at(request("a@example.com"), three_hours_ago)
        .await
        .unwrap();
    let token = h.next_token().await;
    h.consumer.consume_at(Some(&token), three_hours_ago).await.unwrap();
    assert!(h.credentials.get("a@example.com").unwrap().is_some());

    // nobody clicks again: the wait runs to its timeout instead of failing
    let err = h
        .waiter
        .clone()
        .with_timeout(Duration::from_millis(200))
        .wait("a@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::Timeout(_)));
    assert!(h.credentials.get("a@example.com").unwrap().is_none());
}

#[tokio::test]
async fn fresh_click_wins_over_an_uncollected_credential() {
    let h = Arc::new(Harness::new());
    let three_hours_ago = Utc::now() - ChronoDuration::hours(3);
    h.issuer
        .send_at(request("a@example.com"), three_hours_ago)
        .await
        .unwrap();
    let stale = h.next_token().await;
    h.consumer.consume_at(Some(&stale), three_hours_ago).await.unwrap();

    let waiting = {
        let h = h.clone();
        tokio::spawn(async move { h.waiter.wait("a@example.com").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.issuer.send(request("a@example.com")).await.unwrap();
    let token = h.next_token().await;
    h.consumer.consume(Some(&token)).await.unwrap();

    let session = waiting.await.unwrap().unwrap();
    assert_eq!(session.email, "a@example.com");
    assert!(session.expires_at > Utc::now());
}

#[tokio::test(start_paused = true)]
async fn waiter_times_out_when_nobody_clicks() {
    let h = Harness::new();
    let waiter = h.waiter.clone().with_timeout(Duration::from_secs(300));
    let err = waiter.wait("a@example.com").await.unwrap_err();
    assert!(matches!(err, WaitError::Timeout(d) if d == Duration::from_secs(300)));
}

#[tokio::test]
async fn login_requires_existing_account() {
    let h = Arc::new(Harness::new());

    let err = h.flows().login("ghost@example.com").await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Issue(MagicLinkError::AccountStateMismatch { expected_exists: true })
    ));

    let account = h.identity.create_user("a@example.com").await.unwrap();
    let login = {
        let h = h.clone();
        tokio::spawn(async move { h.flows().login("a@example.com").await })
    };
    let token = h.next_token().await;
    h.consumer.consume(Some(&token)).await.unwrap();

    let session = login.await.unwrap().unwrap();
    assert_eq!(session.uid, account.uid);
}

#[tokio::test]
async fn sign_up_stores_profile() {
    let h = Arc::new(Harness::new());
    let profile = UserProfile {
        first_name: Some("Ana".into()),
        last_name: Some("Ruiz".into()),
        phone: Some("+34 600 000 000".into()),
    };

    let sign_up = {
        let h = h.clone();
        let profile = profile.clone();
        tokio::spawn(async move { h.flows().sign_up("ana@example.com", profile).await })
    };
    let email = h.outbox.lock().await.recv().await.unwrap();
    assert!(email.text.as_deref().unwrap().starts_with("Hi Ana Ruiz,"));
    h.consumer.consume(Some(&token_from(&email))).await.unwrap();

    let (session, account) = sign_up.await.unwrap().unwrap();
    assert_eq!(session.uid, account.uid);
    assert_eq!(account.profile, Some(profile));

    // a second sign-up for the same address is refused
    let err = h.flows().sign_up("ana@example.com", UserProfile::default()).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Issue(MagicLinkError::AccountStateMismatch { expected_exists: false })
    ));
}
