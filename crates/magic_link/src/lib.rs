//! Passwordless sign-in over single-use emailed links.
//!
//! The handshake runs in four steps:
//! - [`MagicLinkIssuer`] stores a token and emails a link embedding it,
//! - [`LinkConsumer`] redeems the token once and parks a signed session
//!   credential under the user's email,
//! - [`LinkWaiter`] watches that location, claims the credential and
//!   exchanges it for a [`Session`], bounded by a timeout,
//! - [`AuthFlows`] strings the above together for login and sign-up.

mod consumer;
mod credentials;
mod error;
mod flows;
mod identity;
mod issuer;
mod session;
mod token;
mod waiter;

pub mod email;

pub use consumer::{ConsumedLink, LinkConsumer};
pub use credentials::{CredentialStore, ReadyCredential};
pub use error::{FlowError, MagicLinkError, WaitError};
pub use flows::AuthFlows;
pub use identity::{normalize_email, Account, IdentityProvider, Role, SledIdentityStore, UserProfile};
pub use issuer::{LinkSettings, MAX_EXPIRATION_MINUTES, MagicLinkIssuer, MagicLinkRequest, MagicLinkResponse, SendInfo};
pub use session::{Session, SessionClaims, SessionExchange, SessionIssuer};
pub use token::{MagicLinkToken, TokenStore};
pub use waiter::{LinkWaiter, DEFAULT_WAIT};
