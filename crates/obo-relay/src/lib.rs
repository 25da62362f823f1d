//! # OBO Relay
//!
//! The delegated-access middle tier: accepts a caller's bearer token, calls
//! several downstream resources on the caller's behalf, and returns one
//! normalized response.
//!
//! The crate provides:
//!
//! * [`Relay`]: orchestrates one operation: validate, resolve credentials,
//!   dispatch, normalize.
//! * [`IdentityProvider`]: the identity seam (token validation and the
//!   On-Behalf-Of exchange), with [`OidcIdentityProvider`] as the
//!   production implementation.
//! * [`CredentialResolver`]: picks a delegated token or a shared key per
//!   target.
//! * [`Dispatcher`]: concurrent fan-out with per-target timeouts.
//! * [`extract`]: unverified claims decoding, for display and logging only.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use obo_models::{AuthStrategy, DownstreamTarget, RelayRequest, TargetKind};
//! use obo_relay::{OidcIdentityProvider, OidcSettings, Operation, Relay, SecretStore};
//!
//! # async fn run(token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let http = reqwest::Client::new();
//! let idp = OidcIdentityProvider::discover(http.clone(), OidcSettings {
//!     authority: "https://login.example.com/tenant/v2.0".into(),
//!     client_id: "relay".into(),
//!     client_secret: "secret".into(),
//!     audiences: vec!["api://relay".into()],
//! }).await?;
//!
//! let profile = DownstreamTarget::new("profile", "https://graph.example.com/v1.0", TargetKind::Profile, AuthStrategy::Delegated)
//!     .with_scope("https://graph.example.com/User.Read");
//! let relay = Relay::new(
//!     Arc::new(idp),
//!     SecretStore::new(),
//!     http,
//!     vec![profile],
//!     vec![Operation::new("hello").require("profile")],
//! )?;
//!
//! let response = relay.handle("hello", token, &RelayRequest::default()).await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod claims;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod normalize;
pub mod oidc;
pub mod payload;
pub mod relay;

#[cfg(test)]
mod test_support;

pub use claims::{Claims, UnverifiedClaims, VerifiedClaims, extract};
pub use credentials::{Credential, CredentialResolver, SecretStore, SharedSecretKey};
pub use dispatch::Dispatcher;
pub use error::{ClaimsError, CredentialError, ExchangeError, ExchangeErrorKind, RelayError, ValidationError};
pub use identity::{DelegatedToken, IdentityProvider};
pub use normalize::normalize;
pub use oidc::{OidcIdentityProvider, OidcSettings};
pub use relay::{Operation, Relay};
