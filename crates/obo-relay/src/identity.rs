//! The identity collaborator seam.
//!
//! Everything cryptographic (signature checks, token caching, replay
//! protection, the OBO grant itself) lives behind [`IdentityProvider`].
//! The relay only ever calls its two operations.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::claims::VerifiedClaims;
use crate::error::{ExchangeError, ValidationError};

/// A token minted for one downstream scope on behalf of the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegatedToken {
    /// The bearer token, forwarded to the resource as-is.
    pub access_token: String,
    /// When the token stops being accepted.
    pub expires_at: DateTime<Utc>,
    /// Scope the token was granted for.
    pub scope: String,
}

impl fmt::Debug for DelegatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// External identity collaborator.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify `token` and return its claims.
    async fn validate_token(&self, token: &str) -> Result<VerifiedClaims, ValidationError>;

    /// Exchange the caller's `token` for one scoped to `scope`.
    async fn exchange_token(&self, token: &str, scope: &str) -> Result<DelegatedToken, ExchangeError>;
}
