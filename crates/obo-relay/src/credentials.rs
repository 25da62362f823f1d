//! Per-target credential resolution.
//!
//! [`CredentialResolver`] picks the credential for a target purely from the
//! target's configured [`AuthStrategy`]: delegated targets get a token from
//! the identity collaborator, shared-secret targets get their key from the
//! [`SecretStore`]. Credentials are resolved fresh for every request and are
//! never cached here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use obo_models::{AuthStrategy, CredentialKind, DownstreamTarget, TargetName};
use tracing::{debug, error, warn};

use crate::claims::VerifiedClaims;
use crate::error::{CredentialError, ExchangeError};
use crate::identity::{DelegatedToken, IdentityProvider};

/// Delay before the single retry of a transient exchange failure.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// SharedSecretKey / SecretStore
// ---------------------------------------------------------------------------

/// A static service key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecretKey(String);

impl SharedSecretKey {
    /// Wrap a key.
    pub fn new(key: &str) -> Self {
        Self(key.to_string())
    }

    /// The raw key, for the outbound header only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SharedSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecretKey(<redacted>)")
    }
}

/// Shared keys by target name, loaded once at startup.
#[derive(Clone, Default)]
pub struct SecretStore {
    keys: HashMap<TargetName, SharedSecretKey>,
}

impl SecretStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key for `target`. Blank keys are ignored.
    #[must_use]
    pub fn with_key(mut self, target: &str, key: &str) -> Self {
        if !key.trim().is_empty() {
            self.keys.insert(TargetName::new(target), SharedSecretKey::new(key));
        }
        self
    }

    /// Key for `target`, if one is configured.
    pub fn get(&self, target: &TargetName) -> Option<&SharedSecretKey> {
        self.keys.get(target)
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("targets", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// The credential attached to one downstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Token minted on behalf of the caller.
    Delegated(DelegatedToken),
    /// Static service key.
    SharedSecret(SharedSecretKey),
}

impl Credential {
    /// Tag exposed in results instead of the credential itself.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Delegated(_) => CredentialKind::Delegated,
            Self::SharedSecret(_) => CredentialKind::SharedSecret,
        }
    }
}

// ---------------------------------------------------------------------------
// CredentialResolver
// ---------------------------------------------------------------------------

/// Auth strategy selector.
#[derive(Clone)]
pub struct CredentialResolver {
    provider: Arc<dyn IdentityProvider>,
    secrets: SecretStore,
    retry_backoff: Duration,
}

impl CredentialResolver {
    /// Create a resolver using the default retry backoff.
    pub fn new(provider: Arc<dyn IdentityProvider>, secrets: SecretStore) -> Self {
        Self {
            provider,
            secrets,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Override the delay before retrying a transient exchange failure.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Produce the credential for `target`.
    ///
    /// # Errors
    ///
    /// [`CredentialError::Exchange`] when the delegated exchange fails (after
    /// one retry for transient failures), [`CredentialError::Misconfigured`]
    /// when a shared-secret target has no key.
    pub async fn resolve_credential(
        &self,
        target: &DownstreamTarget,
        claims: &VerifiedClaims,
        inbound_token: &str,
    ) -> Result<Credential, CredentialError> {
        match target.auth_strategy {
            AuthStrategy::Delegated => self
                .exchange(target, claims, inbound_token)
                .await
                .map(Credential::Delegated)
                .map_err(CredentialError::from),
            AuthStrategy::SharedSecret => self.shared_secret(target).map(Credential::SharedSecret),
        }
    }

    async fn exchange(
        &self,
        target: &DownstreamTarget,
        claims: &VerifiedClaims,
        inbound_token: &str,
    ) -> Result<DelegatedToken, ExchangeError> {
        debug!(target = %target.name, subject = %claims.subject_id(), scope = %target.required_scope, "exchanging token");

        match self.provider.exchange_token(inbound_token, &target.required_scope).await {
            Err(e) if e.is_retryable() => {
                warn!(target = %target.name, error = %e, backoff_ms = self.retry_backoff.as_millis(), "transient exchange failure, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.provider
                    .exchange_token(inbound_token, &target.required_scope)
                    .await
                    .inspect_err(|e| warn!(target = %target.name, error = %e, "exchange retry failed"))
            }
            Err(e) => {
                warn!(target = %target.name, kind = %e.kind, code = ?e.code, correlation_id = ?e.correlation_id, "token exchange refused");
                Err(e)
            }
            ok => ok,
        }
    }

    fn shared_secret(&self, target: &DownstreamTarget) -> Result<SharedSecretKey, CredentialError> {
        self.secrets.get(&target.name).cloned().ok_or_else(|| {
            error!(target = %target.name, "shared-secret target has no key configured");
            CredentialError::Misconfigured(target.name.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
