//! Relay orchestrator.
//!
//! [`Relay::handle`] runs one inbound operation end to end: validate the
//! caller's token, then for every target concurrently resolve its credential
//! and call it, and normalize everything into a [`RelayResponse`].
//! Validation failures abort before any downstream traffic; every later
//! failure is confined to its target's result.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use obo_models::{
    CredentialKind, DownstreamResult, DownstreamTarget, RelayRequest, RelayResponse, ResultStatus, TargetName,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::claims::{self, VerifiedClaims};
use crate::credentials::{CredentialResolver, SecretStore};
use crate::dispatch::{Dispatcher, elapsed_ms, timed_out};
use crate::error::{ClaimsError, RelayError, ValidationError};
use crate::identity::IdentityProvider;
use crate::normalize::normalize;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A named inbound operation and the targets it fans out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Operation name, echoed in the response.
    pub name: String,
    /// Targets in declaration order.
    pub targets: Vec<TargetName>,
    /// Targets whose failure makes the whole operation fail.
    pub required: BTreeSet<TargetName>,
}

impl Operation {
    /// An operation with no targets yet.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            targets: Vec::new(),
            required: BTreeSet::new(),
        }
    }

    /// Append a target whose failure fails the operation.
    #[must_use]
    pub fn require(mut self, target: &str) -> Self {
        self.required.insert(TargetName::new(target));
        self.add(target)
    }

    /// Append a target whose failure only degrades the operation.
    #[must_use]
    pub fn optional(self, target: &str) -> Self {
        self.add(target)
    }

    fn add(mut self, target: &str) -> Self {
        let name = TargetName::new(target);
        if !self.targets.contains(&name) {
            self.targets.push(name);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Shared, read-only request handler. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    provider: Arc<dyn IdentityProvider>,
    resolver: CredentialResolver,
    dispatcher: Dispatcher,
    targets: Arc<HashMap<TargetName, DownstreamTarget>>,
    operations: Arc<HashMap<String, Operation>>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Build a relay over validated targets and operations.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidTarget`] when a target definition is unusable,
    /// [`RelayError::UnknownTarget`] when an operation names a target that
    /// is not defined.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        secrets: SecretStore,
        http: reqwest::Client,
        targets: Vec<DownstreamTarget>,
        operations: Vec<Operation>,
    ) -> Result<Self, RelayError> {
        let mut by_name = HashMap::new();
        for target in targets {
            target.validate()?;
            by_name.insert(target.name.clone(), target);
        }

        let mut ops = HashMap::new();
        for operation in operations {
            if let Some(missing) = operation.targets.iter().find(|t| !by_name.contains_key(*t)) {
                return Err(RelayError::UnknownTarget {
                    operation: operation.name.clone(),
                    target: missing.clone(),
                });
            }
            ops.insert(operation.name.clone(), operation);
        }

        Ok(Self {
            resolver: CredentialResolver::new(provider.clone(), secrets),
            provider,
            dispatcher: Dispatcher::new(http),
            targets: Arc::new(by_name),
            operations: Arc::new(ops),
            shutdown: CancellationToken::new(),
        })
    }

    /// Override the delay before retrying a transient exchange failure.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.resolver = self.resolver.with_retry_backoff(backoff);
        self
    }

    /// Abort in-flight requests when `token` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// The operation named `name`, if configured.
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    /// Run `operation` for the caller presenting `raw_token`.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownOperation`], [`RelayError::Unauthorized`] when
    /// the token does not validate, [`RelayError::Cancelled`] on shutdown.
    /// Downstream failures are reported inside the response, not here.
    pub async fn handle(
        &self,
        operation: &str,
        raw_token: &str,
        request: &RelayRequest,
    ) -> Result<RelayResponse, RelayError> {
        let op = self
            .operations
            .get(operation)
            .ok_or_else(|| RelayError::UnknownOperation(operation.to_string()))?;

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => {
                warn!(operation, "relay shutting down, request abandoned");
                Err(RelayError::Cancelled)
            }
            response = self.run(op, raw_token, request) => response,
        }
    }

    async fn run(&self, op: &Operation, raw_token: &str, request: &RelayRequest) -> Result<RelayResponse, RelayError> {
        let claims = self.authenticate(raw_token).await?;

        let targets = op.targets.iter().filter_map(|name| self.targets.get(name));
        let results: Vec<DownstreamResult> = join_all(
            targets.map(|target| self.serve_target(target, &claims, raw_token, request)),
        )
        .await;

        let response = normalize(&op.name, &claims, results, &op.required);
        info!(
            operation = %op.name,
            subject = %claims.subject_id(),
            status = %response.status,
            targets = response.results.len(),
            "operation complete"
        );
        Ok(response)
    }

    /// Resolve the credential for `target` and call it. The target's timeout
    /// bounds both steps, so a slow exchange only delays its own target.
    async fn serve_target(
        &self,
        target: &DownstreamTarget,
        claims: &VerifiedClaims,
        raw_token: &str,
        request: &RelayRequest,
    ) -> DownstreamResult {
        let started = Instant::now();
        let work = async {
            match self.resolver.resolve_credential(target, claims, raw_token).await {
                Ok(credential) => {
                    self.dispatcher
                        .dispatch_one(target, Some(&credential), claims, request)
                        .await
                }
                Err(e) => DownstreamResult::failure(
                    target.name.clone(),
                    CredentialKind::from(target.auth_strategy),
                    ResultStatus::AuthFailure,
                    e.to_result_error(),
                ),
            }
        };

        let result = match tokio::time::timeout(target.timeout, work).await {
            Ok(result) => result,
            Err(_) => timed_out(target, CredentialKind::from(target.auth_strategy)),
        };
        result.with_elapsed_ms(elapsed_ms(started))
    }

    /// Reject structurally broken or expired tokens locally, then have the
    /// identity provider verify the rest.
    async fn authenticate(&self, raw_token: &str) -> Result<VerifiedClaims, RelayError> {
        match claims::extract(raw_token) {
            Ok(unverified) => {
                debug!(subject = %unverified.claims().subject_id, "inbound token decoded");
            }
            Err(ClaimsError::Expired(at)) => {
                warn!(expired_at = %at, "inbound token expired");
                return Err(ValidationError::Expired.into());
            }
            Err(ClaimsError::Malformed(reason)) => {
                warn!(%reason, "inbound token malformed");
                return Err(ValidationError::Invalid(reason).into());
            }
        }

        self.provider
            .validate_token(raw_token)
            .await
            .inspect_err(|e| warn!(error = %e, "inbound token rejected"))
            .map_err(RelayError::from)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
