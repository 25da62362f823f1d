//! Relay error types.
//!
//! The taxonomy follows the request lifecycle: [`ClaimsError`] for the
//! unverified decoder, [`ValidationError`] and [`ExchangeError`] for the
//! identity collaborator, [`CredentialError`] for per-target credential
//! resolution, and [`RelayError`] for failures that abort a whole request.
//! Per-target failures never surface as [`RelayError`]; they become
//! [`obo_models::DownstreamResult`] entries instead.

use chrono::{DateTime, Utc};
use obo_models::{ErrorKind, ModelError, ResultError, TargetName};

/// Failure of the unverified claims decoder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimsError {
    /// Wrong segment count, invalid base64url, or a payload that is not a
    /// JSON object.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The `exp` claim lies in the past.
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Failure reported by the identity collaborator's `validate_token`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The token is past its expiry.
    #[error("token expired")]
    Expired,

    /// Signature, issuer, audience, or structure check failed.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// The identity provider could not be reached or answered garbage.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Class of a failed token exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExchangeErrorKind {
    /// The user or an administrator must consent to the downstream scope.
    ConsentRequired,
    /// The exchange is not permitted for this client, user, or scope.
    PermissionDenied,
    /// The identity provider failed in a way that may succeed on retry.
    TransientFailure,
}

/// Failure reported by the identity collaborator's `exchange_token`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("token exchange failed ({kind}): {description}")]
pub struct ExchangeError {
    /// Failure class.
    pub kind: ExchangeErrorKind,
    /// Protocol error code (e.g. `invalid_grant`), when the provider sent one.
    pub code: Option<String>,
    /// Provider-supplied description.
    pub description: String,
    /// Provider correlation id, for support tickets.
    pub correlation_id: Option<String>,
}

impl ExchangeError {
    /// Create an error of `kind` with a description and no code.
    pub fn new(kind: ExchangeErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            description: description.into(),
            correlation_id: None,
        }
    }

    /// Shorthand for a [`ExchangeErrorKind::TransientFailure`].
    pub fn transient(description: impl Into<String>) -> Self {
        Self::new(ExchangeErrorKind::TransientFailure, description)
    }

    /// Only transient failures may be retried; the others need human action.
    pub fn is_retryable(&self) -> bool {
        self.kind == ExchangeErrorKind::TransientFailure
    }

    /// Actionable guidance shown to the caller.
    pub fn guidance(&self) -> &'static str {
        match self.kind {
            ExchangeErrorKind::ConsentRequired => {
                "Consent is required for the downstream permission. Ask the user to sign in again \
                 and accept the requested permission, or have an administrator grant tenant-wide consent."
            }
            ExchangeErrorKind::PermissionDenied => {
                "The relay is not allowed to obtain this permission on the user's behalf. An \
                 administrator must add the permission to the API registration or assign the user access."
            }
            ExchangeErrorKind::TransientFailure => {
                "The identity provider is temporarily unavailable. Retry the request later."
            }
        }
    }
}

/// Failure to produce a credential for one target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The delegated exchange failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// A shared-secret target has no key configured. Deployment defect.
    #[error("no shared secret configured for target {0}")]
    Misconfigured(TargetName),
}

impl CredentialError {
    /// Outward-facing detail for the target's result entry.
    pub fn to_result_error(&self) -> ResultError {
        match self {
            Self::Exchange(e) => {
                let kind = match e.kind {
                    ExchangeErrorKind::ConsentRequired => ErrorKind::ConsentRequired,
                    ExchangeErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                    ExchangeErrorKind::TransientFailure => ErrorKind::TransientFailure,
                };
                ResultError::new(kind, e.to_string()).with_guidance(e.guidance())
            }
            Self::Misconfigured(_) => ResultError::new(ErrorKind::MisconfiguredCredential, self.to_string())
                .with_guidance("The service key for this resource is not configured. Contact the operator."),
        }
    }
}

/// Failures that abort a whole relay request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// No `Authorization: Bearer` header.
    #[error("missing or invalid Authorization header")]
    MissingBearer,

    /// The identity collaborator rejected the inbound token.
    #[error("token rejected: {0}")]
    Unauthorized(#[from] ValidationError),

    /// The operation name is not configured.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// An operation references a target that is not configured.
    #[error("operation {operation} references unknown target {target}")]
    UnknownTarget {
        /// Operation name.
        operation: String,
        /// Missing target.
        target: TargetName,
    },

    /// A target definition is unusable.
    #[error(transparent)]
    InvalidTarget(#[from] ModelError),

    /// The process is shutting down; in-flight calls were abandoned.
    #[error("request cancelled: relay is shutting down")]
    Cancelled,
}
