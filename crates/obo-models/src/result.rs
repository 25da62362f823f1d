//! Per-target call outcomes.
//!
//! One [`DownstreamResult`] is produced for every target an operation
//! touches, whether the call succeeded, was rejected, failed, timed out, or
//! never happened because no credential could be resolved.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::target::{AuthStrategy, TargetName};

// ---------------------------------------------------------------------------
// ResultStatus
// ---------------------------------------------------------------------------

/// Outcome class of one downstream call.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultStatus {
    /// The resource answered with a 2xx.
    Success,
    /// The credential was refused (401/403) or could not be obtained.
    AuthFailure,
    /// The resource answered with another non-2xx, or was unreachable.
    UpstreamError,
    /// The call did not finish within the target's timeout.
    Timeout,
}

impl ResultStatus {
    /// `true` for [`ResultStatus::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

// ---------------------------------------------------------------------------
// CredentialKind
// ---------------------------------------------------------------------------

/// Tag identifying which kind of credential a call used.
///
/// This is the only trace of the credential that reaches a response.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CredentialKind {
    /// A token minted on behalf of the caller.
    Delegated,
    /// A static service key.
    SharedSecret,
}

impl From<AuthStrategy> for CredentialKind {
    fn from(strategy: AuthStrategy) -> Self {
        match strategy {
            AuthStrategy::Delegated => Self::Delegated,
            AuthStrategy::SharedSecret => Self::SharedSecret,
        }
    }
}

// ---------------------------------------------------------------------------
// ResultError
// ---------------------------------------------------------------------------

/// Fine-grained reason behind a non-success [`DownstreamResult`].
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The caller (or an admin) must consent to the downstream scope.
    ConsentRequired,
    /// The relay or caller is not permitted to obtain the downstream scope.
    PermissionDenied,
    /// The identity provider failed transiently, even after a retry.
    TransientFailure,
    /// No shared key is configured for a shared-secret target.
    MisconfiguredCredential,
    /// The resource refused the credential (401/403).
    CredentialRejected,
    /// The resource answered with a non-2xx status.
    Upstream,
    /// The resource could not be reached or its body could not be read.
    Transport,
    /// The call exceeded the target's timeout.
    Timeout,
}

/// Diagnostic detail attached to a failed [`DownstreamResult`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResultError {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// HTTP status returned by the resource, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    /// Response body returned by the resource, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_body: Option<String>,
    /// Action the caller or an administrator should take.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl ResultError {
    /// Create an error with only a kind and a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_status: None,
            upstream_body: None,
            guidance: None,
        }
    }

    /// Attach the upstream status and body.
    #[must_use]
    pub fn with_upstream(mut self, status: u16, body: impl Into<String>) -> Self {
        self.upstream_status = Some(status);
        self.upstream_body = Some(body.into());
        self
    }

    /// Attach user-facing guidance.
    #[must_use]
    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = Some(guidance.into());
        self
    }
}

// ---------------------------------------------------------------------------
// DelegationInfo
// ---------------------------------------------------------------------------

/// Audit annotation describing a delegated token, decoded without
/// verification and kept for display only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DelegationInfo {
    /// Audience the delegated token was minted for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Scopes granted (`scp`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<String>,
    /// Whether the delegated token names the same subject as the caller.
    pub same_subject: bool,
}

// ---------------------------------------------------------------------------
// DownstreamResult
// ---------------------------------------------------------------------------

/// Outcome of one downstream call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DownstreamResult {
    /// Target this result belongs to.
    pub target: TargetName,
    /// Outcome class.
    pub status: ResultStatus,
    /// Kind of credential the call used (or would have used).
    pub credential_kind: CredentialKind,
    /// Reduced response payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Failure detail on non-success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    /// Delegated-token annotation, for delegated credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationInfo>,
    /// Wall-clock duration of the call in milliseconds.
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl DownstreamResult {
    /// A successful result carrying `payload`.
    pub fn success(target: TargetName, credential_kind: CredentialKind, payload: Value) -> Self {
        Self {
            target,
            status: ResultStatus::Success,
            credential_kind,
            payload: Some(payload),
            error: None,
            delegation: None,
            elapsed_ms: 0,
        }
    }

    /// A failed result with the given status and detail.
    pub fn failure(
        target: TargetName,
        credential_kind: CredentialKind,
        status: ResultStatus,
        error: ResultError,
    ) -> Self {
        Self {
            target,
            status,
            credential_kind,
            payload: None,
            error: Some(error),
            delegation: None,
            elapsed_ms: 0,
        }
    }

    /// Attach a delegated-token annotation.
    #[must_use]
    pub fn with_delegation(mut self, delegation: Option<DelegationInfo>) -> Self {
        self.delegation = delegation;
        self
    }

    /// Record the call duration.
    #[must_use]
    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
