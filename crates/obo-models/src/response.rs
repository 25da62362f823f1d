//! Response envelope returned to the caller.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::DownstreamResult;
use crate::target::TargetName;

/// Aggregate outcome of an operation.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverallStatus {
    /// Every target succeeded.
    Success,
    /// Only optional targets failed.
    PartialSuccess,
    /// At least one required target failed.
    Failure,
}

/// Redacted view of the caller's verified identity.
///
/// Carries identity facts only; the bearer token never appears here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ClaimsView {
    /// Object id of the caller (`oid`, falling back to `sub`).
    pub subject_id: String,
    /// Directory tenant (`tid`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Group memberships carried by the inbound token.
    #[serde(default)]
    pub group_ids: BTreeSet<String>,
    /// Number of groups.
    #[serde(default)]
    pub group_count: usize,
    /// Audience of the inbound token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Expiry of the inbound token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// User principal name, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
    /// Issuer (`iss`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Delegated scopes granted to the calling client (`scp`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<String>,
    /// Client application that obtained the token (`appid` or `azp`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// App roles assigned to the caller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// The unified response of one relay operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RelayResponse {
    /// Operation that produced this response (e.g. `"search"`).
    pub operation: String,
    /// Aggregate status.
    pub status: OverallStatus,
    /// Caller identity, redacted.
    pub claims: ClaimsView,
    /// One result per target, in declaration order.
    pub results: Vec<DownstreamResult>,
}

impl RelayResponse {
    /// Find the result for `target`.
    pub fn result(&self, target: &TargetName) -> Option<&DownstreamResult> {
        self.results.iter().find(|r| &r.target == target)
    }
}
