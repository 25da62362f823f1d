//! Downstream target configuration.
//!
//! A [`DownstreamTarget`] describes one resource the relay may call on the
//! caller's behalf: where it lives, which scope a delegated token must carry,
//! and which [`AuthStrategy`] produces its credential. Targets are built once
//! at startup and are read-only while requests are handled.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Per-call timeout applied when a target does not configure its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the shared key for [`AuthStrategy::SharedSecret`] targets.
pub const DEFAULT_SECRET_HEADER: &str = "api-key";

/// Header carrying the caller's delegated token verbatim so the resource can
/// apply query-time access control.
pub const IDENTITY_PROPAGATION_HEADER: &str = "x-ms-query-source-authorization";

// ---------------------------------------------------------------------------
// TargetName
// ---------------------------------------------------------------------------

/// Name of a downstream target (e.g. `"profile"`, `"search"`).
///
/// # Examples
///
/// ```
/// use obo_models::TargetName;
///
/// let name = TargetName::new("search");
/// assert_eq!(name.to_string(), "search");
///
/// let same: TargetName = "search".into();
/// assert_eq!(name, same);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetName(String);

impl TargetName {
    /// Create a new `TargetName` from a string slice.
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// Return the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TargetName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// AuthStrategy
// ---------------------------------------------------------------------------

/// How the credential for a target is obtained.
///
/// Parsing accepts both the canonical names and the deployment aliases
/// (`OBO`, `API_KEY`), case-insensitively.
///
/// ```
/// use obo_models::AuthStrategy;
///
/// assert_eq!("OBO".parse::<AuthStrategy>().unwrap(), AuthStrategy::Delegated);
/// assert_eq!("api_key".parse::<AuthStrategy>().unwrap(), AuthStrategy::SharedSecret);
/// assert_eq!(AuthStrategy::Delegated.to_string(), "delegated");
/// ```
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum AuthStrategy {
    /// Exchange the caller's token for a downstream-scoped token (On-Behalf-Of).
    #[strum(to_string = "delegated", serialize = "obo")]
    Delegated,
    /// Use a pre-provisioned service key with no per-user identity.
    #[strum(to_string = "shared_secret", serialize = "api_key")]
    SharedSecret,
}

impl AuthStrategy {
    /// Parse a strategy name, mapping failures to [`ModelError`].
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidAuthStrategy`] for unknown names.
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        Self::from_str(value.trim()).map_err(|_| ModelError::InvalidAuthStrategy {
            value: value.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// TargetKind
// ---------------------------------------------------------------------------

/// The resource shape behind a target, which fixes the request it receives
/// and how its response payload is reduced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    /// Directory profile of the caller (`GET {base}/me`).
    Profile,
    /// Group memberships of the caller (`GET {base}/me/memberOf`).
    Groups,
    /// Index search (`POST {base}/indexes/{index}/docs/search`).
    Search(SearchSettings),
}

/// Static query settings for a [`TargetKind::Search`] target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSettings {
    /// Index name.
    pub index: String,
    /// Value of the `api-version` query parameter.
    pub api_version: String,
    /// Maximum number of hits requested.
    pub top: u32,
    /// `queryType` sent with each search.
    pub query_type: String,
    /// `orderby` clause, if any.
    pub order_by: Option<String>,
    /// Comma-separated `select` list.
    pub select: String,
    /// When set, the relay builds a group filter on this collection field
    /// from the caller's verified groups.
    pub group_filter_field: Option<String>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            index: String::new(),
            api_version: "2025-11-01-preview".to_string(),
            top: 50,
            query_type: "simple".to_string(),
            order_by: Some("name asc".to_string()),
            select: "name,description,location,GroupIds,UserIds".to_string(),
            group_filter_field: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DownstreamTarget
// ---------------------------------------------------------------------------

/// A downstream resource reachable through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamTarget {
    /// Unique name, used in results and in operation definitions.
    pub name: TargetName,
    /// Base URL, without trailing slash.
    pub base_url: String,
    /// Scope requested when exchanging the caller's token.
    pub required_scope: String,
    /// How the credential for this target is produced.
    pub auth_strategy: AuthStrategy,
    /// Upper bound on one call to this target.
    pub timeout: Duration,
    /// Request/response shape.
    pub kind: TargetKind,
    /// Forward the delegated token in [`IDENTITY_PROPAGATION_HEADER`].
    pub propagate_identity: bool,
    /// Header name used for the shared key.
    pub secret_header: String,
}

impl DownstreamTarget {
    /// Create a target with the default timeout and secret header.
    pub fn new(name: &str, base_url: &str, kind: TargetKind, auth_strategy: AuthStrategy) -> Self {
        Self {
            name: TargetName::new(name),
            base_url: base_url.trim_end_matches('/').to_string(),
            required_scope: String::new(),
            auth_strategy,
            timeout: DEFAULT_TIMEOUT,
            kind,
            propagate_identity: false,
            secret_header: DEFAULT_SECRET_HEADER.to_string(),
        }
    }

    /// Set the scope requested during token exchange.
    #[must_use]
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.required_scope = scope.to_string();
        self
    }

    /// Override the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forward the delegated token for query-time access control.
    #[must_use]
    pub fn propagating_identity(mut self) -> Self {
        self.propagate_identity = true;
        self
    }

    /// Override the shared-key header name.
    #[must_use]
    pub fn with_secret_header(mut self, header: &str) -> Self {
        self.secret_header = header.to_string();
        self
    }

    /// Full URL of the call this target receives.
    pub fn endpoint(&self) -> String {
        match &self.kind {
            TargetKind::Profile => format!("{}/me", self.base_url),
            TargetKind::Groups => format!("{}/me/memberOf", self.base_url),
            TargetKind::Search(settings) => format!(
                "{}/indexes/{}/docs/search?api-version={}",
                self.base_url, settings.index, settings.api_version
            ),
        }
    }

    /// Check the definition is usable before any request is served.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidTarget`] when the base URL is not an
    /// HTTP(S) URL, a delegated target has no scope, or a search target has
    /// no index.
    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |reason: &str| ModelError::InvalidTarget {
            name: self.name.to_string(),
            reason: reason.to_string(),
        };

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(invalid("base URL must be an http(s) URL"));
        }
        if self.auth_strategy == AuthStrategy::Delegated && self.required_scope.is_empty() {
            return Err(invalid("delegated targets need a scope"));
        }
        if let TargetKind::Search(settings) = &self.kind {
            if settings.index.is_empty() {
                return Err(invalid("search index must not be empty"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
