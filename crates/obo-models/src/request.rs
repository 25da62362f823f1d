//! Inbound request body.

use serde::{Deserialize, Serialize};

/// Query used when the caller sends none.
pub const MATCH_ALL_QUERY: &str = "*";

/// JSON body accepted by the relay's POST operations (e.g. `{"query": "lake"}`).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayRequest {
    /// Free-text search query.
    #[serde(default)]
    pub query: Option<String>,
}

impl RelayRequest {
    /// A request carrying `query`.
    pub fn with_query(query: &str) -> Self {
        Self {
            query: Some(query.to_string()),
        }
    }

    /// The effective query, falling back to [`MATCH_ALL_QUERY`] when absent
    /// or blank.
    pub fn query_or_default(&self) -> &str {
        match self.query.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q,
            _ => MATCH_ALL_QUERY,
        }
    }
}
