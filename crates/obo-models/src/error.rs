//! Error types for the `obo-models` crate.

/// Errors produced when constructing or validating model types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// An authentication strategy name was not recognised.
    #[error("invalid auth strategy \"{value}\": expected OBO or API_KEY")]
    InvalidAuthStrategy {
        /// The value that failed validation.
        value: String,
    },

    /// A downstream target definition is unusable.
    #[error("invalid downstream target \"{name}\": {reason}")]
    InvalidTarget {
        /// The target name.
        name: String,
        /// Human-readable explanation.
        reason: String,
    },
}
