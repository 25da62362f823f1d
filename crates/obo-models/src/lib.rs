#![deny(missing_docs)]

//! # OBO Models
//!
//! Core data types for the delegated-access relay: the static description
//! of each downstream resource, the per-call outcome, and the response
//! envelope returned to the SPA.
//!
//! ## Response hierarchy
//!
//! ```text
//! RelayResponse
//! ├── ClaimsView            (redacted caller identity)
//! ├── OverallStatus         (Success / PartialSuccess / Failure)
//! └── Vec<DownstreamResult> (declaration order)
//!     ├── ResultStatus
//!     ├── CredentialKind    (never the credential itself)
//!     └── payload | ResultError
//! ```
//!
//! ## Module layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`target`] | `TargetName`, `DownstreamTarget`, `AuthStrategy`, `TargetKind` |
//! | [`result`] | `DownstreamResult`, `ResultStatus`, `CredentialKind`, `ResultError` |
//! | [`response`] | `RelayResponse`, `OverallStatus`, `ClaimsView` |
//! | [`request`] | `RelayRequest` (inbound body) |

pub mod error;
pub mod request;
pub mod response;
pub mod result;
pub mod target;

// Re-export all public types at crate root for convenience.
pub use error::*;
pub use request::*;
pub use response::*;
pub use result::*;
pub use target::*;
