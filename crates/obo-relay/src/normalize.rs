//! Response normalizer.

use std::collections::BTreeSet;

use obo_models::{DownstreamResult, OverallStatus, RelayResponse, TargetName};

use crate::claims::VerifiedClaims;

/// Assemble the unified response for `operation`.
///
/// Results keep their input order. The output depends only on the arguments.
pub fn normalize(
    operation: &str,
    claims: &VerifiedClaims,
    results: Vec<DownstreamResult>,
    required: &BTreeSet<TargetName>,
) -> RelayResponse {
    RelayResponse {
        operation: operation.to_string(),
        status: overall_status(&results, required),
        claims: claims.to_view(),
        results,
    }
}

/// `Success` when every target succeeded, `Failure` when a required target
/// did not, `PartialSuccess` otherwise.
pub fn overall_status(results: &[DownstreamResult], required: &BTreeSet<TargetName>) -> OverallStatus {
    let mut failed = results.iter().filter(|r| !r.status.is_success()).peekable();
    if failed.peek().is_none() {
        return OverallStatus::Success;
    }
    if failed.any(|r| required.contains(&r.target)) {
        OverallStatus::Failure
    } else {
        OverallStatus::PartialSuccess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obo_models::{CredentialKind, ErrorKind, ResultError, ResultStatus};
    use serde_json::json;

    use crate::test_support::verified;

    fn profile_ok() -> DownstreamResult {
        DownstreamResult::success(TargetName::new("profile"), CredentialKind::Delegated, json!({ "id": "u1" }))
    }

    fn search_rejected() -> DownstreamResult {
        DownstreamResult::failure(
            TargetName::new("search"),
            CredentialKind::SharedSecret,
            ResultStatus::AuthFailure,
            ResultError::new(ErrorKind::CredentialRejected, "search rejected the key").with_upstream(401, "denied"),
        )
    }

    fn required(names: &[&str]) -> BTreeSet<TargetName> {
        names.iter().map(|n| TargetName::new(n)).collect()
    }

    #[test]
    fn all_success() {
        let status = overall_status(&[profile_ok()], &required(&["profile"]));
        assert_eq!(status, OverallStatus::Success);
        assert_eq!(overall_status(&[], &required(&[])), OverallStatus::Success);
    }

    #[test]
    fn optional_failure_is_partial() {
        let response = normalize(
            "compare",
            &verified("u1", &["g1"]),
            vec![profile_ok(), search_rejected()],
            &required(&["profile"]),
        );
        assert_eq!(response.status, OverallStatus::PartialSuccess);
        let search = response.result(&TargetName::new("search")).unwrap();
        assert_eq!(search.status, ResultStatus::AuthFailure);
        assert_eq!(search.credential_kind, CredentialKind::SharedSecret);
    }

    #[test]
    fn required_failure_is_failure() {
        let status = overall_status(&[profile_ok(), search_rejected()], &required(&["search"]));
        assert_eq!(status, OverallStatus::Failure);
    }

    #[test]
    fn preserves_order_and_carries_claims() {
        let response = normalize(
            "hello",
            &verified("u1", &["g1", "g2"]),
            vec![search_rejected(), profile_ok()],
            &required(&[]),
        );
        let order: Vec<&str> = response.results.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(order, vec!["search", "profile"]);
        assert_eq!(response.operation, "hello");
        assert_eq!(response.claims.subject_id, "u1");
        assert_eq!(response.claims.group_count, 2);
    }

    #[test]
    fn is_deterministic_and_serialisable() {
        let build = || {
            normalize(
                "compare",
                &verified("u1", &["g1"]),
                vec![profile_ok(), search_rejected()],
                &required(&["profile"]),
            )
        };
        let first = build();
        assert_eq!(first, build());

        let json = serde_json::to_string(&first).unwrap();
        let back: RelayResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, first);
    }

    #[test]
    fn serialised_response_carries_no_credentials() {
        let response = normalize("hello", &verified("u1", &[]), vec![profile_ok()], &required(&["profile"]));
        let json = serde_json::to_value(&response).unwrap();
        let entry = &json["results"][0];
        assert_eq!(entry["credential_kind"], "delegated");
        assert!(entry.get("access_token").is_none());
        assert!(entry.get("credential").is_none());
    }
}
