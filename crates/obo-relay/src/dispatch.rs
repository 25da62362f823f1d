//! Downstream dispatcher.
//!
//! Fans out one call per target on the shared HTTP client, waits for every
//! outcome, and returns the results in declaration order. Each call is
//! isolated: a failure, rejection or timeout becomes that target's
//! [`DownstreamResult`] and never affects the others. No retries happen here.

use std::collections::HashMap;
use std::time::Instant;

use futures::future::join_all;
use obo_models::{
    CredentialKind, DelegationInfo, DownstreamResult, DownstreamTarget, ErrorKind,
    IDENTITY_PROPAGATION_HEADER, RelayRequest, ResultError, ResultStatus, TargetName,
};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::claims::{VerifiedClaims, decode_unverified};
use crate::credentials::Credential;
use crate::identity::DelegatedToken;
use crate::payload::{RequestPlan, annotate_search, plan_request, shape_payload};

/// Upstream error bodies are echoed to the caller cut to this many bytes.
const MAX_UPSTREAM_BODY: usize = 4096;

/// Issues downstream calls over a shared connection pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
}

impl Dispatcher {
    /// Create a dispatcher over `http`. The client is cloned cheaply and its
    /// pool is shared by all requests.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Call every target concurrently and collect the outcomes in the order
    /// of `targets`.
    pub async fn dispatch(
        &self,
        targets: &[&DownstreamTarget],
        credentials: &HashMap<TargetName, Credential>,
        claims: &VerifiedClaims,
        request: &RelayRequest,
    ) -> Vec<DownstreamResult> {
        join_all(
            targets
                .iter()
                .map(|target| self.dispatch_one(target, credentials.get(&target.name), claims, request)),
        )
        .await
    }

    /// Call one target with its credential. A missing credential fails the
    /// target without a call.
    pub async fn dispatch_one(
        &self,
        target: &DownstreamTarget,
        credential: Option<&Credential>,
        claims: &VerifiedClaims,
        request: &RelayRequest,
    ) -> DownstreamResult {
        let started = Instant::now();
        let result = match credential {
            Some(credential) => self.call(target, credential, claims, request).await,
            None => DownstreamResult::failure(
                target.name.clone(),
                CredentialKind::from(target.auth_strategy),
                ResultStatus::AuthFailure,
                ResultError::new(ErrorKind::MisconfiguredCredential, "no credential resolved for target"),
            ),
        };
        let elapsed_ms = elapsed_ms(started);
        debug!(target = %target.name, status = %result.status, elapsed_ms, "downstream call finished");
        result.with_elapsed_ms(elapsed_ms)
    }

    async fn call(
        &self,
        target: &DownstreamTarget,
        credential: &Credential,
        claims: &VerifiedClaims,
        request: &RelayRequest,
    ) -> DownstreamResult {
        let kind = credential.kind();
        let delegation = match credential {
            Credential::Delegated(token) => delegation_info(token, claims),
            Credential::SharedSecret(_) => None,
        };

        let url = target.endpoint();
        let mut filter = None;
        let builder = match plan_request(target, claims.group_ids(), request) {
            RequestPlan::Skip(payload) => {
                debug!(target = %target.name, "empty authorization context, call skipped");
                return DownstreamResult::success(target.name.clone(), kind, payload).with_delegation(delegation);
            }
            RequestPlan::Get => self.http.get(&url),
            RequestPlan::Post(body) => {
                filter = body.get("filter").and_then(Value::as_str).map(str::to_string);
                self.http.post(&url).json(&body)
            }
        };

        let builder = match authorize(builder, target, credential) {
            Ok(builder) => builder,
            Err(detail) => {
                return DownstreamResult::failure(target.name.clone(), kind, ResultStatus::AuthFailure, detail);
            }
        };

        debug!(target = %target.name, %url, credential = %kind, "calling downstream");

        let result = match tokio::time::timeout(target.timeout, execute(builder)).await {
            Err(_) => timed_out(target, kind),
            Ok(Err(e)) if e.is_timeout() => timed_out(target, kind),
            Ok(Err(e)) => {
                warn!(target = %target.name, error = %e, "downstream unreachable");
                DownstreamResult::failure(
                    target.name.clone(),
                    kind,
                    ResultStatus::UpstreamError,
                    ResultError::new(ErrorKind::Transport, format!("failed to reach {}: {e}", target.name)),
                )
            }
            Ok(Ok((status, body))) => classify(target, kind, status, body),
        };

        let mut result = result.with_delegation(delegation);
        if let Some(payload) = result.payload.as_mut() {
            annotate_search(target, request, filter.as_deref(), payload);
        }
        result
    }
}

async fn execute(builder: RequestBuilder) -> Result<(StatusCode, String), reqwest::Error> {
    let response = builder.send().await?;
    let status = response.status();
    let body = response.text().await?;
    Ok((status, body))
}

/// Attach the credential, plus the caller's delegated token in the
/// propagation header when the target asks for it. Tokens are copied into
/// headers unchanged.
fn authorize(
    builder: RequestBuilder,
    target: &DownstreamTarget,
    credential: &Credential,
) -> Result<RequestBuilder, ResultError> {
    match credential {
        Credential::Delegated(token) => {
            let mut builder = builder.bearer_auth(&token.access_token);
            if target.propagate_identity {
                builder = builder.header(IDENTITY_PROPAGATION_HEADER, sensitive(&token.access_token)?);
            }
            Ok(builder)
        }
        Credential::SharedSecret(key) => {
            let name = HeaderName::from_bytes(target.secret_header.as_bytes()).map_err(|_| {
                ResultError::new(
                    ErrorKind::MisconfiguredCredential,
                    format!("invalid secret header name {:?}", target.secret_header),
                )
            })?;
            Ok(builder.header(name, sensitive(key.expose())?))
        }
    }
}

fn sensitive(raw: &str) -> Result<HeaderValue, ResultError> {
    let mut value = HeaderValue::from_str(raw).map_err(|_| {
        ResultError::new(ErrorKind::MisconfiguredCredential, "credential is not a valid header value")
    })?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn timed_out(target: &DownstreamTarget, kind: CredentialKind) -> DownstreamResult {
    warn!(target = %target.name, timeout_ms = target.timeout.as_millis(), "downstream call timed out");
    DownstreamResult::failure(
        target.name.clone(),
        kind,
        ResultStatus::Timeout,
        ResultError::new(ErrorKind::Timeout, format!("no response within {:?}", target.timeout)),
    )
}

fn classify(target: &DownstreamTarget, kind: CredentialKind, status: StatusCode, body: String) -> DownstreamResult {
    if status.is_success() {
        let value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or(Value::String(body))
        };
        return DownstreamResult::success(target.name.clone(), kind, shape_payload(&target.kind, &value));
    }

    let code = status.as_u16();
    warn!(target = %target.name, status = code, credential = %kind, "downstream returned an error");
    let body = truncated(body);

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        DownstreamResult::failure(
            target.name.clone(),
            kind,
            ResultStatus::AuthFailure,
            ResultError::new(
                ErrorKind::CredentialRejected,
                format!("{} rejected the {kind} credential", target.name),
            )
            .with_upstream(code, body)
            .with_guidance(rejection_guidance(status, kind)),
        )
    } else {
        DownstreamResult::failure(
            target.name.clone(),
            kind,
            ResultStatus::UpstreamError,
            ResultError::new(ErrorKind::Upstream, format!("{} returned HTTP {code}", target.name))
                .with_upstream(code, body),
        )
    }
}

fn truncated(mut body: String) -> String {
    if body.len() > MAX_UPSTREAM_BODY {
        let mut end = MAX_UPSTREAM_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("...[truncated]");
    }
    body
}

fn rejection_guidance(status: StatusCode, kind: CredentialKind) -> &'static str {
    match (status, kind) {
        (StatusCode::FORBIDDEN, CredentialKind::Delegated) => {
            "The signed-in user lacks a data-reader role on this resource. With delegated access \
             the user needs the role, not only the API's service principal."
        }
        (StatusCode::FORBIDDEN, CredentialKind::SharedSecret) => {
            "The configured service key does not grant access to this resource."
        }
        (_, CredentialKind::Delegated) => {
            "The resource did not accept the delegated token. Check the requested scope and audience."
        }
        (_, CredentialKind::SharedSecret) => "The resource did not accept the configured service key.",
    }
}

fn delegation_info(token: &DelegatedToken, claims: &VerifiedClaims) -> Option<DelegationInfo> {
    let decoded = decode_unverified(&token.access_token).ok()?;
    Some(DelegationInfo {
        same_subject: decoded.subject_id == claims.subject_id(),
        audience: decoded.audience,
        scopes: decoded.scopes,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::Utc;
    use obo_models::{AuthStrategy, SearchSettings, TargetKind};
    use serde_json::json;

    use crate::credentials::SharedSecretKey;
    use crate::test_support::{serve, token_with, verified};

    fn header(headers: &HeaderMap, name: &str) -> Value {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map_or(Value::Null, |v| Value::String(v.to_string()))
    }

    fn echo_router() -> Router {
        let echo = |headers: HeaderMap| async move {
            Json(json!({ "value": [{
                "authorization": header(&headers, "authorization"),
                "propagated": header(&headers, IDENTITY_PROPAGATION_HEADER),
                "api_key": header(&headers, "api-key"),
            }]}))
        };
        Router::new().route("/indexes/docs/docs/search", post(echo))
    }

    fn search(base: &str, name: &str, strategy: AuthStrategy) -> DownstreamTarget {
        DownstreamTarget::new(
            name,
            base,
            TargetKind::Search(SearchSettings {
                index: "docs".into(),
                ..SearchSettings::default()
            }),
            strategy,
        )
        .with_scope("https://search.test/.default")
    }

    fn profile(base: &str, name: &str) -> DownstreamTarget {
        DownstreamTarget::new(name, base, TargetKind::Profile, AuthStrategy::Delegated).with_scope("User.Read")
    }

    fn delegated(subject: &str) -> Credential {
        Credential::Delegated(DelegatedToken {
            access_token: token_with(&json!({ "oid": subject, "aud": "https://search.test", "scp": "user_impersonation" })),
            expires_at: Utc::now(),
            scope: "https://search.test/.default".into(),
        })
    }

    fn credentials(entries: &[(&DownstreamTarget, Credential)]) -> HashMap<TargetName, Credential> {
        entries.iter().map(|(t, c)| (t.name.clone(), c.clone())).collect()
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(reqwest::Client::new())
    }

    #[tokio::test]
    async fn delegated_token_is_propagated_verbatim() {
        let base = serve(echo_router()).await;
        let target = search(&base, "search", AuthStrategy::Delegated).propagating_identity();
        let credential = delegated("u1");
        let Credential::Delegated(ref token) = credential else { unreachable!() };
        let raw = token.access_token.clone();

        let results = dispatcher()
            .dispatch(&[&target], &credentials(&[(&target, credential)]), &verified("u1", &[]), &RelayRequest::default())
            .await;

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.credential_kind, CredentialKind::Delegated);
        let echoed = &result.payload.as_ref().unwrap()["results"][0];
        assert_eq!(echoed["authorization"], format!("Bearer {raw}"));
        assert_eq!(echoed["propagated"], raw);
        assert_eq!(echoed["api_key"], Value::Null);
        let security = &result.payload.as_ref().unwrap()["security_filtering"];
        assert_eq!(security["method"], "query_source_identity");

        let delegation = result.delegation.as_ref().unwrap();
        assert!(delegation.same_subject);
        assert_eq!(delegation.audience.as_deref(), Some("https://search.test"));
    }

    #[tokio::test]
    async fn propagation_header_is_opt_in() {
        let base = serve(echo_router()).await;
        let target = search(&base, "search", AuthStrategy::Delegated);

        let results = dispatcher()
            .dispatch(&[&target], &credentials(&[(&target, delegated("u1"))]), &verified("u1", &[]), &RelayRequest::default())
            .await;

        let echoed = &results[0].payload.as_ref().unwrap()["results"][0];
        assert_eq!(echoed["propagated"], Value::Null);
    }

    #[tokio::test]
    async fn shared_secret_uses_key_header_only() {
        let base = serve(echo_router()).await;
        let target = search(&base, "search-key", AuthStrategy::SharedSecret).propagating_identity();
        let credential = Credential::SharedSecret(SharedSecretKey::new("k-1"));

        let results = dispatcher()
            .dispatch(&[&target], &credentials(&[(&target, credential)]), &verified("u1", &[]), &RelayRequest::default())
            .await;

        let result = &results[0];
        assert_eq!(result.credential_kind, CredentialKind::SharedSecret);
        assert!(result.delegation.is_none());
        assert_eq!(result.payload.as_ref().unwrap()["security_filtering"]["method"], "credential_scope");
        let echoed = &result.payload.as_ref().unwrap()["results"][0];
        assert_eq!(echoed["api_key"], "k-1");
        assert_eq!(echoed["authorization"], Value::Null);
        assert_eq!(echoed["propagated"], Value::Null);
    }

    #[tokio::test]
    async fn large_error_bodies_are_truncated() {
        let router = Router::new().route(
            "/me",
            get(|| async { (axum::http::StatusCode::BAD_GATEWAY, "é".repeat(10_000)) }),
        );
        let base = serve(router).await;
        let target = profile(&base, "profile");

        let results = dispatcher()
            .dispatch(&[&target], &credentials(&[(&target, delegated("u1"))]), &verified("u1", &[]), &RelayRequest::default())
            .await;

        let error = results[0].error.as_ref().unwrap();
        assert_eq!(error.upstream_status, Some(502));
        let body = error.upstream_body.as_deref().unwrap();
        assert!(body.len() <= MAX_UPSTREAM_BODY + "...[truncated]".len());
        assert!(body.ends_with("...[truncated]"));
    }

    #[test]
    fn short_bodies_are_kept() {
        assert_eq!(truncated("boom".into()), "boom");
    }

    #[tokio::test]
    async fn rejections_and_errors_are_distinguished() {
        let router = Router::new()
            .route("/unauthorized/me", get(|| async { (axum::http::StatusCode::UNAUTHORIZED, "bad token") }))
            .route("/forbidden/me", get(|| async { (axum::http::StatusCode::FORBIDDEN, "no role") }))
            .route("/broken/me", get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
            .route("/missing/me", get(|| async { (axum::http::StatusCode::NOT_FOUND, "gone") }));
        let base = serve(router).await;

        let targets = [
            profile(&format!("{base}/unauthorized"), "unauthorized"),
            profile(&format!("{base}/forbidden"), "forbidden"),
            profile(&format!("{base}/broken"), "broken"),
            profile(&format!("{base}/missing"), "missing"),
        ];
        let refs: Vec<&DownstreamTarget> = targets.iter().collect();
        let creds: HashMap<_, _> = targets.iter().map(|t| (t.name.clone(), delegated("u1"))).collect();

        let results = dispatcher().dispatch(&refs, &creds, &verified("u1", &[]), &RelayRequest::default()).await;

        let statuses: Vec<ResultStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ResultStatus::AuthFailure,
                ResultStatus::AuthFailure,
                ResultStatus::UpstreamError,
                ResultStatus::UpstreamError,
            ]
        );

        let forbidden = results[1].error.as_ref().unwrap();
        assert_eq!(forbidden.kind, ErrorKind::CredentialRejected);
        assert_eq!(forbidden.upstream_status, Some(403));
        assert_eq!(forbidden.upstream_body.as_deref(), Some("no role"));
        assert!(forbidden.guidance.as_deref().unwrap().contains("data-reader"));

        let broken = results[2].error.as_ref().unwrap();
        assert_eq!(broken.kind, ErrorKind::Upstream);
        assert_eq!(broken.upstream_status, Some(500));
        assert_eq!(broken.upstream_body.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn one_timeout_does_not_stall_the_others() {
        let router = Router::new()
            .route("/fast-a/me", get(|| async { Json(json!({ "id": "a" })) }))
            .route(
                "/slow/me",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Json(json!({ "id": "slow" }))
                }),
            )
            .route("/fast-b/me", get(|| async { Json(json!({ "id": "b" })) }));
        let base = serve(router).await;

        let timeout = Duration::from_millis(300);
        let targets = [
            profile(&format!("{base}/fast-a"), "fast-a").with_timeout(timeout),
            profile(&format!("{base}/slow"), "slow").with_timeout(timeout),
            profile(&format!("{base}/fast-b"), "fast-b").with_timeout(timeout),
        ];
        let refs: Vec<&DownstreamTarget> = targets.iter().collect();
        let creds: HashMap<_, _> = targets.iter().map(|t| (t.name.clone(), delegated("u1"))).collect();

        let started = Instant::now();
        let results = dispatcher().dispatch(&refs, &creds, &verified("u1", &[]), &RelayRequest::default()).await;
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, ResultStatus::Success);
        assert_eq!(results[0].payload.as_ref().unwrap()["id"], "a");
        assert_eq!(results[1].status, ResultStatus::Timeout);
        assert_eq!(results[1].error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(results[2].status, ResultStatus::Success);
        assert_eq!(results[2].payload.as_ref().unwrap()["id"], "b");
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn results_follow_declaration_order_not_completion_order() {
        async fn delayed(ms: u64, id: &'static str) -> Json<Value> {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Json(json!({ "id": id }))
        }
        let router = Router::new()
            .route("/first/me", get(|| delayed(300, "first")))
            .route("/second/me", get(|| delayed(10, "second")))
            .route("/third/me", get(|| delayed(150, "third")));
        let base = serve(router).await;

        let targets = [
            profile(&format!("{base}/first"), "first"),
            profile(&format!("{base}/second"), "second"),
            profile(&format!("{base}/third"), "third"),
        ];
        let refs: Vec<&DownstreamTarget> = targets.iter().collect();
        let creds: HashMap<_, _> = targets.iter().map(|t| (t.name.clone(), delegated("u1"))).collect();

        let results = dispatcher().dispatch(&refs, &creds, &verified("u1", &[]), &RelayRequest::default()).await;

        let order: Vec<&str> = results.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        let ids: Vec<&Value> = results.iter().map(|r| &r.payload.as_ref().unwrap()["id"]).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn unreachable_target_is_upstream_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let target = profile(&format!("http://{addr}"), "offline");

        let results = dispatcher()
            .dispatch(&[&target], &credentials(&[(&target, delegated("u1"))]), &verified("u1", &[]), &RelayRequest::default())
            .await;

        assert_eq!(results[0].status, ResultStatus::UpstreamError);
        assert_eq!(results[0].error.as_ref().unwrap().kind, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn empty_group_context_skips_the_call() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/indexes/docs/docs/search",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "value": [{ "name": "everything" }] }))
                }
            }),
        );
        let base = serve(router).await;
        let mut target = search(&base, "search-key", AuthStrategy::SharedSecret);
        if let TargetKind::Search(settings) = &mut target.kind {
            settings.group_filter_field = Some("security_groups".into());
        }
        let creds = credentials(&[(&target, Credential::SharedSecret(SharedSecretKey::new("k")))]);

        let results = dispatcher().dispatch(&[&target], &creds, &verified("u1", &[]), &RelayRequest::default()).await;

        assert_eq!(results[0].status, ResultStatus::Success);
        assert_eq!(results[0].payload.as_ref().unwrap()["result_count"], 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let results = dispatcher().dispatch(&[&target], &creds, &verified("u1", &["g1"]), &RelayRequest::with_query("lake")).await;
        let payload = results[0].payload.as_ref().unwrap();
        assert_eq!(payload["result_count"], 1);
        assert_eq!(payload["search_query"], "lake");
        assert_eq!(payload["security_filtering"]["method"], "group_filter");
        assert_eq!(payload["security_filtering"]["filter_applied"], "security_groups/any(g: g eq 'g1')");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_credential_fails_only_that_target() {
        let base = serve(Router::new().route("/me", get(|| async { Json(json!({ "id": "u1" })) }))).await;
        let with = profile(&base, "with");
        let without = search(&base, "without", AuthStrategy::SharedSecret);

        let results = dispatcher()
            .dispatch(
                &[&with, &without],
                &credentials(&[(&with, delegated("u1"))]),
                &verified("u1", &[]),
                &RelayRequest::default(),
            )
            .await;

        assert_eq!(results[0].status, ResultStatus::Success);
        assert_eq!(results[1].status, ResultStatus::AuthFailure);
        assert_eq!(results[1].credential_kind, CredentialKind::SharedSecret);
        assert_eq!(results[1].error.as_ref().unwrap().kind, ErrorKind::MisconfiguredCredential);
    }
}
