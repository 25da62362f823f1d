//! HTTP routes.
//!
//! Each relay route pulls the caller's bearer token, hands it to
//! [`Relay::handle`] with the route's operation name, and returns the
//! [`RelayResponse`] as JSON.

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use obo_models::{RelayRequest, RelayResponse};
use obo_relay::{Relay, RelayError};
use serde_json::{Value, json};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info_span, warn};
use uuid::Uuid;

use crate::error::ApiError;

/// Correlation header set on every response.
pub const REQUEST_ID: &str = "x-request-id";

/// Build the router over `relay`, allowing browser calls from `cors_origins`.
pub fn router(relay: Relay, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/hello", get(hello))
        .route("/api/search", post(search))
        .route("/api/search-simple", post(search_simple))
        .route("/api/search-compare", post(search_compare))
        .with_state(relay)
        .layer(cors(cors_origins))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id))
}

fn cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter(|origin| {
            let wildcard = origin.as_str() == "*";
            if wildcard {
                warn!("ignoring wildcard CORS origin");
            }
            !wildcard
        })
        .filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|_| warn!(%origin, "ignoring invalid CORS origin"))
                .ok()
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .expose_headers([HeaderName::from_static(REQUEST_ID)])
        .allow_credentials(true)
}

/// Tag the request with an id (the caller's, or a fresh UUID), run it inside
/// a span carrying that id, and echo it on the response.
async fn request_id(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    let span = info_span!("request", request_id = %id, method = %request.method(), path = %request.uri().path());
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/health`
async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "message": "relay API is running" }))
}

/// `GET /api/hello`: profile and group memberships.
async fn hello(State(relay): State<Relay>, headers: HeaderMap) -> Result<Json<RelayResponse>, ApiError> {
    run(&relay, "hello", &headers, RelayRequest::default()).await
}

/// `POST /api/search`: search with the configured strategy.
async fn search(State(relay): State<Relay>, headers: HeaderMap, body: Bytes) -> Result<Json<RelayResponse>, ApiError> {
    run(&relay, "search", &headers, parse_body(&body)?).await
}

/// `POST /api/search-simple`: shared-key search filtered by the caller's groups.
async fn search_simple(
    State(relay): State<Relay>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RelayResponse>, ApiError> {
    run(&relay, "search-simple", &headers, parse_body(&body)?).await
}

/// `POST /api/search-compare`: both search strategies side by side.
async fn search_compare(
    State(relay): State<Relay>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RelayResponse>, ApiError> {
    run(&relay, "search-compare", &headers, parse_body(&body)?).await
}

async fn run(
    relay: &Relay,
    operation: &str,
    headers: &HeaderMap,
    request: RelayRequest,
) -> Result<Json<RelayResponse>, ApiError> {
    let token = bearer(headers)?;
    Ok(Json(relay.handle(operation, token, &request).await?))
}

/// The token from `Authorization: Bearer <token>`.
fn bearer(headers: &HeaderMap) -> Result<&str, RelayError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
        .ok_or(RelayError::MissingBearer)
}

/// An empty body means the default query.
fn parse_body(body: &Bytes) -> Result<RelayRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RelayRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum_test::TestServer;
    use chrono::Utc;
    use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, encode};
    use obo_models::{AuthStrategy, DownstreamTarget, OverallStatus, ResultStatus, SearchSettings, TargetKind};
    use obo_relay::{
        DelegatedToken, ExchangeError, IdentityProvider, Operation, SecretStore, ValidationError, VerifiedClaims,
    };
    use tokio_util::sync::CancellationToken;

    const SIGNING_SECRET: &[u8] = b"route-test-secret";

    fn signed_with(secret: &[u8], payload: &Value) -> String {
        encode(&Header::default(), payload, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn good_token() -> String {
        signed_with(
            SIGNING_SECRET,
            &json!({
                "oid": "user-1",
                "upn": "alice@example.com",
                "groups": ["g1"],
                "exp": Utc::now().timestamp() + 3600,
            }),
        )
    }

    /// Accepts HS256 tokens signed with [`SIGNING_SECRET`].
    struct StubProvider;

    #[async_trait]
    impl IdentityProvider for StubProvider {
        async fn validate_token(&self, token: &str) -> Result<VerifiedClaims, ValidationError> {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_aud = false;
            VerifiedClaims::verify(token, &DecodingKey::from_secret(SIGNING_SECRET), &validation)
                .map_err(|e| ValidationError::Invalid(e.to_string()))
        }

        async fn exchange_token(&self, _token: &str, scope: &str) -> Result<DelegatedToken, ExchangeError> {
            Ok(DelegatedToken {
                access_token: format!("obo-{scope}"),
                expires_at: Utc::now(),
                scope: scope.to_string(),
            })
        }
    }

    async fn downstream() -> String {
        let router = Router::new()
            .route("/me", get(|| async { Json(json!({ "id": "user-1", "displayName": "Alice" })) }))
            .route(
                "/me/memberOf",
                get(|| async { Json(json!({ "value": [{ "@odata.type": "#microsoft.graph.group", "id": "g1" }] })) }),
            )
            .route(
                "/indexes/docs/docs/search",
                post(|headers: HeaderMap| async move {
                    if headers.contains_key("api-key") {
                        (StatusCode::FORBIDDEN, "key lacks access").into_response()
                    } else {
                        Json(json!({ "value": [{ "name": "doc-1" }] })).into_response()
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        base
    }

    fn relay(base: &str) -> Relay {
        let search = |name: &str, strategy: AuthStrategy| {
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
        };
        Relay::new(
            Arc::new(StubProvider),
            SecretStore::new().with_key("search-key", "k-1"),
            reqwest::Client::new(),
            vec![
                DownstreamTarget::new("profile", base, TargetKind::Profile, AuthStrategy::Delegated).with_scope("User.Read"),
                DownstreamTarget::new("groups", base, TargetKind::Groups, AuthStrategy::Delegated).with_scope("User.Read"),
                search("search", AuthStrategy::Delegated).propagating_identity(),
                search("search-key", AuthStrategy::SharedSecret),
            ],
            vec![
                Operation::new("hello").require("profile").optional("groups"),
                Operation::new("search").require("search"),
                Operation::new("search-simple").require("search-key"),
                Operation::new("search-compare").optional("search").optional("search-key"),
            ],
        )
        .unwrap()
    }

    async fn server() -> TestServer {
        let base = downstream().await;
        TestServer::new(router(relay(&base), &["http://localhost:3000".to_string()])).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let server = server().await;
        let response = server.get("/api/health").await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["status"], "healthy");
        assert!(response.maybe_header("x-request-id").is_some());
    }

    #[tokio::test]
    async fn missing_bearer_is_401() {
        let server = server().await;
        let response = server.get("/api/hello").await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["error"], "missing or invalid Authorization header");

        let response = server
            .get("/api/hello")
            .add_header(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_signed_by_someone_else_is_401() {
        let server = server().await;
        let forged = signed_with(b"attacker", &json!({ "oid": "admin", "exp": Utc::now().timestamp() + 3600 }));
        let response = server.get("/api/hello").authorization_bearer(forged).await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert!(response.json::<Value>()["error"].as_str().unwrap().starts_with("token rejected: invalid token"));
    }

    #[tokio::test]
    async fn hello_returns_profile_and_groups() {
        let server = server().await;
        let response = server.get("/api/hello").authorization_bearer(good_token()).await;
        response.assert_status_ok();

        let body: RelayResponse = response.json();
        assert_eq!(body.operation, "hello");
        assert_eq!(body.status, OverallStatus::Success);
        assert_eq!(body.claims.subject_id, "user-1");
        assert_eq!(body.claims.upn.as_deref(), Some("alice@example.com"));
        assert_eq!(body.results[0].payload.as_ref().unwrap()["displayName"], "Alice");
        assert_eq!(body.results[1].payload.as_ref().unwrap()["group_ids"], json!(["g1"]));
    }

    #[tokio::test]
    async fn compare_reports_each_strategy() {
        let server = server().await;
        let response = server
            .post("/api/search-compare")
            .authorization_bearer(good_token())
            .json(&json!({ "query": "lake" }))
            .await;
        response.assert_status_ok();

        let body: RelayResponse = response.json();
        assert_eq!(body.status, OverallStatus::PartialSuccess);
        assert_eq!(body.results[0].status, ResultStatus::Success);
        assert_eq!(body.results[1].status, ResultStatus::AuthFailure);
        assert_eq!(body.results[1].error.as_ref().unwrap().upstream_status, Some(403));

        let raw = response.text();
        assert!(!raw.contains("k-1"));
        assert!(!raw.contains("obo-https://search.test"));
    }

    #[tokio::test]
    async fn search_accepts_empty_body_and_rejects_garbage() {
        let server = server().await;
        let response = server.post("/api/search").authorization_bearer(good_token()).await;
        response.assert_status_ok();

        let response = server
            .post("/api/search")
            .authorization_bearer(good_token())
            .bytes(Bytes::from_static(b"{not json"))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn request_id_is_echoed_or_generated() {
        let server = server().await;
        let response = server
            .get("/api/health")
            .add_header(HeaderName::from_static(REQUEST_ID), HeaderValue::from_static("req-42"))
            .await;
        assert_eq!(response.header("x-request-id"), "req-42");

        let generated = server.get("/api/health").await.header("x-request-id");
        assert!(Uuid::parse_str(generated.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn shutdown_returns_503() {
        let base = downstream().await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let server = TestServer::new(router(relay(&base).with_shutdown(shutdown), &[])).unwrap();

        let response = server.get("/api/hello").authorization_bearer(good_token()).await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn wildcard_origin_is_dropped_not_fatal() {
        let base = downstream().await;
        let server = TestServer::new(router(relay(&base), &["*".to_string()])).unwrap();
        server.get("/api/health").await.assert_status_ok();
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), Err(RelayError::MissingBearer));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  abc "));
        assert_eq!(bearer(&headers), Ok("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&headers), Err(RelayError::MissingBearer));
    }
}
