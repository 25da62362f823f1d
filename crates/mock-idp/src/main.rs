//! Mock identity provider for local relay development.
//!
//! Serves, on one port:
//!
//! * OIDC discovery, JWKS, `/authorize` and `/token` (authorization code and
//!   the On-Behalf-Of `jwt-bearer` grant),
//! * a Graph stand-in (`/v1.0/me`, `/v1.0/me/memberOf`),
//! * a search stand-in (`/indexes/{index}/docs/search`) accepting either a
//!   delegated token with query-time access control or the shared key.
//!
//! The authorization code is the login of one of the canned users
//! (`alice`, `bob`, `carol`).

mod directory;
mod keys;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::directory::{User, TENANT_ID};
use crate::keys::SigningKeys;

const GRAPH_RESOURCE: &str = "https://graph.microsoft.com";
const SEARCH_RESOURCE: &str = "https://search.azure.com";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Mock identity provider, Graph and search service.
#[derive(Parser, Debug)]
#[command(name = "mock-idp", about = "Mock identity provider for the relay")]
struct Args {
    /// Listen port.
    #[arg(long, default_value_t = 4000)]
    port: u16,
    /// Public base URL, used as the issuer. Defaults to `http://localhost:{port}`.
    #[arg(long)]
    issuer: Option<String>,
    /// Client id of the relay API.
    #[arg(long, default_value = "obo-relay")]
    client_id: String,
    /// Client secret of the relay API.
    #[arg(long, default_value = "obo-relay-dev-secret")]
    client_secret: String,
    /// Shared search key.
    #[arg(long, default_value = "mock-search-key")]
    search_key: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

struct AppState {
    keys: SigningKeys,
    issuer: String,
    client_id: String,
    client_secret: String,
    search_key: String,
}

impl AppState {
    fn api_audience(&self) -> String {
        format!("api://{}", self.client_id)
    }

    /// Verify a bearer token this provider issued for `resource`.
    fn authenticate(&self, token: &str, resource: &str) -> Result<(Map<String, Value>, &'static User), Response> {
        let claims = self
            .keys
            .verify(token, &self.issuer)
            .map_err(|e| graph_error(StatusCode::UNAUTHORIZED, "InvalidAuthenticationToken", &e.to_string()))?;
        if claims.get("aud").and_then(Value::as_str) != Some(resource) {
            return Err(graph_error(
                StatusCode::UNAUTHORIZED,
                "InvalidAuthenticationToken",
                &format!("audience must be {resource}"),
            ));
        }
        let user = claims
            .get("oid")
            .and_then(Value::as_str)
            .and_then(directory::user_by_oid)
            .ok_or_else(|| graph_error(StatusCode::UNAUTHORIZED, "InvalidAuthenticationToken", "unknown user"))?;
        Ok((claims, user))
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("generating RSA-2048 signing key");
    let state = Arc::new(AppState {
        keys: SigningKeys::generate()?,
        issuer: args.issuer.unwrap_or_else(|| format!("http://localhost:{}", args.port)),
        client_id: args.client_id,
        client_secret: args.client_secret,
        search_key: args.search_key,
    });
    let issuer = state.issuer.clone();

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(issuer = %issuer, "mock identity provider listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route("/jwks", get(jwks))
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/v1.0/me", get(me))
        .route("/v1.0/me/memberOf", get(member_of))
        .route("/indexes/{index}/docs/search", post(search))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// OIDC endpoints
// ---------------------------------------------------------------------------

async fn openid_configuration(State(state): State<Arc<AppState>>) -> Json<Value> {
    let base = &state.issuer;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "jwks_uri": format!("{base}/jwks"),
        "response_types_supported": ["code"],
        "subject_types_supported": ["pairwise"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "grant_types_supported": ["authorization_code", JWT_BEARER_GRANT],
    }))
}

async fn jwks(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.keys.jwks())
}

#[derive(Deserialize)]
struct AuthorizeParams {
    redirect_uri: String,
    state: Option<String>,
    login_hint: Option<String>,
}

/// Auto-approve and redirect with the user's login as the code.
async fn authorize(Query(params): Query<AuthorizeParams>) -> Redirect {
    let code = params.login_hint.as_deref().unwrap_or("alice");
    let separator = if params.redirect_uri.contains('?') { '&' } else { '?' };
    let target = format!(
        "{}{separator}code={code}&state={}",
        params.redirect_uri,
        params.state.unwrap_or_default()
    );
    info!(code, "authorize request approved");
    Redirect::to(&target)
}

async fn token(State(state): State<Arc<AppState>>, Form(form): Form<HashMap<String, String>>) -> Response {
    let field = |key: &str| form.get(key).map(String::as_str).unwrap_or_default();
    match field("grant_type") {
        JWT_BEARER_GRANT => on_behalf_of(&state, field("client_id"), field("client_secret"), field("assertion"), field("scope")),
        "authorization_code" | "" => user_token(&state, field("code")),
        other => token_error(StatusCode::BAD_REQUEST, "unsupported_grant_type", &format!("grant {other} is not supported"), &[]),
    }
}

/// Token for the SPA, audience = the relay API, carrying group claims.
fn user_token(state: &AppState, code: &str) -> Response {
    let Some(user) = directory::user_by_login(code) else {
        return token_error(StatusCode::BAD_REQUEST, "invalid_grant", "AADSTS70000: unknown authorization code", &[70000]);
    };

    let now = Utc::now();
    let claims = json!({
        "iss": state.issuer,
        "aud": state.api_audience(),
        "oid": user.oid,
        "sub": user.oid,
        "tid": TENANT_ID,
        "upn": user.upn(),
        "name": user.name,
        "groups": user.groups,
        "scp": "access_as_user",
        "appid": "spa-client",
        "iat": now.timestamp(),
        "nbf": now.timestamp(),
        "exp": (now + Duration::hours(1)).timestamp(),
    });
    info!(user = user.login, "user token issued");
    signed(state, &claims, "access_as_user")
}

fn on_behalf_of(state: &AppState, client_id: &str, client_secret: &str, assertion: &str, scope: &str) -> Response {
    if client_id != state.client_id || client_secret != state.client_secret {
        return token_error(StatusCode::UNAUTHORIZED, "invalid_client", "AADSTS7000215: invalid client secret", &[7_000_215]);
    }

    let inbound = match state.keys.verify(assertion, &state.issuer) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "OBO assertion rejected");
            return token_error(StatusCode::BAD_REQUEST, "invalid_grant", &format!("AADSTS50013: assertion failed validation: {e}"), &[50013]);
        }
    };
    if inbound.get("aud").and_then(Value::as_str) != Some(state.api_audience().as_str()) {
        return token_error(StatusCode::BAD_REQUEST, "invalid_grant", "AADSTS50013: assertion audience does not match the client", &[50013]);
    }
    let Some(user) = inbound.get("oid").and_then(Value::as_str).and_then(directory::user_by_oid) else {
        return token_error(StatusCode::BAD_REQUEST, "invalid_grant", "AADSTS50034: user not found", &[50034]);
    };

    let Some((resource, permission)) = split_scope(scope) else {
        return token_error(StatusCode::BAD_REQUEST, "invalid_scope", &format!("AADSTS70011: scope {scope:?} is not valid"), &[70011]);
    };
    if !user.consented {
        warn!(user = user.login, scope, "consent missing");
        return token_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "AADSTS65001: The user or administrator has not consented to use the application.",
            &[65001],
        );
    }

    let now = Utc::now();
    let claims = json!({
        "iss": state.issuer,
        "aud": resource,
        "oid": user.oid,
        "sub": user.oid,
        "tid": TENANT_ID,
        "upn": user.upn(),
        "groups": user.groups,
        "scp": permission,
        "appid": state.client_id,
        "iat": now.timestamp(),
        "nbf": now.timestamp(),
        "exp": (now + Duration::hours(1)).timestamp(),
    });
    info!(user = user.login, resource, "on-behalf-of token issued");
    signed(state, &claims, scope)
}

/// `https://graph.microsoft.com/User.Read` → (`https://graph.microsoft.com`, `User.Read`);
/// `.default` maps to `user_impersonation`.
fn split_scope(scope: &str) -> Option<(&str, &str)> {
    let (resource, permission) = scope.split_whitespace().next()?.rsplit_once('/')?;
    if !resource.contains("://") || permission.is_empty() {
        return None;
    }
    let permission = if permission == ".default" { "user_impersonation" } else { permission };
    Some((resource, permission))
}

fn signed(state: &AppState, claims: &Value, scope: &str) -> Response {
    match state.keys.sign(claims) {
        Ok(access_token) => Json(json!({
            "token_type": "Bearer",
            "access_token": access_token,
            "expires_in": 3599,
            "scope": scope,
        }))
        .into_response(),
        Err(e) => token_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", &e.to_string(), &[]),
    }
}

fn token_error(status: StatusCode, error: &str, description: &str, codes: &[u64]) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "error_description": description,
            "error_codes": codes,
            "timestamp": Utc::now().to_rfc3339(),
            "trace_id": uuid::Uuid::new_v4().to_string(),
            "correlation_id": uuid::Uuid::new_v4().to_string(),
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Graph stand-in
// ---------------------------------------------------------------------------

fn bearer(headers: &HeaderMap) -> Result<&str, Response> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| graph_error(StatusCode::UNAUTHORIZED, "InvalidAuthenticationToken", "Access token is empty."))
}

fn graph_error(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
}

async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match bearer(&headers).and_then(|t| state.authenticate(t, GRAPH_RESOURCE)) {
        Ok((_, user)) => user,
        Err(response) => return response,
    };
    Json(json!({
        "@odata.context": format!("{GRAPH_RESOURCE}/v1.0/$metadata#users/$entity"),
        "id": user.oid,
        "displayName": user.name,
        "userPrincipalName": user.upn(),
        "jobTitle": user.job_title,
        "mail": user.upn(),
    }))
    .into_response()
}

async fn member_of(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match bearer(&headers).and_then(|t| state.authenticate(t, GRAPH_RESOURCE)) {
        Ok((_, user)) => user,
        Err(response) => return response,
    };
    let mut value: Vec<Value> = user
        .groups
        .iter()
        .map(|id| json!({ "@odata.type": "#microsoft.graph.group", "id": id, "displayName": id }))
        .collect();
    value.push(json!({ "@odata.type": "#microsoft.graph.directoryRole", "id": "role-directory-readers" }));
    Json(json!({ "value": value })).into_response()
}

// ---------------------------------------------------------------------------
// Search stand-in
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchBody {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    top: Option<usize>,
}

/// With the shared key, `filter` decides visibility. With a delegated token,
/// visibility comes from the groups of the token in
/// `x-ms-query-source-authorization`.
async fn search(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Response {
    let groups: Option<Vec<String>> = if let Some(key) = headers.get("api-key") {
        if key.as_bytes() != state.search_key.as_bytes() {
            return graph_error(StatusCode::FORBIDDEN, "Forbidden", "Invalid api-key.");
        }
        body.filter.as_deref().map(directory::quoted_values)
    } else {
        let user = match bearer(&headers).and_then(|t| state.authenticate(t, SEARCH_RESOURCE)) {
            Ok((_, user)) => user,
            Err(response) => return response,
        };
        if !user.search_reader {
            return graph_error(
                StatusCode::FORBIDDEN,
                "Forbidden",
                "Authorization failed: the caller is not assigned a data reader role on this index.",
            );
        }
        let Some(source) = headers.get("x-ms-query-source-authorization").and_then(|v| v.to_str().ok()) else {
            return graph_error(StatusCode::BAD_REQUEST, "MissingHeader", "x-ms-query-source-authorization is required.");
        };
        match state.authenticate(source, SEARCH_RESOURCE) {
            Ok((claims, _)) => Some(
                claims
                    .get("groups")
                    .and_then(Value::as_array)
                    .map(|g| g.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
            ),
            Err(response) => return response,
        }
    };

    let results = directory::search(body.search.as_deref().unwrap_or("*"), groups.as_deref(), body.top.unwrap_or(50));
    info!(index, hits = results.len(), "search served");
    Json(json!({ "@odata.count": results.len(), "value": results })).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
