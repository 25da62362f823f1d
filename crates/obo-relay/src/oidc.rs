//! OpenID Connect identity provider.
//!
//! Validates inbound tokens against the JWKS published by the authority and
//! performs the On-Behalf-Of grant against its token endpoint. Both URLs come
//! from the discovery document, fetched once by [`OidcIdentityProvider::discover`].

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode_header};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::claims::VerifiedClaims;
use crate::error::{ExchangeError, ExchangeErrorKind, ValidationError};
use crate::identity::{DelegatedToken, IdentityProvider};

/// `grant_type` of the On-Behalf-Of flow.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Error code the authority uses when consent for the scope is missing.
const CONSENT_ERROR_CODE: u64 = 65001;

/// Signature algorithms accepted on inbound tokens.
const ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection details for the authority.
#[derive(Clone)]
pub struct OidcSettings {
    /// Authority base URL; `/.well-known/openid-configuration` is appended.
    pub authority: String,
    /// This API's client id.
    pub client_id: String,
    /// This API's client secret, sent with every exchange.
    pub client_secret: String,
    /// Accepted `aud` values. Empty disables the audience check.
    pub audiences: Vec<String>,
}

impl std::fmt::Debug for OidcSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcSettings")
            .field("authority", &self.authority)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("audiences", &self.audiences)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error_codes: Vec<u64>,
    #[serde(default)]
    suberror: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// OidcIdentityProvider
// ---------------------------------------------------------------------------

/// [`IdentityProvider`] backed by an OIDC authority.
pub struct OidcIdentityProvider {
    http: reqwest::Client,
    settings: OidcSettings,
    issuer: Option<String>,
    token_endpoint: String,
    keys: JwkSet,
}

impl OidcIdentityProvider {
    /// Fetch the discovery document and the signing keys.
    ///
    /// Multi-tenant discovery documents publish a templated issuer
    /// (`{tenantid}`); the issuer check is skipped for those.
    ///
    /// # Errors
    ///
    /// [`ValidationError::Unavailable`] when either document cannot be
    /// fetched or parsed.
    pub async fn discover(http: reqwest::Client, settings: OidcSettings) -> Result<Self, ValidationError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            settings.authority.trim_end_matches('/')
        );
        let discovery: DiscoveryDocument = fetch_json(&http, &url).await?;
        let keys: JwkSet = fetch_json(&http, &discovery.jwks_uri).await?;

        info!(
            issuer = %discovery.issuer,
            token_endpoint = %discovery.token_endpoint,
            keys = keys.keys.len(),
            "identity provider discovered"
        );

        let issuer = (!discovery.issuer.contains('{')).then_some(discovery.issuer);
        Ok(Self {
            http,
            settings,
            issuer,
            token_endpoint: discovery.token_endpoint,
            keys,
        })
    }

    fn validation_for(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        if self.settings.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.settings.audiences);
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(http: &reqwest::Client, url: &str) -> Result<T, ValidationError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| ValidationError::Unavailable(format!("GET {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(ValidationError::Unavailable(format!("GET {url}: HTTP {}", response.status())));
    }
    response
        .json()
        .await
        .map_err(|e| ValidationError::Unavailable(format!("GET {url}: {e}")))
}

#[async_trait]
impl IdentityProvider for OidcIdentityProvider {
    async fn validate_token(&self, token: &str) -> Result<VerifiedClaims, ValidationError> {
        let header = decode_header(token).map_err(|e| ValidationError::Invalid(format!("header: {e}")))?;
        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(ValidationError::Invalid(format!("algorithm {:?} not accepted", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| ValidationError::Invalid("no key id in token header".into()))?;
        let jwk = self
            .keys
            .find(&kid)
            .ok_or_else(|| ValidationError::Invalid(format!("unknown signing key {kid}")))?;
        let key = DecodingKey::from_jwk(jwk).map_err(|e| ValidationError::Invalid(format!("signing key {kid}: {e}")))?;

        let claims = VerifiedClaims::verify(token, &key, &self.validation_for(header.alg)).map_err(|e| match e.kind() {
            JwtErrorKind::ExpiredSignature => ValidationError::Expired,
            _ => ValidationError::Invalid(e.to_string()),
        })?;

        debug!(subject = %claims.subject_id(), "token verified");
        Ok(claims)
    }

    async fn exchange_token(&self, token: &str, scope: &str) -> Result<DelegatedToken, ExchangeError> {
        let form = [
            ("grant_type", JWT_BEARER_GRANT),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("assertion", token),
            ("scope", scope),
            ("requested_token_use", "on_behalf_of"),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::transient(format!("token endpoint unreachable: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::transient(format!("token response interrupted: {e}")))?;

        if !status.is_success() {
            return Err(classify(status.as_u16(), &body));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::transient(format!("unreadable token response: {e}")))?;
        let lifetime = parsed
            .expires_in
            .as_ref()
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        Ok(DelegatedToken {
            access_token: parsed.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
            scope: parsed.scope.unwrap_or_else(|| scope.to_string()),
        })
    }
}

/// Classify a failed token-endpoint response.
pub fn classify(status: u16, body: &str) -> ExchangeError {
    let parsed: TokenErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error.as_deref().unwrap_or_default();
    let description = parsed.error_description.clone().unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.to_string()
        }
    });

    let consent = matches!(code, "consent_required" | "interaction_required")
        || parsed.suberror.as_deref() == Some("consent_required")
        || parsed.error_codes.contains(&CONSENT_ERROR_CODE)
        || description.contains("AADSTS65001");

    let kind = if consent {
        ExchangeErrorKind::ConsentRequired
    } else if code == "temporarily_unavailable" || status >= 500 || status == 429 {
        ExchangeErrorKind::TransientFailure
    } else {
        ExchangeErrorKind::PermissionDenied
    };

    ExchangeError {
        kind,
        code: parsed.error,
        description,
        correlation_id: parsed.correlation_id,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
