//! Token claims: unverified decoding for display, verified claims for
//! authorization.
//!
//! [`extract`] splits a compact JWT and reads its payload **without**
//! checking the signature. The result is an [`UnverifiedClaims`], which is
//! good for logging and display and nothing else: the relay's authorization
//! path only accepts [`VerifiedClaims`], and the only way to build one is
//! [`VerifiedClaims::verify`], which checks the signature. There is no
//! conversion between the two:
//!
//! ```compile_fail
//! use obo_relay::{VerifiedClaims, extract};
//!
//! let unverified = extract("e30.eyJvaWQiOiJhZG1pbiJ9.").unwrap();
//! let promoted = VerifiedClaims::attest(unverified.claims().clone());
//! ```

use std::collections::BTreeSet;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode};
use obo_models::ClaimsView;
use serde_json::{Map, Value};

use crate::error::ClaimsError;

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Identity facts read from a token payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Claims {
    /// `oid`, falling back to `sub`. Empty when neither is present.
    pub subject_id: String,
    /// `tid`.
    pub tenant_id: Option<String>,
    /// `groups`.
    pub group_ids: BTreeSet<String>,
    /// `exp`.
    pub expiry: Option<DateTime<Utc>>,
    /// `aud` (first entry when it is an array).
    pub audience: Option<String>,
    /// `iss`.
    pub issuer: Option<String>,
    /// `upn`, falling back to `preferred_username`.
    pub upn: Option<String>,
    /// `scp`.
    pub scopes: Option<String>,
    /// `appid`, falling back to `azp`.
    pub app_id: Option<String>,
    /// `roles`.
    pub roles: Vec<String>,
}

impl Claims {
    /// Read claims from a decoded payload. Claims of an unexpected JSON type
    /// are treated as absent.
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        let list = |key: &str| -> Vec<String> {
            payload
                .get(key)
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default()
        };

        let audience = match payload.get("aud") {
            Some(Value::String(aud)) => Some(aud.clone()),
            Some(Value::Array(auds)) => auds.iter().find_map(Value::as_str).map(str::to_string),
            _ => None,
        };

        let expiry = payload
            .get("exp")
            .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64)))
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        Self {
            subject_id: text("oid").or_else(|| text("sub")).unwrap_or_default(),
            tenant_id: text("tid"),
            group_ids: list("groups").into_iter().collect(),
            expiry,
            audience,
            issuer: text("iss"),
            upn: text("upn").or_else(|| text("preferred_username")),
            scopes: text("scp"),
            app_id: text("appid").or_else(|| text("azp")),
            roles: list("roles"),
        }
    }

    /// `true` when `exp` is present and strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|exp| exp < now)
    }
}

// ---------------------------------------------------------------------------
// UnverifiedClaims / VerifiedClaims
// ---------------------------------------------------------------------------

/// Claims whose signature has **not** been checked. Display and logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnverifiedClaims(Claims);

impl UnverifiedClaims {
    /// Borrow the decoded claims.
    pub fn claims(&self) -> &Claims {
        &self.0
    }
}

/// Claims of a token that the identity provider has verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims(Claims);

impl VerifiedClaims {
    /// Check `token` against `key` and `validation` (signature, expiry, and
    /// whatever audience and issuer rules `validation` carries) and read its
    /// claims.
    ///
    /// # Errors
    ///
    /// The `jsonwebtoken` error when any check fails.
    pub fn verify(token: &str, key: &DecodingKey, validation: &Validation) -> Result<Self, jsonwebtoken::errors::Error> {
        let data = decode::<Map<String, Value>>(token, key, validation)?;
        Ok(Self(Claims::from_payload(&data.claims)))
    }

    #[cfg(test)]
    pub(crate) fn attest(claims: Claims) -> Self {
        Self(claims)
    }

    /// Borrow the verified claims.
    pub fn claims(&self) -> &Claims {
        &self.0
    }

    /// Caller's subject id.
    pub fn subject_id(&self) -> &str {
        &self.0.subject_id
    }

    /// Caller's group memberships.
    pub fn group_ids(&self) -> &BTreeSet<String> {
        &self.0.group_ids
    }

    /// Redacted view for responses.
    pub fn to_view(&self) -> ClaimsView {
        let c = &self.0;
        ClaimsView {
            subject_id: c.subject_id.clone(),
            tenant_id: c.tenant_id.clone(),
            group_ids: c.group_ids.clone(),
            group_count: c.group_ids.len(),
            audience: c.audience.clone(),
            expires_at: c.expiry,
            upn: c.upn.clone(),
            issuer: c.issuer.clone(),
            scopes: c.scopes.clone(),
            app_id: c.app_id.clone(),
            roles: c.roles.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Decode `raw` without verifying its signature and reject it when expired.
///
/// # Errors
///
/// [`ClaimsError::Malformed`] when the token is not structurally decodable,
/// [`ClaimsError::Expired`] when `exp` is in the past.
pub fn extract(raw: &str) -> Result<UnverifiedClaims, ClaimsError> {
    extract_at(raw, Utc::now())
}

/// [`extract`] with an explicit clock.
///
/// # Errors
///
/// See [`extract`].
pub fn extract_at(raw: &str, now: DateTime<Utc>) -> Result<UnverifiedClaims, ClaimsError> {
    let claims = decode_unverified(raw)?;
    match claims.expiry {
        Some(exp) if exp < now => Err(ClaimsError::Expired(exp)),
        _ => Ok(UnverifiedClaims(claims)),
    }
}

/// Decode the payload of a compact JWT without any signature or expiry
/// check.
pub(crate) fn decode_unverified(raw: &str) -> Result<Claims, ClaimsError> {
    let segments: Vec<&str> = raw.trim().split('.').collect();
    let [header, payload, _signature] = segments.as_slice() else {
        return Err(ClaimsError::Malformed(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    };

    decode_segment(header, "header")?;
    let bytes = decode_segment(payload, "payload")?;

    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ClaimsError::Malformed(format!("payload is not JSON: {e}")))?;
    let Value::Object(map) = value else {
        return Err(ClaimsError::Malformed("payload is not a JSON object".into()));
    };

    Ok(Claims::from_payload(&map))
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, ClaimsError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| ClaimsError::Malformed(format!("{name} is not base64url: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
