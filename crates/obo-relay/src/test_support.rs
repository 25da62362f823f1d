//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use serde_json::{Value, json};

use crate::claims::{Claims, VerifiedClaims};
use crate::error::{ExchangeError, ValidationError};
use crate::identity::{DelegatedToken, IdentityProvider};

/// Build an unsigned compact token around `payload`.
pub(crate) fn token_with(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.sig")
}

/// Verified claims for `subject` with `groups`.
pub(crate) fn verified(subject: &str, groups: &[&str]) -> VerifiedClaims {
    VerifiedClaims::attest(Claims {
        subject_id: subject.to_string(),
        tenant_id: Some("tenant-1".into()),
        group_ids: groups.iter().map(|g| (*g).to_string()).collect(),
        audience: Some("api://relay".into()),
        ..Claims::default()
    })
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub(crate) async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Scripted identity provider that records its calls.
pub(crate) struct FakeProvider {
    validation: Result<VerifiedClaims, ValidationError>,
    failures: Mutex<VecDeque<ExchangeError>>,
    exchange_delay: std::time::Duration,
    scopes: Mutex<Vec<String>>,
    exchange_calls: AtomicUsize,
    validate_calls: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn accepting(claims: VerifiedClaims) -> Self {
        Self::with_validation(Ok(claims))
    }

    pub(crate) fn rejecting(error: ValidationError) -> Self {
        Self::with_validation(Err(error))
    }

    fn with_validation(validation: Result<VerifiedClaims, ValidationError>) -> Self {
        Self {
            validation,
            failures: Mutex::new(VecDeque::new()),
            exchange_delay: std::time::Duration::ZERO,
            scopes: Mutex::new(Vec::new()),
            exchange_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next exchanges with `failures`, in order; later ones succeed.
    pub(crate) fn with_exchange_failures(self, failures: Vec<ExchangeError>) -> Self {
        *self.failures.lock().unwrap() = failures.into();
        self
    }

    /// Delay every exchange by `delay`.
    pub(crate) fn with_exchange_delay(mut self, delay: std::time::Duration) -> Self {
        self.exchange_delay = delay;
        self
    }

    pub(crate) fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn exchanged_scopes(&self) -> Vec<String> {
        self.scopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn validate_token(&self, _token: &str) -> Result<VerifiedClaims, ValidationError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.validation.clone()
    }

    async fn exchange_token(&self, _token: &str, scope: &str) -> Result<DelegatedToken, ExchangeError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        self.scopes.lock().unwrap().push(scope.to_string());
        if !self.exchange_delay.is_zero() {
            tokio::time::sleep(self.exchange_delay).await;
        }
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }

        let subject = self
            .validation
            .as_ref()
            .map(|c| c.subject_id().to_string())
            .unwrap_or_default();
        Ok(DelegatedToken {
            access_token: token_with(&json!({ "oid": subject, "aud": scope, "scp": "user_impersonation" })),
            expires_at: Utc::now() + Duration::hours(1),
            scope: scope.to_string(),
        })
    }
}
