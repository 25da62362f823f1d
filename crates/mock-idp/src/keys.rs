//! Signing key generated on startup.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const KEY_ID: &str = "mock-key-1";

/// RSA key pair plus its public JWK.
pub struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Value,
}

impl SigningKeys {
    pub fn generate() -> anyhow::Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)?;
        let public = RsaPublicKey::from(&private);
        let pem = private.to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)?;

        let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());

        Ok(Self {
            encoding: EncodingKey::from_rsa_pem(pem.as_bytes())?,
            decoding: DecodingKey::from_rsa_components(&n, &e)?,
            jwk: json!({
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "kid": KEY_ID,
                "n": n,
                "e": e,
            }),
        })
    }

    pub fn jwks(&self) -> Value {
        json!({ "keys": [self.jwk.clone()] })
    }

    pub fn sign(&self, claims: &impl Serialize) -> Result<String, jsonwebtoken::errors::Error> {
        let header = Header {
            kid: Some(KEY_ID.to_string()),
            alg: Algorithm::RS256,
            ..Default::default()
        };
        encode(&header, claims, &self.encoding)
    }

    /// Verify a token this provider issued. Audience is left to the caller.
    pub fn verify(&self, token: &str, issuer: &str) -> Result<Map<String, Value>, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.validate_aud = false;
        decode::<Map<String, Value>>(token, &self.decoding, &validation).map(|data| data.claims)
    }
}
