//! Test-only helpers for minting signed JWTs.
//!
//! Real deployments verify RS256 tokens against Azure AD's published keys;
//! tests mint EdDSA tokens from a fresh Ed25519 keypair instead, which needs
//! no key files and no network. The verifier accepts any asymmetric
//! algorithm, so the verification paths under test are identical.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{Json, Router, routing::get};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rand_core::OsRng;
use serde_json::{Value, json};

use super::verifier::{SigningKeySource, VerifyError};

/// A fake identity provider: one Ed25519 keypair with a fixed `kid`.
pub(crate) struct TestIdp {
    pkcs8_der: Vec<u8>,
    public_b64: String,
    kid: String,
}

impl TestIdp {
    pub(crate) fn new() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        // Minimal PKCS#8 v1 DER wrapper around the raw 32-byte seed
        let mut pkcs8_der = vec![
            0x30, 0x2e, // SEQUENCE, 46 bytes
            0x02, 0x01, 0x00, // INTEGER version 0
            0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
            0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
            0x04, 0x22, // OCTET STRING, 34 bytes
            0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
        ];
        pkcs8_der.extend_from_slice(&signing_key.to_bytes());

        Self {
            pkcs8_der,
            public_b64,
            kid: "test-kid-1".to_string(),
        }
    }

    pub(crate) fn kid(&self) -> &str {
        &self.kid
    }

    /// Sign arbitrary claims into a JWT carrying this IdP's `kid`.
    pub(crate) fn sign(&self, claims: Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        let key = EncodingKey::from_ed_der(&self.pkcs8_der);
        jsonwebtoken::encode(&header, &claims, &key).expect("encode test JWT")
    }

    pub(crate) fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_ed_components(&self.public_b64).expect("decode test public key")
    }

    /// A [`SigningKeySource`] that resolves only this IdP's `kid`.
    pub(crate) fn key_source(&self) -> Arc<dyn SigningKeySource> {
        Arc::new(FakeKeySource {
            kid: self.kid.clone(),
            key: self.decoding_key(),
        })
    }

    /// The public key as a JWKS document.
    pub(crate) fn jwks_json(&self) -> Value {
        json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "use": "sig",
                "kid": self.kid,
                "x": self.public_b64,
            }]
        })
    }

    /// Serve the JWKS document from an ephemeral local HTTP endpoint.
    pub(crate) async fn serve_jwks(&self) -> String {
        let jwks = self.jwks_json();
        let app = Router::new().route(
            "/keys",
            get(move || {
                let jwks = jwks.clone();
                async move { Json(jwks) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/keys")
    }

    pub(crate) fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    pub(crate) fn an_hour_ago() -> i64 {
        chrono::Utc::now().timestamp() - 3600
    }
}

/// Key source returning a fixed key for a single `kid`.
struct FakeKeySource {
    kid: String,
    key: DecodingKey,
}

#[async_trait]
impl SigningKeySource for FakeKeySource {
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        if kid == self.kid {
            Ok(self.key.clone())
        } else {
            Err(VerifyError::UnknownKeyId(kid.to_string()))
        }
    }
}

/// Build a structurally valid but unsigned JWT from raw header/payload JSON.
/// Used to test rejection of forged or malformed tokens.
pub(crate) fn craft_raw_jwt(header: &Value, payload: &Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).expect("header json"));
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}
