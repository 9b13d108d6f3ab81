//! Token verification — JWT signature validation and signing-key caching.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Resolve the public key for `kid` from the cached signing-key set
//!    (fetched from the tenant's discovery endpoint on cache miss).
//! 3. Verify the signature and standard claims (`exp`, `iss`, `aud`).
//! 4. Return the decoded claims map.
//!
//! # Security properties
//!
//! - HMAC algorithms are rejected before any key lookup: a symmetric `alg`
//!   would let an unauthenticated caller forge tokens against a public key.
//! - The key cache is bounded (5 entries, 10-minute TTL); each entry is
//!   keyed by `kid` and refreshed independently of request lifecycle.
//! - Expiry is reported as a distinct error kind so the caller can surface
//!   "Token expired" instead of a generic rejection, and so the resolver
//!   never falls back past an expired token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, TokenData, Validation,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
};
use tracing::{debug, warn};

use crate::config::ResolvedAdConfig;

/// Decoded token claims — string keys to arbitrary JSON values.
pub type Claims = serde_json::Map<String, serde_json::Value>;

/// Maximum number of signing keys held in the cache at once.
const MAX_CACHED_KEYS: usize = 5;

/// How long a cached signing key stays fresh.
const KEY_TTL: Duration = Duration::from_secs(600);

/// Error variants for token verification failures.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The token's `exp` claim is in the past. Reported distinctly so the
    /// fallback chain terminates instead of degrading to a weaker check.
    #[error("token expired")]
    Expired,

    /// Signature, issuer, audience, or structure check failed. Deliberately
    /// generic — the rejection must not reveal which check failed.
    #[error("invalid token")]
    Invalid,

    /// Tenant id, app id, or app secret is missing from the deployment
    /// configuration. Distinct from a bad token.
    #[error("missing backend AD configuration")]
    NotConfigured,

    /// Network or HTTP error while fetching the signing-key set.
    #[error("signing key fetch failed: {0}")]
    KeyFetch(#[from] reqwest::Error),

    /// The `kid` in the token header is not in the tenant's key set, even
    /// after a refresh.
    #[error("unknown signing key: {0}")]
    UnknownKeyId(String),
}

/// Source of public signing keys, keyed by key identifier.
///
/// The production implementation is [`JwksKeyCache`]; tests substitute a
/// fake source so verification never touches the network.
#[async_trait]
pub trait SigningKeySource: Send + Sync + 'static {
    /// Resolve the public key for `kid`.
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, VerifyError>;
}

/// Cached signing key entry.
struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

/// Signing-key cache backed by the tenant's JWKS discovery endpoint.
///
/// Bounded to [`MAX_CACHED_KEYS`] entries with a [`KEY_TTL`] lifetime per
/// entry. Concurrent misses on the same `kid` may fetch twice; the fetch is
/// idempotent so this is wasteful but not unsafe.
pub struct JwksKeyCache {
    jwks_uri: String,
    entries: DashMap<String, CachedKey>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksKeyCache {
    /// Create a cache that fetches from `jwks_uri`.
    #[must_use]
    pub fn new(jwks_uri: String) -> Self {
        Self {
            jwks_uri,
            entries: DashMap::new(),
            http: reqwest::Client::new(),
            ttl: KEY_TTL,
        }
    }

    /// Fetch the key set and cache the entry for `kid`.
    async fn refresh(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        debug!(kid = %kid, "Fetching signing keys from {}", self.jwks_uri);
        let jwks: JwkSet = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(key) = find_key_in_jwks(&jwks, kid) else {
            return Err(VerifyError::UnknownKeyId(kid.to_string()));
        };

        self.insert_bounded(kid.to_string(), key.clone());
        Ok(key)
    }

    /// Insert an entry, evicting the stalest one when the cache is full.
    fn insert_bounded(&self, kid: String, key: DecodingKey) {
        if self.entries.len() >= MAX_CACHED_KEYS && !self.entries.contains_key(&kid) {
            let oldest = self
                .entries
                .iter()
                .max_by_key(|e| e.value().fetched_at.elapsed())
                .map(|e| e.key().clone());
            if let Some(k) = oldest {
                self.entries.remove(&k);
            }
        }

        self.entries.insert(
            kid,
            CachedKey {
                key,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl SigningKeySource for JwksKeyCache {
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        if let Some(entry) = self.entries.get(kid) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.key.clone());
            }
        }

        self.refresh(kid).await
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
///
/// Symmetric (octet) keys are never converted — a JWKS should not carry
/// them, and accepting one would enable forgery.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    jwks.keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
        .and_then(decoding_key_from_jwk)
}

fn decoding_key_from_jwk(jwk: &Jwk) -> Option<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x).ok(),
        AlgorithmParameters::OctetKey(_) => None,
    }
}

/// Token verifier — validates bearer tokens against the tenant's key set.
pub struct TokenVerifier {
    ad: Option<ResolvedAdConfig>,
    keys: Arc<dyn SigningKeySource>,
}

impl TokenVerifier {
    /// Create a verifier. `ad` is `None` when the deployment has no tenant
    /// configuration; verification then short-circuits to
    /// [`VerifyError::NotConfigured`].
    #[must_use]
    pub fn new(ad: Option<ResolvedAdConfig>, keys: Arc<dyn SigningKeySource>) -> Self {
        Self { ad, keys }
    }

    /// Verify a bearer token and return its decoded claims.
    ///
    /// # Errors
    ///
    /// [`VerifyError::Expired`] for an expired token, [`VerifyError::Invalid`]
    /// for a signature/issuer/audience/structure failure,
    /// [`VerifyError::NotConfigured`] when the tenant setup is missing.
    pub async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let ad = self.ad.as_ref().ok_or(VerifyError::NotConfigured)?;

        let header = jsonwebtoken::decode_header(token).map_err(|e| {
            debug!(error = %e, "Failed to decode token header");
            VerifyError::Invalid
        })?;

        let Some(alg) = accepted_algorithm(header.alg) else {
            warn!(alg = ?header.alg, "Rejected token with non-asymmetric algorithm");
            return Err(VerifyError::Invalid);
        };

        let Some(kid) = header.kid else {
            debug!("Token header has no kid");
            return Err(VerifyError::Invalid);
        };

        let key = self.keys.key_for(&kid).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = 60; // tolerate minor clock skew vs the IdP
        validation.set_issuer(&ad.issuers());
        validation.set_audience(&ad.audiences());

        let token_data: TokenData<Claims> =
            jsonwebtoken::decode(token, &key, &validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::Expired,
                    kind => {
                        debug!(kind = ?kind, "Token verification failed");
                        VerifyError::Invalid
                    }
                }
            })?;

        Ok(token_data.claims)
    }
}

/// Restrict to the asymmetric algorithm families the key set can express.
/// Returns `None` for HMAC algorithms.
fn accepted_algorithm(alg: Algorithm) -> Option<Algorithm> {
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => None,
        other => Some(other),
    }
}
