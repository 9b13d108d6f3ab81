//! Identity resolution — an ordered fallback chain over token claims.
//!
//! # Resolution stages
//!
//! 1. **Local verification**: verify the token cryptographically and look
//!    for an email-like claim. The common case ends here with no network
//!    traffic beyond the signing-key fetch.
//! 2. **On-behalf-of exchange**: trade the inbound token for a richer claims
//!    set (plus a delegated Graph access token) at the tenant's token
//!    endpoint, and re-check the same claims.
//! 3. **Profile lookup**: call Graph `/me` with the delegated token.
//!
//! Stage 1 is the security boundary: its failures (expired, invalid,
//! unconfigured) propagate immediately and terminate the chain. Stages 2–3
//! are best-effort enrichment — any network or protocol failure there is
//! logged and treated as "this stage found nothing".

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ResolvedAdConfig;

use super::verifier::{Claims, TokenVerifier, VerifyError};

/// Claim names checked for a usable identity, in priority order.
const IDENTITY_CLAIMS: [&str; 3] = ["email", "preferred_username", "upn"];

/// Downstream scope requested in the on-behalf-of exchange.
const OBO_SCOPE: &str = "https://graph.microsoft.com/User.Read";

/// Resolves a canonical identity string (an email-like value) from a bearer
/// token.
pub struct ClaimsResolver {
    verifier: TokenVerifier,
    ad: Option<ResolvedAdConfig>,
    http: reqwest::Client,
}

/// Response body of the on-behalf-of token exchange.
#[derive(Debug, Deserialize)]
struct OboGrant {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

/// Relevant fields of the Graph `/me` profile.
#[derive(Debug, Deserialize)]
struct GraphProfile {
    #[serde(default)]
    mail: Option<String>,
    #[serde(default, rename = "userPrincipalName")]
    user_principal_name: Option<String>,
}

impl GraphProfile {
    fn identity(self) -> Option<String> {
        non_empty(self.mail).or_else(|| non_empty(self.user_principal_name))
    }
}

impl ClaimsResolver {
    /// Create a resolver over a verifier and tenant configuration.
    #[must_use]
    pub fn new(verifier: TokenVerifier, ad: Option<ResolvedAdConfig>) -> Self {
        Self {
            verifier,
            ad,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve the canonical identity behind `token`.
    ///
    /// Returns `Ok(None)` when every stage ran and none produced an identity
    /// — a definitive negative, not an error.
    ///
    /// # Errors
    ///
    /// Propagates [`VerifyError`] from local verification unchanged; an
    /// expired token never falls through to the weaker stages.
    pub async fn resolve(&self, token: &str) -> Result<Option<String>, VerifyError> {
        let claims = self.verifier.verify(token).await?;

        if let Some(identity) = identity_from_claims(&claims) {
            return Ok(Some(identity));
        }

        let Some(ad) = &self.ad else {
            return Ok(None);
        };

        debug!("No identity field in verified claims, attempting on-behalf-of exchange");
        let grant = match self.exchange_on_behalf_of(ad, token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "On-behalf-of exchange failed");
                return Ok(None);
            }
        };

        if let Some(id_token) = &grant.id_token {
            if let Some(claims) = decode_unverified_claims(id_token) {
                if let Some(identity) = identity_from_claims(&claims) {
                    return Ok(Some(identity));
                }
            }
        }

        let Some(access_token) = grant.access_token else {
            return Ok(None);
        };

        debug!("Delegated claims carried no identity, querying profile endpoint");
        match self.fetch_profile(ad, &access_token).await {
            Ok(profile) => Ok(profile.identity()),
            Err(e) => {
                warn!(error = %e, "Profile lookup failed");
                Ok(None)
            }
        }
    }

    /// RFC 8693-style on-behalf-of exchange with the confidential client
    /// credential.
    async fn exchange_on_behalf_of(
        &self,
        ad: &ResolvedAdConfig,
        token: &str,
    ) -> Result<OboGrant, reqwest::Error> {
        let params = [
            ("client_id", ad.app_id.as_str()),
            ("client_secret", ad.app_secret.as_str()),
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("requested_token_use", "on_behalf_of"),
            ("assertion", token),
            ("scope", OBO_SCOPE),
        ];

        self.http
            .post(ad.token_endpoint())
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// `GET {graph}/me` with the delegated access token.
    async fn fetch_profile(
        &self,
        ad: &ResolvedAdConfig,
        access_token: &str,
    ) -> Result<GraphProfile, reqwest::Error> {
        self.http
            .get(format!("{}/me", ad.graph_base_url))
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// Extract an identity from a claims map, checking [`IDENTITY_CLAIMS`] in
/// priority order. Empty strings don't count.
fn identity_from_claims(claims: &Claims) -> Option<String> {
    IDENTITY_CLAIMS.iter().find_map(|name| {
        claims
            .get(*name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Decode a JWT payload without signature verification.
///
/// The id_token arrives over TLS directly from the token endpoint we just
/// authenticated to; it is enrichment data, not a security input.
fn decode_unverified_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}
