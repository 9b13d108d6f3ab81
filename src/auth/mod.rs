//! Authentication and credential provisioning.
//!
//! The gate sits in front of every non-public route. For each request it
//! verifies the inbound Azure AD bearer token, resolves the caller to an
//! email-like identity, derives that user's deterministic credential key id
//! for the current year, ensures the credential exists in the credential
//! service, and rewrites the `Authorization` header so the upstream LLM API
//! only ever sees provisioned keys.

pub mod derive;
pub mod provision;
pub mod resolver;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testkeys;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Datelike, Utc};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AuthConfig;

use self::derive::derive_key_id;
use self::provision::{Credential, CredentialProvisioner};
use self::resolver::ClaimsResolver;
use self::verifier::VerifyError;

/// Why the gate turned a request away.
///
/// Messages are stable client-facing strings; front ends match on them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthRejection {
    /// Request carried no bearer token.
    #[error("missing authorization header")]
    MissingHeader,
    /// The gateway is not configured for token verification.
    #[error("missing backend AD configuration")]
    NotConfigured,
    /// The token's lifetime has lapsed.
    #[error("Token expired")]
    Expired,
    /// The token failed verification for any other reason.
    #[error("Invalid token")]
    Invalid,
    /// Verification passed but no stage produced an identity.
    #[error("unable to retrieve user information")]
    NoIdentity,
    /// The credential service would not supply a key.
    #[error("unable to provision llm credential")]
    Provisioning,
}

impl AuthRejection {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::Provisioning => StatusCode::BAD_GATEWAY,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = json!({ "error": true, "msg": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

/// The authenticated caller, attached to the request as an extension once
/// the gate admits it.
#[derive(Debug, Clone)]
pub struct AuthorizedUser {
    /// Canonical (normalized) identity.
    pub identity: String,
    /// Derived credential key id for the current year.
    pub key_id: String,
    /// Spend reported by the credential service at admission time.
    pub spend: f64,
    /// Budget ceiling, when the service reports one.
    pub max_budget: Option<f64>,
}

/// Request gate: token verification through credential provisioning.
pub struct AuthGate {
    resolver: ClaimsResolver,
    provisioner: CredentialProvisioner,
    auth: AuthConfig,
    salt: String,
}

impl AuthGate {
    /// Assemble the gate from its stages.
    #[must_use]
    pub fn new(
        resolver: ClaimsResolver,
        provisioner: CredentialProvisioner,
        auth: AuthConfig,
        salt: String,
    ) -> Self {
        Self {
            resolver,
            provisioner,
            auth,
            salt,
        }
    }

    /// Whether `path` bypasses authentication.
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.auth.is_public_path(path)
    }

    /// Live credential lookup for an already-admitted caller.
    ///
    /// # Errors
    ///
    /// Propagates credential service failures.
    pub async fn credential_info(
        &self,
        key_id: &str,
    ) -> Result<Option<Credential>, provision::ProvisionError> {
        self.provisioner.lookup(key_id).await
    }

    /// Run the full chain for a bearer token.
    ///
    /// Returns the admitted caller together with the credential key to
    /// forward upstream.
    ///
    /// # Errors
    ///
    /// Returns the rejection to serve the client with.
    pub async fn authorize(&self, token: &str) -> Result<(AuthorizedUser, String), AuthRejection> {
        let identity = match self.resolver.resolve(token).await {
            Ok(Some(identity)) => identity,
            Ok(None) => return Err(AuthRejection::NoIdentity),
            Err(VerifyError::NotConfigured) => return Err(AuthRejection::NotConfigured),
            Err(VerifyError::Expired) => return Err(AuthRejection::Expired),
            Err(e) => {
                debug!(error = %e, "Token verification failed");
                return Err(AuthRejection::Invalid);
            }
        };

        let identity = derive::normalize_identity(&identity);
        let year = Utc::now().year();
        let key_id = derive_key_id(&identity, year, &self.salt);

        let credential = self
            .provisioner
            .ensure(&key_id, &identity, year)
            .await
            .map_err(|e| {
                warn!(error = %e, user = %identity, "Credential provisioning failed");
                AuthRejection::Provisioning
            })?;

        let user = AuthorizedUser {
            identity,
            key_id,
            spend: credential.spend,
            max_budget: credential.max_budget,
        };
        Ok((user, credential.key))
    }
}

/// Extract the bearer token from an `Authorization` header value.
fn bearer_token(value: &HeaderValue) -> Option<&str> {
    let value = value.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum middleware wrapping [`AuthGate::authorize`].
///
/// On success the request continues with its `Authorization` header rewritten
/// to the provisioned credential, informational `spend` and `budget` headers
/// set, and an [`AuthorizedUser`] extension attached.
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    if gate.is_public_path(request.uri().path()) {
        return next.run(request).await;
    }

    let Some(token) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(bearer_token)
        .map(str::to_string)
    else {
        return AuthRejection::MissingHeader.into_response();
    };

    let (user, credential_key) = match gate.authorize(&token).await {
        Ok(admitted) => admitted,
        Err(rejection) => {
            debug!(path = %request.uri().path(), %rejection, "Request rejected");
            return rejection.into_response();
        }
    };

    // The upstream only ever sees provisioned keys, never the AD token. A
    // key that cannot be carried in a header rejects the request; skipping
    // the rewrite would forward the caller's AD token instead.
    let Ok(authorization) = HeaderValue::from_str(&format!("Bearer {credential_key}")) else {
        warn!(user = %user.identity, "Credential service returned a non-header-safe key");
        return AuthRejection::Provisioning.into_response();
    };
    let headers = request.headers_mut();
    headers.insert(header::AUTHORIZATION, authorization);
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", user.spend)) {
        headers.insert("spend", value);
    }
    if let Some(budget) = user.max_budget {
        if let Ok(value) = HeaderValue::from_str(&format!("{budget:.6}")) {
            headers.insert("budget", value);
        }
    }

    request.extensions_mut().insert(user);
    next.run(request).await
}
