//! Credential provisioning against the LLM credential service.
//!
//! The service manages API keys with per-key budgets and rate limits. The
//! gateway looks a derived key up and, on a miss, creates it with the
//! configured provisioning policy. Both calls authenticate with the service
//! master key, which never leaves this module.

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CredentialServiceConfig, ProvisioningPolicy};

/// A provisioned credential as reported by the credential service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Credential {
    /// The key value forwarded upstream in place of the user's bearer token.
    pub key: String,
    /// Spend accrued against the key in the current budget window.
    #[serde(default)]
    pub spend: f64,
    /// Budget ceiling for the window, when the service reports one.
    #[serde(default)]
    pub max_budget: Option<f64>,
}

/// Failure talking to the credential service.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Transport-level failure (connect, timeout, malformed body).
    #[error("credential service request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The service answered with a non-success status.
    #[error("credential service returned {status}: {body}")]
    Status {
        /// HTTP status code of the response.
        status: u16,
        /// Response body, for the log line.
        body: String,
    },
}

/// Envelope of `GET /key/info`.
#[derive(Debug, Deserialize)]
struct KeyInfoResponse {
    info: Credential,
}

/// Envelope of `POST /key/generate`.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    key: String,
    #[serde(default)]
    spend: f64,
    #[serde(default)]
    max_budget: Option<f64>,
}

/// Client for the credential service's key management API.
pub struct CredentialProvisioner {
    http: reqwest::Client,
    base_url: String,
    master_key: String,
    team_id: String,
    policy: ProvisioningPolicy,
}

impl CredentialProvisioner {
    /// Build a provisioner from the credential service configuration.
    #[must_use]
    pub fn new(config: &CredentialServiceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            master_key: config.master_key.clone(),
            team_id: config.team_id.clone(),
            policy: config.policy.clone(),
        }
    }

    /// Fetch an existing credential by key id.
    ///
    /// `Ok(None)` means the service answered and the key does not exist;
    /// only transport failures surface as errors.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Http`] when the request itself fails.
    pub async fn lookup(&self, key_id: &str) -> Result<Option<Credential>, ProvisionError> {
        let response = self
            .http
            .get(format!("{}/key/info", self.base_url))
            .query(&[("key", key_id)])
            .bearer_auth(&self.master_key)
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "Key not known to credential service");
            return Ok(None);
        }

        let info: KeyInfoResponse = response.json().await?;
        Ok(Some(info.info))
    }

    /// Create a credential for `key_id` under the configured policy.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Status`] when the service rejects the
    /// request, or [`ProvisionError::Http`] on transport failure.
    pub async fn create(
        &self,
        key_id: &str,
        username: &str,
        year: i32,
    ) -> Result<Credential, ProvisionError> {
        let body = json!({
            "key": key_id,
            "team_id": self.team_id,
            "metadata": { "year": year, "username": username },
            "max_budget": self.policy.max_budget,
            "budget_duration": self.policy.budget_duration,
            "max_parallel_requests": self.policy.max_parallel_requests,
            "rpm_limit": self.policy.rpm_limit,
            "key_alias": format!("{username}-{year}"),
        });

        let response = self
            .http
            .post(format!("{}/key/generate", self.base_url))
            .bearer_auth(&self.master_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let created: GenerateResponse = response.json().await?;
        info!(username, year, "Provisioned new LLM credential");
        Ok(Credential {
            key: created.key,
            spend: created.spend,
            max_budget: created.max_budget.or(Some(self.policy.max_budget)),
        })
    }

    /// Look the credential up, creating it on a miss.
    ///
    /// A failed lookup is treated as a miss (logged), so a flaky info
    /// endpoint degrades to re-provisioning rather than rejecting the user;
    /// the service deduplicates on the key value.
    ///
    /// # Errors
    ///
    /// Propagates creation failures only.
    pub async fn ensure(
        &self,
        key_id: &str,
        username: &str,
        year: i32,
    ) -> Result<Credential, ProvisionError> {
        match self.lookup(key_id).await {
            Ok(Some(credential)) => return Ok(credential),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Credential lookup failed, attempting create"),
        }
        self.create(key_id, username, year).await
    }
}
