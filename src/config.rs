//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `env:VAR` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Azure AD authentication configuration
    pub auth: AuthConfig,
    /// Credential service configuration
    pub credentials: CredentialServiceConfig,
    /// Upstream LLM API configuration
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (LLM_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("LLM_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        // Expand ${VAR} in string values
        config.expand_env_vars();

        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        for value in [
            &mut self.credentials.base_url,
            &mut self.credentials.master_key,
            &mut self.credentials.team_id,
            &mut self.upstream.base_url,
        ] {
            *value = Self::expand_string(&re, value);
        }

        for value in [
            &mut self.auth.tenant_id,
            &mut self.auth.backend_app_id,
            &mut self.auth.backend_app_secret,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }

        self.auth.key_salt = Self::expand_string(&re, &self.auth.key_salt);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Sanity-check values that would otherwise fail deep inside a request.
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("credentials.base_url", &self.credentials.base_url),
            ("upstream.base_url", &self.upstream.base_url),
        ] {
            if value.is_empty() {
                continue; // allowed to be unset until first use; logged at startup
            }
            url::Url::parse(value)
                .map_err(|e| Error::Config(format!("Invalid {name} '{value}': {e}")))?;
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Azure AD authentication configuration.
///
/// The three tenant values (`tenant_id`, `backend_app_id`,
/// `backend_app_secret`) must all be present for token verification to run;
/// if any is missing, the gate rejects with a distinct
/// "missing backend AD configuration" message so operators can tell a
/// deployment problem from a bad token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Azure AD tenant id (supports `env:VAR_NAME`)
    pub tenant_id: Option<String>,
    /// Backend (API) application id (supports `env:VAR_NAME`)
    pub backend_app_id: Option<String>,
    /// Backend application client secret (supports `env:VAR_NAME`)
    pub backend_app_secret: Option<String>,
    /// Salt mixed into the derived per-user key (supports `env:VAR_NAME`)
    pub key_salt: String,
    /// Identity provider authority base URL (overridable for tests)
    pub authority: String,
    /// Microsoft Graph base URL (overridable for tests)
    pub graph_base_url: String,
    /// Paths that bypass authentication (default: `["/health"]`)
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tenant_id: None,
            backend_app_id: None,
            backend_app_secret: None,
            key_salt: String::new(),
            authority: "https://login.microsoftonline.com".to_string(),
            graph_base_url: "https://graph.microsoft.com/v1.0".to_string(),
            public_paths: default_public_paths(),
        }
    }
}

impl AuthConfig {
    /// Resolve a value that may use `env:VAR_NAME` indirection.
    fn resolve_value(value: &str) -> String {
        if let Some(var_name) = value.strip_prefix("env:") {
            env::var(var_name).unwrap_or_default()
        } else {
            value.to_string()
        }
    }

    /// Resolve the tenant configuration, expanding `env:` indirections.
    ///
    /// Returns `None` when any of tenant id, app id, or app secret is unset
    /// or empty.
    #[must_use]
    pub fn resolve(&self) -> Option<ResolvedAdConfig> {
        let tenant_id = Self::resolve_value(self.tenant_id.as_deref()?);
        let app_id = Self::resolve_value(self.backend_app_id.as_deref()?);
        let app_secret = Self::resolve_value(self.backend_app_secret.as_deref()?);

        if tenant_id.is_empty() || app_id.is_empty() || app_secret.is_empty() {
            return None;
        }

        Some(ResolvedAdConfig {
            tenant_id,
            app_id,
            app_secret,
            authority: self.authority.trim_end_matches('/').to_string(),
            graph_base_url: self.graph_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve the derived-key salt, expanding `env:` indirection.
    #[must_use]
    pub fn resolve_salt(&self) -> String {
        Self::resolve_value(&self.key_salt)
    }

    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p))
    }
}

/// Fully-resolved Azure AD tenant configuration.
#[derive(Debug, Clone)]
pub struct ResolvedAdConfig {
    /// Tenant id
    pub tenant_id: String,
    /// Backend application id
    pub app_id: String,
    /// Backend application secret
    pub app_secret: String,
    /// Authority base URL (no trailing slash)
    pub authority: String,
    /// Graph base URL (no trailing slash)
    pub graph_base_url: String,
}

impl ResolvedAdConfig {
    /// Accepted token issuers. Azure AD emits either form depending on the
    /// token version (v1 sts-style vs v2.0).
    #[must_use]
    pub fn issuers(&self) -> [String; 2] {
        [
            format!("https://sts.windows.net/{}/", self.tenant_id),
            format!("{}/{}/v2.0", self.authority, self.tenant_id),
        ]
    }

    /// Accepted audiences. Azure AD inconsistently populates `aud` with
    /// either the URI form or the bare application id.
    #[must_use]
    pub fn audiences(&self) -> [String; 2] {
        [format!("api://{}", self.app_id), self.app_id.clone()]
    }

    /// Signing-key discovery endpoint for this tenant.
    #[must_use]
    pub fn jwks_uri(&self) -> String {
        format!("{}/{}/discovery/v2.0/keys", self.authority, self.tenant_id)
    }

    /// OAuth2 token endpoint for this tenant (used for on-behalf-of exchange).
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }
}

/// Credential service configuration (LiteLLM-style key management API)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct CredentialServiceConfig {
    /// Base URL of the credential service
    pub base_url: String,
    /// Service-level bearer token (supports `${VAR}` expansion)
    pub master_key: String,
    /// Team id attached to provisioned credentials
    pub team_id: String,
    /// Provisioning policy applied to newly created credentials
    pub policy: ProvisioningPolicy,
}

/// Fixed provisioning policy for newly created credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningPolicy {
    /// Budget cap in currency units
    pub max_budget: f64,
    /// Budget renewal period
    pub budget_duration: String,
    /// Concurrency cap
    pub max_parallel_requests: u32,
    /// Requests-per-minute limit
    pub rpm_limit: u32,
}

impl Default for ProvisioningPolicy {
    fn default() -> Self {
        Self {
            max_budget: 1.0,
            budget_duration: "1mo".to_string(),
            max_parallel_requests: 2,
            rpm_limit: 10,
        }
    }
}

/// Upstream LLM API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the upstream OpenAI-compatible API
    pub base_url: String,
    /// Outbound request timeout. The identity-provider calls rely on
    /// transport defaults; the LLM proxy enforces this explicitly because a
    /// hung completion request would otherwise pin the connection.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // Parse "30s", "5m", etc.
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
