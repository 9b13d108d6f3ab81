//! LLM Gateway Library
//!
//! Authenticating reverse proxy for an upstream LLM API. Azure AD bearer
//! tokens in, per-user budget-bounded credentials out.
//!
//! # Request path
//!
//! - **Verify**: validate the inbound JWT against the tenant's published
//!   signing keys (issuer, audience, expiry).
//! - **Resolve**: find an email-like identity in the claims, falling back to
//!   an on-behalf-of exchange and a Graph profile lookup.
//! - **Derive**: hash `(identity, year, salt)` into a deterministic key id
//!   that rotates yearly.
//! - **Provision**: look the key up in the credential service; create it
//!   under the configured budget policy on first use.
//! - **Forward**: rewrite `Authorization` to the provisioned key and stream
//!   the upstream response back.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
