//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::proxy::LlmProxy;
use super::router::{AppState, create_router};
use crate::auth::provision::CredentialProvisioner;
use crate::auth::resolver::ClaimsResolver;
use crate::auth::verifier::{JwksKeyCache, TokenVerifier};
use crate::auth::AuthGate;
use crate::config::Config;
use crate::{Error, Result};

/// LLM gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
}

impl Gateway {
    /// Create a new gateway
    ///
    /// # Errors
    ///
    /// Currently infallible; config validation happens in [`Config::load`].
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self { config })
    }

    /// Run the gateway until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error when binding or serving fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        // Create shutdown channel
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        // Assemble the auth chain
        let ad = self.config.auth.resolve();
        let key_source: Arc<JwksKeyCache> = Arc::new(JwksKeyCache::new(
            ad.as_ref().map(|ad| ad.jwks_uri()).unwrap_or_default(),
        ));
        let verifier = TokenVerifier::new(ad.clone(), key_source);
        let resolver = ClaimsResolver::new(verifier, ad.clone());
        let provisioner = CredentialProvisioner::new(&self.config.credentials);
        let gate = Arc::new(AuthGate::new(
            resolver,
            provisioner,
            self.config.auth.clone(),
            self.config.auth.resolve_salt(),
        ));

        let proxy = Arc::new(LlmProxy::new(
            &self.config.upstream,
            self.config.server.max_body_size,
        )?);
        let state = Arc::new(AppState {
            gate,
            proxy,
        });

        // Create router
        let app = create_router(state);

        // Bind listener
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("LLM GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");

        match &ad {
            Some(ad) => info!(tenant = %ad.tenant_id, "AUTHENTICATION enabled (Azure AD)"),
            None => warn!(
                "AUTHENTICATION not configured - all non-public requests will be rejected"
            ),
        }
        info!(upstream = %self.config.upstream.base_url, "Proxying /v1/* to upstream");
        info!(
            credential_service = %self.config.credentials.base_url,
            team = %self.config.credentials.team_id,
            "Provisioning credentials"
        );
        info!("============================================================");

        // Run server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
