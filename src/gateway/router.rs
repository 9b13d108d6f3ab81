//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{any, get},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::error;

use crate::auth::{AuthGate, AuthorizedUser, auth_middleware};

use super::proxy::LlmProxy;

/// Shared application state
pub struct AppState {
    /// Auth gate, also used directly by the budget handler
    pub gate: Arc<AuthGate>,
    /// Upstream proxy
    pub proxy: Arc<LlmProxy>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let gate = Arc::clone(&state.gate);

    Router::new()
        .route("/health", get(health_handler))
        .route("/budget", get(budget_handler))
        .route("/v1/{*path}", any(proxy_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(gate, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - public liveness probe
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /budget - the caller's credential record, fetched live
async fn budget_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<AuthorizedUser>,
) -> impl IntoResponse {
    match state.gate.credential_info(&user.key_id).await {
        Ok(Some(credential)) => Json(json!({
            "key": user.key_id,
            "spend": credential.spend,
            "max_budget": credential.max_budget,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": true, "msg": "credential not found" })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, user = %user.identity, "Budget lookup failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": true, "msg": "credential service unavailable" })),
            )
                .into_response()
        }
    }
}

/// ANY /v1/{*path} - authenticated proxy to the upstream LLM API
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> impl IntoResponse {
    match state.proxy.forward(request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            error!(error = %e, "Upstream request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": true, "msg": "upstream request failed" })),
            )
                .into_response()
        }
    }
}
