//! Axum-based HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/chat/completions` | OpenAI-compatible chat completions, JSON or SSE. |
//! | `GET`  | `/v1/models` | The active model as an OpenAI `list`. |
//! | `GET`  | `/v1/capabilities` | Host capabilities and the selected binary. |
//! | `GET`  | `/health` | Liveness check, always `200 OK`. |

use crate::handlers::{chat_router, health_router, models_router};
use crate::state::AppState;
use axum::{Router, http::Method};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the full axum [`Router`] over the given state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .merge(chat_router())
        .merge(models_router())
        .merge(health_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub struct GatewayServer {
    addr: String,
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(addr: impl Into<String>, state: AppState) -> Self {
        Self {
            addr: addr.into(),
            state: Arc::new(state),
        }
    }

    /// Bind and serve until Ctrl-C.
    pub async fn start(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        let local: SocketAddr = listener.local_addr()?;
        info!(
            addr = %local,
            model = ?self.state.active_model.snapshot().map(|m| m.name()),
            binaries = self.state.registry.binaries.len(),
            "llama-legacy-serve listening"
        );

        axum::serve(listener, build_router(self.state))
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
