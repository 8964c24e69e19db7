//! Axum HTTP/WebSocket listener (spec §6 "Listener endpoint defaults").
//!
//! Exposes `GET /ws` (the duplex voice connection) and `GET /health`
//! (CORS allow-any, for load balancer probes). Bootstrap follows the
//! teacher's `llm::server::LlmServer::start()` shape: bind, spawn
//! `axum::serve` in the background, return a handle the caller can hold
//! onto or drop to shut down.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::connection::{self, SharedProviders};

#[derive(Clone)]
struct AppState {
    providers: Arc<SharedProviders>,
}

/// A running gateway listener. Dropping it does not stop the server;
/// call [`shutdown`](Self::shutdown) explicitly.
pub struct GatewayServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl GatewayServer {
    /// Binds to `0.0.0.0:{port}` and begins serving in a background task.
    pub async fn start(port: u16, providers: Arc<SharedProviders>) -> std::io::Result<Self> {
        let state = AppState { providers };

        let health_cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health).layer(health_cors))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let bind_addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&bind_addr).await?;
        let addr = listener.local_addr()?;

        tracing::info!(%addr, "gateway listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "gateway server error");
            }
        });

        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state.providers))
}

async fn health() -> impl IntoResponse {
    "ok"
}
