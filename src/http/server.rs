//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router accepting WebSocket upgrades on any path
//! - Wire up request tracing
//! - Bind server to listener with graceful shutdown

use std::net::SocketAddr;

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::http::websocket;
use crate::lifecycle::Shutdown;
use crate::supervisor::ConnectionSupervisor;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: ConnectionSupervisor,
}

/// Client-facing WebSocket server.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        let state = AppState { supervisor };
        Self {
            router: Self::build_router(state),
        }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/", any(client_handler))
            .route("/{*path}", any(client_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Client listener starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("Client listener stopped");
        Ok(())
    }
}

/// Upgrade a client and hand it to the supervisor.
async fn client_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::debug!(peer = %addr, reason = %rejection, "Rejected non-WebSocket request");
            return (StatusCode::UPGRADE_REQUIRED, "WebSocket connections only").into_response();
        }
    };

    let metadata = websocket::client_metadata(addr, &headers);
    let supervisor = state.supervisor;
    upgrade.on_upgrade(move |socket| async move {
        let link = supervisor.on_client_connect(metadata);
        websocket::serve_client(socket, link).await;
    })
}
