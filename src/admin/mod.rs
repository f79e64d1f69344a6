//! Admin HTTP surface.
//!
//! # Routes
//! ```text
//! GET  /admin/status                     version, session count, backends
//! GET  /admin/backends                   every backend descriptor
//! POST /admin/backends                   add a backend {tier, endpoint} (starts down)
//! POST /admin/backends/{id}/{action}     up | down | migrate
//! GET  /admin/sessions[?details=true]    session projections
//! POST /admin/sessions/{id}/kill         terminate a client session
//! ```
//!
//! Every route requires `Authorization: Bearer <api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::Shutdown;
use crate::supervisor::ConnectionSupervisor;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub supervisor: ConnectionSupervisor,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(get_backends).post(add_backend))
        .route("/admin/backends/{id}/{action}", post(backend_action))
        .route("/admin/sessions", get(get_sessions))
        .route("/admin/sessions/{id}/kill", post(kill_session))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router until `shutdown` fires.
pub async fn serve_admin(listener: TcpListener, state: AdminState, shutdown: Shutdown) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin listener starting");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    tracing::info!("Admin listener stopped");
    Ok(())
}
