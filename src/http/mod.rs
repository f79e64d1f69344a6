//! Client-facing transport subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, WebSocket upgrade, peer address)
//!     → websocket.rs (client metadata, socket ↔ session actor glue)
//!     → supervisor (one session per socket)
//! ```

pub mod server;
pub mod websocket;

pub use server::{AppState, HttpServer};
