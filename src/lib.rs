//! Uplink proxy library.
//!
//! A stateful WebSocket reverse proxy: clients keep one connection to the
//! proxy while it selects, health-checks and fails over between backend
//! connections behind them.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod upstream;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use registry::BackendRegistry;
pub use supervisor::{ConnectionSupervisor, SupervisorSettings};
