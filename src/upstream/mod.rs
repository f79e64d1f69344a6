//! Upstream connection subsystem.
//!
//! # Data Flow
//! ```text
//! Session actor picks an endpoint
//!     → connection.rs (UpstreamConnection::spawn → UpstreamHandle)
//!     → transport.rs (Connector opens the socket, reader/writer pumps)
//!
//! Backend frames:
//!     → sentinel.rs (heartbeat / connection test / replay filtered out)
//!     → UpstreamNotice { generation, event } → session actor
//! ```
//!
//! # Design Decisions
//! - One task per upstream; the session talks to it only through channels
//! - Every notice carries the generation it was spawned with (fencing token)
//! - Transport errors become close causes, never client-visible errors

pub mod connection;
pub mod sentinel;
pub mod transport;

pub use connection::{
    CloseCause, UpstreamCommand, UpstreamConnection, UpstreamEvent, UpstreamHandle,
    UpstreamNotice, UpstreamSettings, UpstreamState,
};
pub use transport::{Connector, Frame, TungsteniteConnector, UpstreamError, UpstreamLink};
