//! Client session subsystem.
//!
//! # Data Flow
//! ```text
//! Client connects
//!     → state.rs (ClientSession: identity, tier, buffer, counters, active upstream)
//!
//! Client message (relay traffic)
//!     → active upstream if open, else buffer (FIFO)
//!     → subscriptions.rs (subscribe/unsubscribe logged for replay)
//! ```
//!
//! # Design Decisions
//! - A session is owned by exactly one actor task; nothing here locks
//! - `active` is the only owner of the promoted upstream

pub mod state;
pub mod subscriptions;

pub use state::{
    ClientHeaders, ClientMetadata, ClientSession, Projection, SessionCounters, SessionId,
    SessionSnapshot, StateReport,
};
pub use subscriptions::{SubscriptionCommand, SubscriptionKind, SubscriptionLog};
