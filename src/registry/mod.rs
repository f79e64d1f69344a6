//! Backend registry subsystem.
//!
//! # Data Flow
//! ```text
//! ProxyConfig.backends (seeded once at startup)
//!     → pool.rs (BackendRegistry, shared via Arc)
//!
//! Supervisor needs an upstream for a tier:
//!     → pool.rs (healthy descriptors of that tier)
//!     → selector.rs (uniform random pick)
//!     → endpoint, or the fallback endpoint when none is healthy
//!
//! Admin / supervisor mutations:
//!     record_error, set_health, add, force_migrate
//! ```
//!
//! # Design Decisions
//! - Injected into the supervisor, never a global
//! - Error counts are observability only; health changes are explicit
//! - No sticky affinity: sessions cache the endpoint they were given

use std::fmt::Debug;
use url::Url;

pub mod backend;
pub mod pool;
pub mod selector;

pub use backend::{BackendDescriptor, BackendId, Tier};
pub use pool::{BackendRegistry, RegistryError};

/// Strategy for picking one endpoint among healthy candidates.
pub trait Selector: Send + Sync + Debug {
    /// Returns `None` only when `candidates` is empty.
    fn pick<'a>(&self, candidates: &'a [Url]) -> Option<&'a Url>;
}
