//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events: session_id, generation, endpoint, tier)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by EnvFilter)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Metrics calls are no-ops until a recorder is installed
//! - Log level configurable via config and `RUST_LOG`

pub mod logging;
pub mod metrics;
