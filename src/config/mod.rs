//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize, append registry defaults)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → seeds BackendRegistry, SupervisorSettings, listeners
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup; backends change later only via admin
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, prepare_config, ConfigError};
pub use schema::{
    AdminConfig, BackendConfig, LimitConfig, ListenerConfig, ObservabilityConfig, ProxyConfig,
    RegistryConfig, TimingConfig,
};
