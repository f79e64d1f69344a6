//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::registry::Tier;

/// Root configuration for the uplink proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Client-facing listener.
    pub listener: ListenerConfig,

    /// Backend endpoints used to seed the registry.
    pub backends: Vec<BackendConfig>,

    /// Registry defaults and tier selection.
    pub registry: RegistryConfig,

    /// Timers for upstream supervision and client liveness.
    pub timings: TimingConfig,

    /// Message inspection ceilings.
    pub limits: LimitConfig,

    /// Admin surface.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// A single backend endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Service tier this endpoint belongs to.
    pub tier: Tier,

    /// WebSocket URI (`ws://` or `wss://`).
    pub endpoint: String,

    /// Initial health; endpoints are healthy unless stated otherwise.
    #[serde(default)]
    pub healthy: Option<bool>,
}

/// Registry defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Last-resort endpoint returned when a tier has no healthy candidate.
    pub fallback_endpoint: String,

    /// Tier assigned to newly connected clients.
    pub default_tier: Tier,

    /// Tier a client moves to on `upgrade`.
    pub upgrade_tier: Tier,

    /// Tier a client moves to on `downgrade`.
    pub downgrade_tier: Tier,

    /// Append fallback-host entries for the basic and priority tiers.
    pub seed_defaults: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            fallback_endpoint: "wss://s2.ripple.com/#fallback".to_string(),
            default_tier: Tier::Basic,
            upgrade_tier: Tier::Priority,
            downgrade_tier: Tier::Basic,
            seed_defaults: true,
        }
    }
}

/// Timer configuration. All values are milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Deadline for the upstream transport to open.
    pub connect_timeout_ms: u64,

    /// Interval between heartbeat pings sent upstream.
    pub heartbeat_interval_ms: u64,

    /// Time without a heartbeat reply before an upstream is considered dead.
    pub heartbeat_grace_ms: u64,

    /// Window for the first inbound message after open.
    pub health_check_timeout_ms: u64,

    /// Delay before reconnecting after an ungraceful upstream loss.
    pub reconnect_backoff_ms: u64,

    /// Interval between transport pings sent to clients.
    pub client_ping_interval_ms: u64,

    /// Time without a client pong before the client is terminated.
    pub client_pong_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 2_500,
            heartbeat_grace_ms: 15_000,
            health_check_timeout_ms: 10_000,
            reconnect_backoff_ms: 2_000,
            client_ping_interval_ms: 15_000,
            client_pong_grace_ms: 30_000,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn client_ping_interval(&self) -> Duration {
        Duration::from_millis(self.client_ping_interval_ms)
    }

    pub fn client_pong_grace(&self) -> Duration {
        Duration::from_millis(self.client_pong_grace_ms)
    }
}

/// Size ceilings for message inspection. Larger messages are still relayed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Client messages up to this size are checked for `__api` control keys.
    pub control_inspect_bytes: usize,

    /// Outbound messages up to this size are checked for subscription commands.
    pub subscription_inspect_bytes: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            control_inspect_bytes: 1024,
            subscription_inspect_bytes: 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin listener bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
