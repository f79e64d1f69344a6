//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check every endpoint is a usable WebSocket URI
//! - Validate value ranges (intervals > 0, limits > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::registry::backend::parse_endpoint;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no backends configured")]
    NoBackends,

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("endpoint {0:?} is listed more than once")]
    DuplicateEndpoint(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid bind address {address:?} for {field}")]
    InvalidBindAddress { field: &'static str, address: String },
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.backends.is_empty() {
        errors.push(ValidationError::NoBackends);
    }

    let mut seen = HashSet::new();
    for backend in &config.backends {
        match parse_endpoint(&backend.endpoint) {
            Ok(url) => {
                if !seen.insert(url) {
                    errors.push(ValidationError::DuplicateEndpoint(backend.endpoint.clone()));
                }
            }
            Err(reason) => errors.push(ValidationError::InvalidEndpoint {
                endpoint: backend.endpoint.clone(),
                reason,
            }),
        }
    }

    if let Err(reason) = parse_endpoint(&config.registry.fallback_endpoint) {
        errors.push(ValidationError::InvalidEndpoint {
            endpoint: config.registry.fallback_endpoint.clone(),
            reason,
        });
    }

    let t = &config.timings;
    let intervals = [
        ("timings.connect_timeout_ms", t.connect_timeout_ms),
        ("timings.heartbeat_interval_ms", t.heartbeat_interval_ms),
        ("timings.heartbeat_grace_ms", t.heartbeat_grace_ms),
        ("timings.health_check_timeout_ms", t.health_check_timeout_ms),
        ("timings.reconnect_backoff_ms", t.reconnect_backoff_ms),
        ("timings.client_ping_interval_ms", t.client_ping_interval_ms),
        ("timings.client_pong_grace_ms", t.client_pong_grace_ms),
    ];
    for (field, value) in intervals {
        if value == 0 {
            errors.push(ValidationError::Zero(field));
        }
    }

    if config.limits.control_inspect_bytes == 0 {
        errors.push(ValidationError::Zero("limits.control_inspect_bytes"));
    }
    if config.limits.subscription_inspect_bytes == 0 {
        errors.push(ValidationError::Zero("limits.subscription_inspect_bytes"));
    }

    let addresses = [
        ("listener.bind_address", &config.listener.bind_address),
        ("admin.bind_address", &config.admin.bind_address),
    ];
    for (field, address) in addresses {
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidBindAddress {
                field,
                address: address.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
