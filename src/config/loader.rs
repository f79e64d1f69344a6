//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::{BackendConfig, ProxyConfig};
use crate::config::validation::{validate_config, ValidationError};
use crate::registry::backend::parse_endpoint;
use crate::registry::Tier;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ProxyConfig = toml::from_str(&content)?;
    prepare_config(config)
}

/// Append registry defaults and validate.
pub fn prepare_config(mut config: ProxyConfig) -> Result<ProxyConfig, ConfigError> {
    apply_registry_defaults(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Seed the backend list with entries pointing at the fallback host.
///
/// An empty list gets a single `fallback` tier entry. `basic` and `priority`
/// entries (fragment = tier name, unhealthy) are appended unless already listed.
pub fn apply_registry_defaults(config: &mut ProxyConfig) {
    if !config.registry.seed_defaults {
        return;
    }
    // An unparsable fallback is reported by validation.
    let Ok(fallback) = parse_endpoint(&config.registry.fallback_endpoint) else {
        return;
    };

    if config.backends.is_empty() {
        config.backends.push(BackendConfig {
            tier: Tier::Fallback,
            endpoint: fallback.to_string(),
            healthy: None,
        });
    }

    for tier in [Tier::Basic, Tier::Priority] {
        let mut endpoint = fallback.clone();
        endpoint.set_fragment(Some(tier.as_str()));

        let listed = config
            .backends
            .iter()
            .any(|b| parse_endpoint(&b.endpoint).is_ok_and(|url| url == endpoint));
        if !listed {
            config.backends.push(BackendConfig {
                tier,
                endpoint: endpoint.to_string(),
                healthy: Some(false),
            });
        }
    }
}
