//! Backend descriptors.
//!
//! # Responsibilities
//! - Represent a single backend endpoint and its service tier
//! - Derive a stable id from the endpoint
//! - Track health flag and error accounting

use std::fmt;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Service class a backend belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Tier {
    #[default]
    Basic,
    Priority,
    Fallback,
    /// Any other tier name, stored lowercase.
    Named(String),
}

impl Tier {
    pub fn as_str(&self) -> &str {
        match self {
            Tier::Basic => "basic",
            Tier::Priority => "priority",
            Tier::Fallback => "fallback",
            Tier::Named(name) => name,
        }
    }
}

impl From<&str> for Tier {
    fn from(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "basic" => Tier::Basic,
            "priority" => Tier::Priority,
            "fallback" => Tier::Fallback,
            other => Tier::Named(other.to_string()),
        }
    }
}

impl From<String> for Tier {
    fn from(name: String) -> Self {
        Tier::from(name.as_str())
    }
}

impl From<Tier> for String {
    fn from(tier: Tier) -> Self {
        tier.as_str().to_string()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier derived from a backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    /// Hash an endpoint into its id. The same endpoint always yields the same id.
    pub fn for_endpoint(endpoint: &Url) -> Self {
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, endpoint.as_str().as_bytes());
        Self(uuid.simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BackendId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single backend endpoint known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub tier: Tier,
    pub endpoint: Url,
    pub healthy: bool,
    /// Ungraceful disconnects attributed to this endpoint. Observability only;
    /// it never changes `healthy`.
    pub error_count: u64,
}

impl BackendDescriptor {
    pub fn new(tier: Tier, endpoint: Url, healthy: bool) -> Self {
        Self {
            id: BackendId::for_endpoint(&endpoint),
            tier,
            endpoint,
            healthy,
            error_count: 0,
        }
    }
}

/// Parse a WebSocket endpoint URI.
pub fn parse_endpoint(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(format!("unsupported scheme {:?}, expected ws or wss", other)),
    }
    if url.host_str().is_none() {
        return Err("missing host".to_string());
    }
    Ok(url)
}
