//! Backend registry.
//!
//! # Responsibilities
//! - Hold every known backend descriptor, grouped by tier
//! - Select an endpoint for a tier (fallback when none is healthy)
//! - Error accounting and administrative health mutation

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use url::Url;

use crate::config::ProxyConfig;
use crate::observability::metrics;
use crate::registry::{
    backend::{parse_endpoint, BackendDescriptor, BackendId, Tier},
    selector::RandomSelector,
    Selector,
};

/// Errors returned by registry mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown backend {0}")]
    UnknownBackend(BackendId),

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("endpoint {0} is already registered")]
    DuplicateEndpoint(Url),
}

/// Process-wide table of backend endpoints.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: RwLock<Vec<BackendDescriptor>>,
    fallback: Url,
    selector: Box<dyn Selector>,
}

impl BackendRegistry {
    /// Create an empty registry with uniform random selection.
    pub fn new(fallback: Url) -> Self {
        Self::with_selector(fallback, Box::new(RandomSelector::new()))
    }

    pub fn with_selector(fallback: Url, selector: Box<dyn Selector>) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            fallback,
            selector,
        }
    }

    /// Seed a registry from a validated configuration.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, RegistryError> {
        let fallback = parse_endpoint(&config.registry.fallback_endpoint).map_err(|reason| {
            RegistryError::InvalidEndpoint {
                endpoint: config.registry.fallback_endpoint.clone(),
                reason,
            }
        })?;
        let registry = Self::new(fallback);

        for backend in &config.backends {
            let endpoint = parse_endpoint(&backend.endpoint).map_err(|reason| {
                RegistryError::InvalidEndpoint {
                    endpoint: backend.endpoint.clone(),
                    reason,
                }
            })?;
            registry.register(backend.tier.clone(), endpoint, backend.healthy.unwrap_or(true))?;
        }

        tracing::info!(
            backends = registry.len(),
            fallback = %registry.fallback,
            "Backend registry seeded"
        );
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<BackendDescriptor>> {
        self.backends.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<BackendDescriptor>> {
        self.backends.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The last-resort endpoint.
    pub fn fallback(&self) -> &Url {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Every descriptor, healthy or not.
    pub fn list(&self) -> Vec<BackendDescriptor> {
        self.read().clone()
    }

    pub fn get(&self, id: &BackendId) -> Option<BackendDescriptor> {
        self.read().iter().find(|b| &b.id == id).cloned()
    }

    /// Healthy descriptors of a tier.
    pub fn list_by_tier(&self, tier: &Tier) -> Vec<BackendDescriptor> {
        self.read()
            .iter()
            .filter(|b| b.healthy && &b.tier == tier)
            .cloned()
            .collect()
    }

    /// Choose an endpoint for a tier.
    ///
    /// Reselected on every call. With no healthy candidate the fallback
    /// endpoint is returned, whatever its own health flag says.
    pub fn select(&self, tier: &Tier) -> Url {
        let candidates: Vec<Url> = self
            .list_by_tier(tier)
            .into_iter()
            .map(|b| b.endpoint)
            .collect();

        match self.selector.pick(&candidates) {
            Some(endpoint) => endpoint.clone(),
            None => {
                tracing::debug!(tier = %tier, fallback = %self.fallback, "No healthy backend for tier, using fallback");
                self.fallback.clone()
            }
        }
    }

    /// Count an ungraceful disconnect against an endpoint.
    ///
    /// Returns the new error count, or `None` when the endpoint is not
    /// registered (e.g. the bare fallback).
    pub fn record_error(&self, endpoint: &Url) -> Option<u64> {
        let mut backends = self.write();
        let backend = backends.iter_mut().find(|b| &b.endpoint == endpoint)?;
        backend.error_count += 1;
        Some(backend.error_count)
    }

    /// Register an endpoint with an explicit initial health.
    pub fn register(&self, tier: Tier, endpoint: Url, healthy: bool) -> Result<BackendDescriptor, RegistryError> {
        let mut backends = self.write();
        if backends.iter().any(|b| b.endpoint == endpoint) {
            return Err(RegistryError::DuplicateEndpoint(endpoint));
        }
        let descriptor = BackendDescriptor::new(tier, endpoint, healthy);
        metrics::record_backend_health(descriptor.endpoint.as_str(), healthy);
        backends.push(descriptor.clone());
        Ok(descriptor)
    }

    /// Add a backend at runtime. New backends start unhealthy until marked up.
    pub fn add(&self, tier: Tier, endpoint: Url) -> Result<BackendDescriptor, RegistryError> {
        let descriptor = self.register(tier, endpoint, false)?;
        tracing::info!(id = %descriptor.id, tier = %descriptor.tier, endpoint = %descriptor.endpoint, "Backend added");
        Ok(descriptor)
    }

    /// Toggle the health flag of a backend.
    pub fn set_health(&self, id: &BackendId, healthy: bool) -> Result<BackendDescriptor, RegistryError> {
        let mut backends = self.write();
        let backend = backends
            .iter_mut()
            .find(|b| &b.id == id)
            .ok_or_else(|| RegistryError::UnknownBackend(id.clone()))?;

        if backend.healthy != healthy {
            tracing::info!(endpoint = %backend.endpoint, healthy, "Backend health changed");
        }
        backend.healthy = healthy;
        metrics::record_backend_health(backend.endpoint.as_str(), healthy);
        Ok(backend.clone())
    }

    /// Mark a backend unhealthy ahead of migrating its sessions away.
    ///
    /// Returns the endpoint sessions are bound to; the caller moves them.
    pub fn force_migrate(&self, id: &BackendId) -> Result<Url, RegistryError> {
        self.set_health(id, false).map(|b| b.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        raw.parse().unwrap()
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(url("wss://fallback.example.net/#fallback"))
    }

    #[test]
    fn test_single_candidate_selected() {
        let registry = registry();
        registry.register(Tier::Basic, url("ws://a.example.net"), true).unwrap();

        assert_eq!(registry.select(&Tier::Basic), url("ws://a.example.net"));
    }

    #[test]
    fn test_both_priority_candidates_selected() {
        let registry = registry();
        registry.register(Tier::Priority, url("ws://b.example.net"), true).unwrap();
        registry.register(Tier::Priority, url("ws://c.example.net"), true).unwrap();
        registry.register(Tier::Basic, url("ws://a.example.net"), true).unwrap();

        let mut b_hits = 0;
        let mut c_hits = 0;
        for _ in 0..1000 {
            let selected = registry.select(&Tier::Priority);
            if selected == url("ws://b.example.net") {
                b_hits += 1;
            } else if selected == url("ws://c.example.net") {
                c_hits += 1;
            } else {
                panic!("selected endpoint outside the tier: {}", selected);
            }
        }
        assert!(b_hits > 0, "B never selected");
        assert!(c_hits > 0, "C never selected");
    }

    #[test]
    fn test_fallback_when_none_healthy() {
        let registry = registry();
        registry.register(Tier::Basic, url("ws://a.example.net"), false).unwrap();
        registry.register(Tier::Priority, url("ws://b.example.net"), true).unwrap();

        assert_eq!(registry.select(&Tier::Basic), url("wss://fallback.example.net/#fallback"));
    }

    #[test]
    fn test_record_error_does_not_demote() {
        let registry = registry();
        let a = registry.register(Tier::Basic, url("ws://a.example.net"), true).unwrap();

        assert_eq!(registry.record_error(&a.endpoint), Some(1));
        assert_eq!(registry.record_error(&a.endpoint), Some(2));
        assert_eq!(registry.record_error(registry.fallback()), None);

        let a = registry.get(&a.id).unwrap();
        assert_eq!(a.error_count, 2);
        assert!(a.healthy);
    }

    #[test]
    fn test_add_and_health_toggle() {
        let registry = registry();
        let added = registry.add(Tier::Priority, url("wss://p.example.net")).unwrap();
        assert!(!added.healthy);
        assert_eq!(registry.select(&Tier::Priority), *registry.fallback());

        assert_eq!(
            registry.add(Tier::Basic, url("wss://p.example.net")),
            Err(RegistryError::DuplicateEndpoint(url("wss://p.example.net")))
        );

        registry.set_health(&added.id, true).unwrap();
        assert_eq!(registry.select(&Tier::Priority), url("wss://p.example.net"));

        let missing = BackendId::from("nope".to_string());
        assert_eq!(registry.set_health(&missing, true), Err(RegistryError::UnknownBackend(missing)));
    }

    #[test]
    fn test_force_migrate_marks_unhealthy() {
        let registry = registry();
        let a = registry.register(Tier::Basic, url("ws://a.example.net"), true).unwrap();

        assert_eq!(registry.force_migrate(&a.id).unwrap(), a.endpoint);
        let a = registry.get(&a.id).unwrap();
        assert!(!a.healthy);
        assert_eq!(a.error_count, 0);
    }
}
