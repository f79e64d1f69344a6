//! Connection supervision subsystem.
//!
//! # Data Flow
//! ```text
//! Client connects (http::websocket)
//!     → ConnectionSupervisor::on_client_connect
//!     → task.rs (one actor per session: owns ClientSession + candidates)
//!     → registry select → upstream attempt → health check → promotion
//!
//! Client frames → SessionHandle → actor → relay / buffer / control.rs
//! Admin actions → ConnectionSupervisor → registry + MigrateAway to actors
//! ```
//!
//! # Design Decisions
//! - All mutations of a session happen on its actor; no per-field locks
//! - The registry is injected, never global
//! - Promotion is fenced by the session generation

pub mod control;
pub mod task;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::ProxyConfig;
use crate::observability::metrics;
use crate::registry::backend::parse_endpoint;
use crate::registry::{BackendDescriptor, BackendId, BackendRegistry, RegistryError, Tier};
use crate::session::{ClientMetadata, ClientSession, SessionId, SessionSnapshot};
use crate::upstream::{Connector, UpstreamSettings};

pub use control::{AllowAllTiers, ControlMessage, TierPolicy};
pub use task::{ClientFrame, SessionEntry, SessionEvent};

use task::SessionTask;

/// Supervisor-wide policy and timers.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Tier assigned to new sessions.
    pub default_tier: Tier,
    pub upgrade_tier: Tier,
    pub downgrade_tier: Tier,
    pub reconnect_backoff: Duration,
    pub client_ping_interval: Duration,
    pub client_pong_grace: Duration,
    /// Client messages up to this size are checked for control keys.
    pub control_inspect_limit: usize,
    pub upstream: UpstreamSettings,
    pub tier_policy: Arc<dyn TierPolicy>,
}

impl SupervisorSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            default_tier: config.registry.default_tier.clone(),
            upgrade_tier: config.registry.upgrade_tier.clone(),
            downgrade_tier: config.registry.downgrade_tier.clone(),
            reconnect_backoff: config.timings.reconnect_backoff(),
            client_ping_interval: config.timings.client_ping_interval(),
            client_pong_grace: config.timings.client_pong_grace(),
            control_inspect_limit: config.limits.control_inspect_bytes,
            upstream: UpstreamSettings::from_config(config),
            tier_policy: Arc::new(AllowAllTiers),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Administrative action on a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendAction {
    Up,
    Down,
    Migrate,
}

impl FromStr for BackendAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(BackendAction::Up),
            "down" => Ok(BackendAction::Down),
            "migrate" => Ok(BackendAction::Migrate),
            other => Err(format!("unknown backend action {:?}", other)),
        }
    }
}

impl fmt::Display for BackendAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendAction::Up => "up",
            BackendAction::Down => "down",
            BackendAction::Migrate => "migrate",
        })
    }
}

/// Result of an admin action on a backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionReport {
    pub backend: BackendDescriptor,
    /// Sessions moved off the backend (migrate only).
    pub migrated: Vec<SessionId>,
}

/// Transport-side handle to a session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Deliver a text message from the client.
    pub fn text(&self, raw: String) {
        let _ = self.events.send(SessionEvent::ClientText(raw));
    }

    pub fn pong(&self) {
        let _ = self.events.send(SessionEvent::ClientPong);
    }

    /// The client transport is gone.
    pub fn close(&self) {
        let _ = self.events.send(SessionEvent::ClientClosed);
    }
}

/// What the client transport needs to serve a new session.
#[derive(Debug)]
pub struct ClientLink {
    pub session: SessionHandle,
    /// Frames to write to the client. Ends when the session actor exits.
    pub outbound: mpsc::UnboundedReceiver<ClientFrame>,
}

/// Accepts clients, owns the live-session table and fans admin actions out
/// to session actors.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    registry: Arc<BackendRegistry>,
    connector: Arc<dyn Connector>,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    settings: Arc<SupervisorSettings>,
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("sessions", &self.sessions.len())
            .field("backends", &self.registry.len())
            .finish()
    }
}

impl ConnectionSupervisor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        connector: Arc<dyn Connector>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            connector,
            sessions: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create a session for a new client and start its first upstream attempt.
    pub fn on_client_connect(&self, metadata: ClientMetadata) -> ClientLink {
        let id = SessionId::new();
        let tier = self.settings.default_tier.clone();
        let preferred = self.registry.select(&tier);

        tracing::info!(
            session_id = %id,
            ip = %metadata.ip,
            origin = %metadata.headers.origin,
            tier = %tier,
            endpoint = %preferred,
            "Client connected"
        );

        let session = ClientSession::new(id, metadata, tier, preferred);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (client_tx, outbound) = mpsc::unbounded_channel();

        self.sessions.insert(
            id,
            SessionEntry {
                events: events_tx.clone(),
            },
        );
        metrics::record_client_connection();
        metrics::record_active_sessions(self.sessions.len());

        let task = SessionTask::new(
            session,
            Arc::clone(&self.registry),
            Arc::clone(&self.connector),
            Arc::clone(&self.settings),
            events,
            client_tx,
            Arc::clone(&self.sessions),
        );
        tokio::spawn(task.run());

        ClientLink {
            session: SessionHandle {
                id,
                events: events_tx,
            },
            outbound,
        }
    }

    fn senders(&self) -> Vec<(SessionId, mpsc::UnboundedSender<SessionEvent>)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().events.clone()))
            .collect()
    }

    /// Snapshot every live session, ordered by id.
    pub async fn list_sessions(&self, details: bool) -> Vec<SessionSnapshot> {
        let mut snapshots = Vec::new();
        for (_, events) in self.senders() {
            let (reply, response) = oneshot::channel();
            if events.send(SessionEvent::Inspect { details, reply }).is_err() {
                continue;
            }
            if let Ok(snapshot) = response.await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn list_backends(&self) -> Vec<BackendDescriptor> {
        self.registry.list()
    }

    pub fn set_backend_health(&self, id: &BackendId, healthy: bool) -> Result<BackendDescriptor, RegistryError> {
        self.registry.set_health(id, healthy)
    }

    /// Register a new backend. It starts unhealthy.
    pub fn add_backend(&self, tier: Tier, endpoint: &str) -> Result<BackendDescriptor, RegistryError> {
        let url = parse_endpoint(endpoint).map_err(|reason| RegistryError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        })?;
        self.registry.add(tier, url)
    }

    /// Mark a backend unhealthy and move every session bound to it.
    ///
    /// Returns once each bound session has started its reconnect.
    pub async fn force_migrate(&self, id: &BackendId) -> Result<ActionReport, RegistryError> {
        let endpoint = self.registry.force_migrate(id)?;

        let mut migrated = Vec::new();
        for (session_id, events) in self.senders() {
            let (reply, response) = oneshot::channel();
            let event = SessionEvent::MigrateAway {
                endpoint: endpoint.clone(),
                reply,
            };
            if events.send(event).is_err() {
                continue;
            }
            if let Ok(true) = response.await {
                migrated.push(session_id);
            }
        }
        migrated.sort();

        tracing::info!(endpoint = %endpoint, sessions = migrated.len(), "Migrated sessions away from backend");

        let backend = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::UnknownBackend(id.clone()))?;
        Ok(ActionReport { backend, migrated })
    }

    pub async fn on_admin_action(&self, id: &BackendId, action: BackendAction) -> Result<ActionReport, RegistryError> {
        tracing::info!(backend = %id, action = %action, "Admin backend action");
        match action {
            BackendAction::Up => self.set_backend_health(id, true).map(|backend| ActionReport {
                backend,
                migrated: Vec::new(),
            }),
            BackendAction::Down => self.set_backend_health(id, false).map(|backend| ActionReport {
                backend,
                migrated: Vec::new(),
            }),
            BackendAction::Migrate => self.force_migrate(id).await,
        }
    }

    /// Terminate a client session. Returns false if it is not live.
    pub fn kill_session(&self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.get(&id) else {
            return false;
        };
        entry.events.send(SessionEvent::Kill).is_ok()
    }
}
