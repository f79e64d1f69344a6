//! Per-session actor.
//!
//! Every event for one client (client frames, liveness timers, upstream
//! notices, admin requests, the reconnect backoff) is handled here, one at a
//! time. The actor exclusively owns the `ClientSession` and every upstream
//! candidate started for it.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use crate::observability::metrics::{self, Direction};
use crate::registry::BackendRegistry;
use crate::session::{ClientSession, SessionId, SessionSnapshot};
use crate::supervisor::control::{self, ControlMessage};
use crate::supervisor::SupervisorSettings;
use crate::upstream::connection::sleep_until;
use crate::upstream::{
    CloseCause, Connector, UpstreamConnection, UpstreamEvent, UpstreamHandle, UpstreamNotice,
};

/// Events delivered to a session actor.
#[derive(Debug)]
pub enum SessionEvent {
    ClientText(String),
    ClientPong,
    ClientClosed,
    Inspect {
        details: bool,
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Move off `endpoint` if bound to it; replies whether the session was bound.
    MigrateAway {
        endpoint: Url,
        reply: oneshot::Sender<bool>,
    },
    Kill,
}

/// Frames the actor asks the client transport to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Ping,
    Close,
}

/// Entry in the live-session table.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Removes the session from the live table when the actor exits.
struct SessionGuard {
    id: SessionId,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        metrics::record_active_sessions(self.sessions.len());
        tracing::trace!(session_id = %self.id, "Session removed");
    }
}

pub(crate) struct SessionTask {
    session: ClientSession,
    registry: Arc<BackendRegistry>,
    connector: Arc<dyn Connector>,
    settings: Arc<SupervisorSettings>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    notices_tx: mpsc::UnboundedSender<UpstreamNotice>,
    notices: mpsc::UnboundedReceiver<UpstreamNotice>,
    client: mpsc::UnboundedSender<ClientFrame>,
    /// Candidates not yet promoted, by generation.
    pending: BTreeMap<u64, UpstreamHandle>,
    reconnect_at: Option<Instant>,
    client_pong_deadline: Option<Instant>,
    _guard: SessionGuard,
}

impl SessionTask {
    pub(crate) fn new(
        session: ClientSession,
        registry: Arc<BackendRegistry>,
        connector: Arc<dyn Connector>,
        settings: Arc<SupervisorSettings>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        client: mpsc::UnboundedSender<ClientFrame>,
        sessions: Arc<DashMap<SessionId, SessionEntry>>,
    ) -> Self {
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let guard = SessionGuard {
            id: session.id,
            sessions,
        };

        Self {
            session,
            registry,
            connector,
            settings,
            events,
            notices_tx,
            notices,
            client,
            pending: BTreeMap::new(),
            reconnect_at: None,
            client_pong_deadline: None,
            _guard: guard,
        }
    }

    pub(crate) async fn run(mut self) {
        self.start_attempt();

        let interval = self.settings.client_ping_interval;
        let mut client_ping = tokio::time::interval_at(Instant::now() + interval, interval);
        client_ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let flow = match event {
                        Some(event) => self.handle_event(event),
                        None => ControlFlow::Break(()),
                    };
                    if flow.is_break() {
                        break;
                    }
                }
                Some(notice) = self.notices.recv() => self.handle_notice(notice),
                _ = client_ping.tick() => {
                    if self.client.send(ClientFrame::Ping).is_err() {
                        break;
                    }
                    let grace = self.settings.client_pong_grace;
                    self.client_pong_deadline.get_or_insert_with(|| Instant::now() + grace);
                }
                _ = sleep_until(self.client_pong_deadline) => {
                    tracing::info!(session_id = %self.session.id, "No pong from client, terminating");
                    let _ = self.client.send(ClientFrame::Close);
                    break;
                }
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    tracing::info!(session_id = %self.session.id, endpoint = %self.session.preferred_endpoint, "Reconnecting");
                    self.start_attempt();
                }
            }
        }

        self.shutdown();
    }

    fn handle_event(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::ClientText(raw) => self.on_client_text(raw),
            SessionEvent::ClientPong => self.client_pong_deadline = None,
            SessionEvent::ClientClosed => {
                tracing::info!(
                    session_id = %self.session.id,
                    ip = %self.session.ip,
                    "Client disconnected"
                );
                return ControlFlow::Break(());
            }
            SessionEvent::Kill => {
                tracing::info!(session_id = %self.session.id, "Session killed by admin");
                let _ = self.client.send(ClientFrame::Close);
                return ControlFlow::Break(());
            }
            SessionEvent::Inspect { details, reply } => {
                let _ = reply.send(self.session.snapshot(details));
            }
            SessionEvent::MigrateAway { endpoint, reply } => {
                let bound = self.is_bound_to(&endpoint);
                if bound {
                    tracing::info!(session_id = %self.session.id, from = %endpoint, "Migrating session");
                    self.migrate();
                }
                let _ = reply.send(bound);
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_notice(&mut self, notice: UpstreamNotice) {
        let UpstreamNotice { generation, event } = notice;
        match event {
            UpstreamEvent::Opened => {
                if let Some(candidate) = self.pending.get_mut(&generation) {
                    candidate.begin_health_check(&self.session.subscriptions);
                }
            }
            UpstreamEvent::HealthChecked => self.on_health_checked(generation),
            UpstreamEvent::Message(text) => {
                let from_active = self.session.active().map(UpstreamHandle::generation) == Some(generation);
                if !from_active {
                    tracing::trace!(session_id = %self.session.id, generation, "Dropping message from inactive upstream");
                    return;
                }
                self.session.count_rx(&text);
                metrics::record_relayed(Direction::Downstream);
                let _ = self.client.send(ClientFrame::Text(text));
            }
            UpstreamEvent::Closed { cause, unsent } => self.on_upstream_closed(generation, cause, unsent),
        }
    }

    fn on_client_text(&mut self, raw: String) {
        self.session.count_tx(&raw);

        if let Some(control) = control::parse_control(&raw, self.settings.control_inspect_limit) {
            self.on_control(control);
            return;
        }

        metrics::record_relayed(Direction::Upstream);
        self.session.relay(raw);
    }

    fn on_control(&mut self, control: ControlMessage) {
        let target = match control {
            ControlMessage::State => {
                match serde_json::to_string(&self.session.state_report()) {
                    Ok(report) => {
                        let _ = self.client.send(ClientFrame::Text(report));
                    }
                    Err(e) => tracing::error!(session_id = %self.session.id, error = %e, "Failed to encode state"),
                }
                return;
            }
            ControlMessage::Upgrade => self.settings.upgrade_tier.clone(),
            ControlMessage::Downgrade => self.settings.downgrade_tier.clone(),
            ControlMessage::Unknown(api) => {
                tracing::debug!(session_id = %self.session.id, api = %api, "Ignoring unknown control message");
                return;
            }
        };

        if !self.settings.tier_policy.allow(&self.session, &target) {
            tracing::info!(session_id = %self.session.id, tier = %target, "Tier switch refused by policy");
            return;
        }

        tracing::info!(
            session_id = %self.session.id,
            from = %self.session.tier,
            to = %target,
            "Switching tier"
        );
        self.session.tier = target;
        self.migrate();
    }

    /// Bound to an endpoint: promoted on it, or heading for it.
    ///
    /// Heading for it means the current-generation candidate targets it, or
    /// nothing is promoted and it is the preferred endpoint.
    fn is_bound_to(&self, endpoint: &Url) -> bool {
        let heading_for = self
            .pending
            .get(&self.session.generation())
            .is_some_and(|candidate| candidate.endpoint() == endpoint);

        heading_for
            || match self.session.active_endpoint() {
                Some(active) => active == endpoint,
                None => &self.session.preferred_endpoint == endpoint,
            }
    }

    /// Reselect for the current tier and reconnect now, without error accounting.
    fn migrate(&mut self) {
        self.session.preferred_endpoint = self.registry.select(&self.session.tier);
        self.start_attempt();
    }

    /// Start a new upstream attempt towards the preferred endpoint.
    fn start_attempt(&mut self) {
        self.reconnect_at = None;
        if self.session.is_closed() {
            return;
        }

        if self.session.active_endpoint() == Some(&self.session.preferred_endpoint) {
            tracing::debug!(
                session_id = %self.session.id,
                endpoint = %self.session.preferred_endpoint,
                "Already on preferred endpoint"
            );
            self.discard_pending();
            return;
        }

        let generation = self.session.next_generation();
        let endpoint = self.session.preferred_endpoint.clone();
        tracing::debug!(
            session_id = %self.session.id,
            generation,
            endpoint = %endpoint,
            tier = %self.session.tier,
            "Starting upstream attempt"
        );

        let candidate = UpstreamConnection::spawn(
            generation,
            endpoint,
            self.session.ip.clone(),
            Arc::clone(&self.connector),
            self.settings.upstream.clone(),
            self.notices_tx.clone(),
        );
        self.pending.insert(generation, candidate);
    }

    fn on_health_checked(&mut self, generation: u64) {
        let Some(mut candidate) = self.pending.remove(&generation) else {
            return;
        };

        if self.session.is_closed() || generation != self.session.generation() {
            tracing::info!(
                session_id = %self.session.id,
                generation,
                current = self.session.generation(),
                endpoint = %candidate.endpoint(),
                "Upstream connected but generation expired, closing"
            );
            candidate.close();
            return;
        }

        if let Some(mut previous) = self.session.take_active() {
            tracing::info!(
                session_id = %self.session.id,
                from = %previous.endpoint(),
                to = %candidate.endpoint(),
                "Switching upstream"
            );
            previous.close();
        }

        candidate.promote(&self.session.subscriptions);
        tracing::info!(
            session_id = %self.session.id,
            generation,
            endpoint = %candidate.endpoint(),
            "Upstream promoted"
        );
        self.session.set_active(candidate);
        metrics::record_promotion();

        let flushed = self.session.flush_buffer();
        if flushed > 0 {
            tracing::debug!(session_id = %self.session.id, flushed, "Flushed buffered messages");
        }
    }

    fn on_upstream_closed(&mut self, generation: u64, cause: CloseCause, unsent: Vec<String>) {
        let active_generation = self.session.active().map(UpstreamHandle::generation);

        let (endpoint, relevant) = if active_generation == Some(generation) {
            let endpoint = self.session.take_active().map(|up| up.endpoint().clone());
            (endpoint, true)
        } else if let Some(candidate) = self.pending.remove(&generation) {
            (Some(candidate.endpoint().clone()), generation == self.session.generation())
        } else {
            (None, false)
        };

        // Unsent messages predate everything still buffered. If this upstream
        // was already replaced, newer messages may have reached its successor
        // first; order is only kept within the buffer.
        if !unsent.is_empty() {
            tracing::debug!(session_id = %self.session.id, unsent = unsent.len(), "Re-queueing unsent messages");
            self.session.requeue_front(unsent);
            self.session.flush_buffer();
        }

        if self.session.is_closed() || !relevant {
            return;
        }

        match cause {
            CloseCause::Requested => {}
            CloseCause::HealthCheckFailed if self.session.active().is_some() => {
                tracing::debug!(session_id = %self.session.id, generation, "Candidate discarded, keeping active upstream");
            }
            // Nothing promoted to fall back on: treat like a loss.
            CloseCause::HealthCheckFailed | CloseCause::Lost => self.on_upstream_gone(generation, endpoint),
        }
    }

    fn on_upstream_gone(&mut self, generation: u64, endpoint: Option<Url>) {
        metrics::record_upstream_gone();
        let errors = endpoint.as_ref().and_then(|e| self.registry.record_error(e));

        self.session.preferred_endpoint = self.registry.select(&self.session.tier);

        if self.reconnect_at.is_some() {
            tracing::debug!(session_id = %self.session.id, generation, "Reconnect already scheduled");
            return;
        }

        let backoff = self.settings.reconnect_backoff;
        self.session.counters.reconnects += 1;
        self.reconnect_at = Some(Instant::now() + backoff);

        tracing::warn!(
            session_id = %self.session.id,
            generation,
            endpoint = endpoint.as_ref().map(Url::as_str).unwrap_or("unknown"),
            errors = errors.unwrap_or_default(),
            retry_in_ms = backoff.as_millis() as u64,
            next = %self.session.preferred_endpoint,
            "Upstream gone"
        );
    }

    fn discard_pending(&mut self) {
        for (_, mut candidate) in std::mem::take(&mut self.pending) {
            candidate.close();
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut active) = self.session.close() {
            active.close();
        }
        self.discard_pending();
        self.reconnect_at = None;
    }
}
