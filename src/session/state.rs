//! Per-client session state.
//!
//! # Responsibilities
//! - Identity, counters, tier preference of one client
//! - Message buffer for traffic that has no upstream to go to
//! - Ownership of the promoted upstream (`active`)
//! - Read-only projections for the client (`state`) and for admin

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;

use crate::registry::Tier;
use crate::session::subscriptions::SubscriptionLog;
use crate::upstream::UpstreamHandle;

/// Global counter for session IDs.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Request headers kept for attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHeaders {
    pub origin: String,
    pub user_agent: String,
    pub accept_language: String,
    pub x_forwarded_for: String,
}

/// What the transport layer knows about a new client.
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata {
    /// Peer address, or the forwarded-for header when present.
    pub ip: String,
    pub headers: ClientHeaders,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    /// Messages relayed from backends to the client.
    pub rx_count: u64,
    pub rx_bytes: u64,
    /// Messages received from the client, control messages included.
    pub tx_count: u64,
    pub tx_bytes: u64,
    /// Reconnects scheduled after an ungraceful upstream loss.
    pub reconnects: u64,
}

/// Reply to a client `state` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    /// Endpoint of the promoted upstream, if any.
    pub endpoint: Option<String>,
    pub preferred_server: String,
    pub tier: Tier,
    pub counters: SessionCounters,
    pub headers: ClientHeaders,
    /// Connection attempts made so far (the session generation).
    pub uplink_count: u64,
    /// Unix time in milliseconds.
    pub connect_moment: u64,
}

/// Either a length or the full contents, depending on the admin request.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Projection<T> {
    Count(usize),
    Contents(Vec<T>),
}

/// Admin view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub ip: String,
    pub uptime_secs: u64,
    pub state: StateReport,
    pub queue: Projection<String>,
    pub subscriptions: Projection<Map<String, Value>>,
}

/// State of one connected client.
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub ip: String,
    pub headers: ClientHeaders,
    pub connect_moment: SystemTime,
    started: Instant,
    pub tier: Tier,
    /// Last endpoint selected for this session.
    pub preferred_endpoint: Url,
    generation: u64,
    /// Client messages waiting for an upstream, oldest first.
    pub buffer: VecDeque<String>,
    pub subscriptions: SubscriptionLog,
    pub counters: SessionCounters,
    active: Option<UpstreamHandle>,
    closed: bool,
}

impl ClientSession {
    pub fn new(id: SessionId, metadata: ClientMetadata, tier: Tier, preferred_endpoint: Url) -> Self {
        Self {
            id,
            ip: metadata.ip,
            headers: metadata.headers,
            connect_moment: SystemTime::now(),
            started: Instant::now(),
            tier,
            preferred_endpoint,
            generation: 0,
            buffer: VecDeque::new(),
            subscriptions: SubscriptionLog::new(),
            counters: SessionCounters::default(),
            active: None,
            closed: false,
        }
    }

    /// Current fencing token.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Advance the generation for a new connection attempt.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn active(&self) -> Option<&UpstreamHandle> {
        self.active.as_ref()
    }

    /// Endpoint of the promoted upstream.
    pub fn active_endpoint(&self) -> Option<&Url> {
        self.active.as_ref().map(UpstreamHandle::endpoint)
    }

    /// Install a promoted upstream, returning the one it replaces.
    pub fn set_active(&mut self, upstream: UpstreamHandle) -> Option<UpstreamHandle> {
        self.active.replace(upstream)
    }

    pub fn take_active(&mut self) -> Option<UpstreamHandle> {
        self.active.take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark closed and give up the active upstream so the caller can close it.
    pub fn close(&mut self) -> Option<UpstreamHandle> {
        self.closed = true;
        self.active.take()
    }

    /// Record a message received from the client.
    pub fn count_tx(&mut self, raw: &str) {
        self.counters.tx_count += 1;
        self.counters.tx_bytes += raw.len() as u64;
    }

    /// Record a message relayed to the client.
    pub fn count_rx(&mut self, raw: &str) {
        self.counters.rx_count += 1;
        self.counters.rx_bytes += raw.len() as u64;
    }

    /// Send through the active upstream, or buffer. Returns whether it was sent.
    pub fn relay(&mut self, raw: String) -> bool {
        let rejected = match &self.active {
            Some(upstream) => match upstream.send(raw, &mut self.subscriptions) {
                Ok(()) => return true,
                Err(raw) => raw,
            },
            None => raw,
        };
        tracing::debug!(session_id = %self.id, buffered = self.buffer.len() + 1, "No open upstream, buffering message");
        self.buffer.push_back(rejected);
        false
    }

    /// Flush buffered messages through the active upstream in FIFO order.
    ///
    /// Stops at the first message the upstream refuses; it and everything
    /// after it stay buffered. Returns the number flushed.
    pub fn flush_buffer(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(raw) = self.buffer.pop_front() {
            let Some(upstream) = &self.active else {
                self.buffer.push_front(raw);
                break;
            };
            if let Err(raw) = upstream.send(raw, &mut self.subscriptions) {
                self.buffer.push_front(raw);
                break;
            }
            flushed += 1;
        }
        flushed
    }

    /// Put messages an upstream never wrote back at the head of the buffer.
    pub fn requeue_front(&mut self, unsent: Vec<String>) {
        for raw in unsent.into_iter().rev() {
            self.buffer.push_front(raw);
        }
    }

    pub fn state_report(&self) -> StateReport {
        StateReport {
            endpoint: self.active_endpoint().map(Url::to_string),
            preferred_server: self.preferred_endpoint.to_string(),
            tier: self.tier.clone(),
            counters: self.counters,
            headers: self.headers.clone(),
            uplink_count: self.generation,
            connect_moment: self
                .connect_moment
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    pub fn snapshot(&self, details: bool) -> SessionSnapshot {
        let (queue, subscriptions) = if details {
            (
                Projection::Contents(self.buffer.iter().cloned().collect()),
                Projection::Contents(self.subscriptions.entries().iter().map(|e| e.to_object()).collect()),
            )
        } else {
            (
                Projection::Count(self.buffer.len()),
                Projection::Count(self.subscriptions.len()),
            )
        };

        SessionSnapshot {
            id: self.id,
            ip: self.ip.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            state: self.state_report(),
            queue,
            subscriptions,
        }
    }
}
