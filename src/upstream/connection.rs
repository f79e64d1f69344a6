//! Upstream connection lifecycle.
//!
//! # Responsibilities
//! - Open the transport under a connect deadline
//! - Heartbeat the backend and detect a dead transport
//! - Run the open-handshake health check (replay + connection test)
//! - Relay frames between the session actor and the backend
//!
//! # State machine
//! ```text
//! Connecting → HealthChecking → Promoted → Draining → Closed
//!      └──────────────┴──────────────────────────────→ Closed (timeout/error)
//! ```
//!
//! The task side (`UpstreamConnection`) owns the transport and its timers.
//! The session side (`UpstreamHandle`) owns the command channel; dropping it
//! closes the connection on purpose.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendError};
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use crate::config::ProxyConfig;
use crate::session::subscriptions::{SubscriptionCommand, SubscriptionLog};
use crate::upstream::sentinel::{self, Sentinel};
use crate::upstream::transport::{Connector, Frame, UpstreamLink};

/// Timers and limits for one upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_grace: Duration,
    pub health_check_timeout: Duration,
    /// Outbound messages up to this size are checked for subscription commands.
    pub subscription_inspect_limit: usize,
}

impl UpstreamSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.timings.connect_timeout(),
            heartbeat_interval: config.timings.heartbeat_interval(),
            pong_grace: config.timings.heartbeat_grace(),
            health_check_timeout: config.timings.health_check_timeout(),
            subscription_inspect_limit: config.limits.subscription_inspect_bytes,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Commands from the session actor to an upstream task.
#[derive(Debug)]
pub enum UpstreamCommand {
    Send(String),
    /// Send the replay frames, then the connection test, and arm the health check.
    BeginHealthCheck { replay: Vec<String> },
    Close,
}

/// Why an upstream closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The session asked for it (or dropped its handle).
    Requested,
    /// No inbound message within the health-check window.
    HealthCheckFailed,
    /// Connect failure, dead heartbeat or far-side close.
    Lost,
}

impl CloseCause {
    pub fn on_purpose(self) -> bool {
        !matches!(self, CloseCause::Lost)
    }
}

/// Lifecycle events reported to the session actor.
#[derive(Debug)]
pub enum UpstreamEvent {
    Opened,
    HealthChecked,
    Message(String),
    /// Terminal. `unsent` holds commands queued but never written, in order.
    Closed { cause: CloseCause, unsent: Vec<String> },
}

/// An event stamped with the generation of the connection that produced it.
#[derive(Debug)]
pub struct UpstreamNotice {
    pub generation: u64,
    pub event: UpstreamEvent,
}

/// Session-side view of an upstream's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Connecting,
    HealthChecking,
    Promoted,
    Draining,
}

/// Owned handle to an upstream task.
#[derive(Debug)]
pub struct UpstreamHandle {
    generation: u64,
    endpoint: Url,
    state: UpstreamState,
    commands: mpsc::UnboundedSender<UpstreamCommand>,
    /// Log entries already sent to this upstream as replays.
    replayed_through: usize,
    inspect_limit: usize,
}

impl UpstreamHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    /// Promoted and the task is still alive.
    pub fn is_open(&self) -> bool {
        self.state == UpstreamState::Promoted && !self.commands.is_closed()
    }

    /// Replay the whole log and start the health check.
    pub fn begin_health_check(&mut self, log: &SubscriptionLog) {
        self.replayed_through = log.len();
        self.state = UpstreamState::HealthChecking;
        let _ = self.commands.send(UpstreamCommand::BeginHealthCheck {
            replay: log.replay_frames(0),
        });
    }

    /// Mark promoted, replaying entries logged since the health check began.
    pub fn promote(&mut self, log: &SubscriptionLog) {
        for frame in log.replay_frames(self.replayed_through) {
            let _ = self.commands.send(UpstreamCommand::Send(frame));
        }
        self.replayed_through = log.len();
        self.state = UpstreamState::Promoted;
    }

    /// Send a client message, logging it if it is a subscription command.
    ///
    /// Hands the message back when this upstream cannot take it.
    pub fn send(&self, raw: String, log: &mut SubscriptionLog) -> Result<(), String> {
        if !self.is_open() {
            return Err(raw);
        }

        let command = if raw.len() <= self.inspect_limit {
            SubscriptionCommand::parse(&raw)
        } else {
            None
        };

        if let Err(SendError(UpstreamCommand::Send(raw))) = self.commands.send(UpstreamCommand::Send(raw)) {
            return Err(raw);
        }

        if let Some(command) = command {
            if log.record(command) {
                tracing::debug!(entries = log.len(), "Subscription logged");
            }
        }
        Ok(())
    }

    /// Close on purpose. The task reports `Closed` when done.
    pub fn close(&mut self) {
        self.state = UpstreamState::Draining;
        let _ = self.commands.send(UpstreamCommand::Close);
    }
}

/// Task side of one upstream connection.
pub struct UpstreamConnection {
    generation: u64,
    endpoint: Url,
    forwarded_for: String,
    settings: UpstreamSettings,
    commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    notices: mpsc::UnboundedSender<UpstreamNotice>,
}

impl UpstreamConnection {
    /// Start connecting in a new task.
    pub fn spawn(
        generation: u64,
        endpoint: Url,
        forwarded_for: String,
        connector: Arc<dyn Connector>,
        settings: UpstreamSettings,
        notices: mpsc::UnboundedSender<UpstreamNotice>,
    ) -> UpstreamHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let inspect_limit = settings.subscription_inspect_limit;

        let connection = Self {
            generation,
            endpoint: endpoint.clone(),
            forwarded_for,
            settings,
            commands,
            notices,
        };
        tokio::spawn(connection.run(connector));

        UpstreamHandle {
            generation,
            endpoint,
            state: UpstreamState::Connecting,
            commands: commands_tx,
            replayed_through: 0,
            inspect_limit,
        }
    }

    fn emit(&self, event: UpstreamEvent) {
        let _ = self.notices.send(UpstreamNotice {
            generation: self.generation,
            event,
        });
    }

    async fn run(mut self, connector: Arc<dyn Connector>) {
        let mut unsent = Vec::new();
        let cause = match self.connect(connector.as_ref(), &mut unsent).await {
            Ok(link) => self.serve(link, &mut unsent).await,
            Err(cause) => cause,
        };
        self.finish(cause, unsent);
    }

    async fn connect(
        &mut self,
        connector: &dyn Connector,
        unsent: &mut Vec<String>,
    ) -> Result<UpstreamLink, CloseCause> {
        tracing::debug!(generation = self.generation, endpoint = %self.endpoint, "Connecting upstream");

        let attempt = tokio::time::timeout(
            self.settings.connect_timeout,
            connector.connect(&self.endpoint, &self.forwarded_for),
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(Ok(link)) => Ok(link),
                        Ok(Err(e)) if e.is_benign() => {
                            tracing::debug!(endpoint = %self.endpoint, error = %e, "Upstream closed during connect");
                            Err(CloseCause::Lost)
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(endpoint = %self.endpoint, error = %e, "Upstream connect failed");
                            Err(CloseCause::Lost)
                        }
                        Err(_) => {
                            tracing::warn!(
                                endpoint = %self.endpoint,
                                timeout_ms = self.settings.connect_timeout.as_millis() as u64,
                                "Upstream connect timed out"
                            );
                            Err(CloseCause::Lost)
                        }
                    };
                }
                command = self.commands.recv() => match command {
                    Some(UpstreamCommand::Send(raw)) => unsent.push(raw),
                    Some(UpstreamCommand::BeginHealthCheck { .. }) => {}
                    Some(UpstreamCommand::Close) | None => return Err(CloseCause::Requested),
                },
            }
        }
    }

    async fn serve(&mut self, link: UpstreamLink, unsent: &mut Vec<String>) -> CloseCause {
        let UpstreamLink { outbound, mut inbound } = link;
        tracing::debug!(generation = self.generation, endpoint = %self.endpoint, "Upstream open");
        self.emit(UpstreamEvent::Opened);

        let interval = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pong_deadline: Option<Instant> = None;
        let mut health_deadline: Option<Instant> = None;
        let mut awaiting_first_message = false;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(UpstreamCommand::Send(raw)) => {
                        if let Err(raw) = write_text(&outbound, raw) {
                            unsent.push(raw);
                            return CloseCause::Lost;
                        }
                    }
                    Some(UpstreamCommand::BeginHealthCheck { replay }) => {
                        tracing::debug!(endpoint = %self.endpoint, subscriptions = replay.len(), "Replaying subscriptions");
                        let frames = replay.into_iter().chain(std::iter::once(sentinel::connection_test_frame()));
                        for frame in frames {
                            if write_text(&outbound, frame).is_err() {
                                return CloseCause::Lost;
                            }
                        }
                        health_deadline = Some(Instant::now() + self.settings.health_check_timeout);
                        awaiting_first_message = true;
                    }
                    Some(UpstreamCommand::Close) | None => return CloseCause::Requested,
                },
                frame = inbound.recv() => match frame {
                    None => {
                        tracing::debug!(endpoint = %self.endpoint, "Upstream transport ended");
                        return CloseCause::Lost;
                    }
                    Some(Frame::Ping(payload)) => {
                        let _ = outbound.send(Frame::Pong(payload));
                    }
                    Some(Frame::Pong(_)) => {}
                    Some(Frame::Text(text)) => {
                        if awaiting_first_message {
                            awaiting_first_message = false;
                            health_deadline = None;
                            self.emit(UpstreamEvent::HealthChecked);
                        }
                        match sentinel::classify(&text) {
                            Some(Sentinel::Heartbeat) => pong_deadline = None,
                            Some(_) => {}
                            None => self.emit(UpstreamEvent::Message(text)),
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    if write_text(&outbound, sentinel::heartbeat_frame()).is_err() {
                        return CloseCause::Lost;
                    }
                    pong_deadline.get_or_insert_with(|| Instant::now() + self.settings.pong_grace);
                }
                _ = sleep_until(pong_deadline) => {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        grace_ms = self.settings.pong_grace.as_millis() as u64,
                        "No heartbeat reply, assuming upstream gone"
                    );
                    return CloseCause::Lost;
                }
                _ = sleep_until(health_deadline) => {
                    tracing::info!(endpoint = %self.endpoint, generation = self.generation, "Upstream failed health check");
                    return CloseCause::HealthCheckFailed;
                }
            }
        }
    }

    fn finish(&mut self, cause: CloseCause, mut unsent: Vec<String>) {
        // Refuse new commands, then collect whatever was still queued.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let UpstreamCommand::Send(raw) = command {
                unsent.push(raw);
            }
        }

        tracing::debug!(
            generation = self.generation,
            endpoint = %self.endpoint,
            ?cause,
            unsent = unsent.len(),
            "Upstream closed"
        );
        self.emit(UpstreamEvent::Closed { cause, unsent });
    }
}

fn write_text(outbound: &mpsc::UnboundedSender<Frame>, text: String) -> Result<(), String> {
    match outbound.send(Frame::Text(text)) {
        Ok(()) => Ok(()),
        Err(SendError(Frame::Text(text))) => Err(text),
        Err(_) => Err(String::new()),
    }
}

/// Sleep until an optional deadline; never completes without one.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
