//! Shared utilities for integration tests.
//!
//! `FakeConnector` stands in for the network: every upstream attempt the
//! proxy makes shows up as a `FakeBackend` the test drives by hand.
//! Heartbeats are answered automatically and never reach the test.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use uplink_proxy::registry::{BackendDescriptor, BackendRegistry, Tier};
use uplink_proxy::session::{ClientHeaders, ClientMetadata, SessionId};
use uplink_proxy::supervisor::{ClientFrame, ClientLink, ConnectionSupervisor, SupervisorSettings};
use uplink_proxy::upstream::sentinel::{self, Sentinel};
use uplink_proxy::upstream::{Connector, Frame, UpstreamError, UpstreamLink};

pub const FALLBACK: &str = "ws://fallback.test/";

/// Generous wait for something that should happen.
pub const WAIT: Duration = Duration::from_secs(60);

pub fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

/// One upstream connection opened by the proxy.
pub struct FakeBackend {
    pub endpoint: Url,
    pub forwarded_for: String,
    from_proxy: mpsc::UnboundedReceiver<Frame>,
    to_proxy: mpsc::UnboundedSender<Frame>,
    muted: Arc<AtomicBool>,
}

impl FakeBackend {
    /// Next text frame written by the proxy.
    pub async fn recv_text(&mut self) -> String {
        loop {
            let frame = tokio::time::timeout(WAIT, self.from_proxy.recv())
                .await
                .expect("timed out waiting for proxy frame")
                .expect("proxy closed the connection");
            if let Frame::Text(text) = frame {
                return text;
            }
        }
    }

    pub fn send_text(&self, text: &str) {
        self.to_proxy.send(Frame::Text(text.to_string())).unwrap();
    }

    /// Wait for the connection test; returns the replay frames sent before it.
    pub async fn await_connection_test(&mut self) -> Vec<String> {
        let mut replayed = Vec::new();
        loop {
            let text = self.recv_text().await;
            match sentinel::classify(&text) {
                Some(Sentinel::ConnectionTest) => return replayed,
                Some(Sentinel::Replay) => replayed.push(text),
                _ => panic!("unexpected frame before connection test: {}", text),
            }
        }
    }

    /// Answer the connection test, passing the health check.
    pub fn ack(&self) {
        self.send_text(r#"{"id":"NEW_CONNECTION_TEST","result":{},"status":"success","type":"response"}"#);
    }

    /// Full open handshake. Returns the replayed subscriptions.
    pub async fn handshake(&mut self) -> Vec<String> {
        let replayed = self.await_connection_test().await;
        self.ack();
        replayed
    }

    /// Stop answering heartbeats. Any heartbeat reply would also pass a
    /// pending health check.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    /// Wait until the proxy drops this connection.
    pub async fn closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.from_proxy.recv().await.is_some() {}
        })
        .await
        .expect("proxy kept the connection open");
    }
}

/// Connector whose "network" is a channel of `FakeBackend`s.
pub struct FakeConnector {
    backends: mpsc::UnboundedSender<FakeBackend>,
    refused: Mutex<HashSet<Url>>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, BackendQueue) {
        let (backends, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            backends,
            refused: Mutex::new(HashSet::new()),
        });
        (connector, BackendQueue { rx })
    }

    pub fn refuse(&self, endpoint: &str) {
        self.refused.lock().unwrap().insert(url(endpoint));
    }

    pub fn accept(&self, endpoint: &str) {
        self.refused.lock().unwrap().remove(&url(endpoint));
    }
}

impl Connector for FakeConnector {
    fn connect(&self, endpoint: &Url, forwarded_for: &str) -> BoxFuture<'static, Result<UpstreamLink, UpstreamError>> {
        if self.refused.lock().unwrap().contains(endpoint) {
            let endpoint = endpoint.to_string();
            return Box::pin(async move { Err(UpstreamError::Refused(endpoint)) });
        }

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (to_proxy, inbound) = mpsc::unbounded_channel::<Frame>();
        let (forward, from_proxy) = mpsc::unbounded_channel::<Frame>();

        // Answer heartbeats without keeping the connection alive on our own.
        let pong = to_proxy.downgrade();
        let muted = Arc::new(AtomicBool::new(false));
        let silenced = Arc::clone(&muted);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Frame::Text(text) = &frame {
                    if sentinel::classify(text) == Some(Sentinel::Heartbeat) {
                        if silenced.load(Ordering::SeqCst) {
                            continue;
                        }
                        if let Some(to_proxy) = pong.upgrade() {
                            let reply = r#"{"id":"CONNECTION_PING_TEST","result":{},"status":"success","type":"response"}"#;
                            let _ = to_proxy.send(Frame::Text(reply.to_string()));
                        }
                        continue;
                    }
                }
                if forward.send(frame).is_err() {
                    break;
                }
            }
        });

        let backend = FakeBackend {
            endpoint: endpoint.clone(),
            forwarded_for: forwarded_for.to_string(),
            from_proxy,
            to_proxy,
            muted,
        };
        let _ = self.backends.send(backend);

        Box::pin(async move { Ok(UpstreamLink { outbound, inbound }) })
    }
}

/// Upstream connections in the order the proxy opened them.
pub struct BackendQueue {
    rx: mpsc::UnboundedReceiver<FakeBackend>,
}

impl BackendQueue {
    pub async fn next(&mut self) -> FakeBackend {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for an upstream attempt")
            .unwrap()
    }

    /// Assert no upstream attempt is made within `wait`.
    pub async fn expect_none(&mut self, wait: Duration) {
        if let Ok(Some(backend)) = tokio::time::timeout(wait, self.rx.recv()).await {
            panic!("unexpected upstream attempt to {}", backend.endpoint);
        }
    }
}

/// A client session driven directly through the supervisor.
pub struct TestClient {
    link: ClientLink,
}

impl TestClient {
    pub fn id(&self) -> SessionId {
        self.link.session.id()
    }

    pub fn send(&self, text: &str) {
        self.link.session.text(text.to_string());
    }

    pub fn close(&self) {
        self.link.session.close();
    }

    pub fn pong(&self) {
        self.link.session.pong();
    }

    /// Next frame exactly as the proxy wrote it; pings are not answered.
    pub async fn recv_frame(&mut self) -> Option<ClientFrame> {
        tokio::time::timeout(WAIT, self.link.outbound.recv())
            .await
            .expect("timed out waiting for client frame")
    }

    /// Next frame other than a ping; pings are answered.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        loop {
            let frame = tokio::time::timeout(WAIT, self.link.outbound.recv())
                .await
                .expect("timed out waiting for client frame");
            match frame {
                Some(ClientFrame::Ping) => self.link.session.pong(),
                other => return other,
            }
        }
    }

    pub async fn recv_text(&mut self) -> String {
        match self.next_frame().await {
            Some(ClientFrame::Text(text)) => text,
            other => panic!("expected text, got {:?}", other),
        }
    }

    /// Ask the proxy for this session's state.
    pub async fn state(&mut self) -> Value {
        self.send(r#"{"__api":"state"}"#);
        serde_json::from_str(&self.recv_text().await).unwrap()
    }
}

pub struct Harness {
    pub supervisor: ConnectionSupervisor,
    pub registry: Arc<BackendRegistry>,
    pub connector: Arc<FakeConnector>,
    pub backends: BackendQueue,
}

impl Harness {
    pub fn connect(&self) -> TestClient {
        let metadata = ClientMetadata {
            ip: "198.51.100.20".to_string(),
            headers: ClientHeaders {
                origin: "https://wallet.example".to_string(),
                ..Default::default()
            },
        };
        TestClient {
            link: self.supervisor.on_client_connect(metadata),
        }
    }

    pub fn backend(&self, endpoint: &str) -> BackendDescriptor {
        let endpoint = url(endpoint);
        self.registry
            .list()
            .into_iter()
            .find(|b| b.endpoint == endpoint)
            .expect("backend not registered")
    }
}

/// Supervisor settings with client liveness pushed out of the way.
pub fn test_settings() -> SupervisorSettings {
    let mut settings = SupervisorSettings::default();
    settings.client_ping_interval = Duration::from_secs(3600);
    settings.client_pong_grace = Duration::from_secs(7200);
    settings
}

/// Build a supervisor over a fake network with the given healthy backends.
pub fn harness(backends: &[(Tier, &str)]) -> Harness {
    harness_with(backends, test_settings())
}

pub fn harness_with(backends: &[(Tier, &str)], settings: SupervisorSettings) -> Harness {
    let registry = Arc::new(BackendRegistry::new(url(FALLBACK)));
    for (tier, endpoint) in backends {
        registry.register(tier.clone(), url(endpoint), true).unwrap();
    }

    let (connector, queue) = FakeConnector::new();
    let supervisor = ConnectionSupervisor::new(
        Arc::clone(&registry),
        connector.clone(),
        settings,
    );

    Harness {
        supervisor,
        registry,
        connector,
        backends: queue,
    }
}
