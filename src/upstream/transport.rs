//! Upstream transport.
//!
//! # Responsibilities
//! - Open a WebSocket to a backend, carrying the client's address as headers
//! - Expose the socket as a pair of frame channels
//! - Classify transport errors (benign early close vs. anomaly)
//!
//! # Design Decisions
//! - The connection task never touches the socket; reader and writer pumps do
//! - `Connector` is the seam tests use to substitute in-memory backends

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{HeaderName, HeaderValue},
    Message,
};
use url::Url;

/// Header carrying the originating client address.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Header carrying the client identity for backend-side attribution.
pub const X_USER: &str = "x-user";

/// A frame on the upstream socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// An open upstream socket.
///
/// Dropping `outbound` closes the socket. `inbound` ends when the far side
/// goes away.
#[derive(Debug)]
pub struct UpstreamLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Errors opening or using an upstream socket.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connection closed before it was established")]
    ClosedEarly,

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("connection refused by {0}")]
    Refused(String),

    #[error("websocket error: {0}")]
    WebSocket(tungstenite::Error),
}

impl UpstreamError {
    /// Known race that is not worth reporting above debug level.
    pub fn is_benign(&self) -> bool {
        matches!(self, UpstreamError::ClosedEarly)
    }
}

impl From<tungstenite::Error> for UpstreamError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                UpstreamError::ClosedEarly
            }
            other => UpstreamError::WebSocket(other),
        }
    }
}

/// Opens upstream sockets.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        endpoint: &Url,
        forwarded_for: &str,
    ) -> BoxFuture<'static, Result<UpstreamLink, UpstreamError>>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Build the upgrade request for an endpoint.
///
/// The fragment only distinguishes registry entries and is not sent.
pub fn upstream_request(
    endpoint: &Url,
    forwarded_for: &str,
) -> Result<tungstenite::handshake::client::Request, UpstreamError> {
    let mut target = endpoint.clone();
    target.set_fragment(None);

    let mut request = target
        .as_str()
        .into_client_request()
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

    if !forwarded_for.is_empty() {
        let value = HeaderValue::from_str(forwarded_for)
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value.clone());
        headers.insert(HeaderName::from_static(X_USER), value);
    }
    Ok(request)
}

impl Connector for TungsteniteConnector {
    fn connect(
        &self,
        endpoint: &Url,
        forwarded_for: &str,
    ) -> BoxFuture<'static, Result<UpstreamLink, UpstreamError>> {
        let request = upstream_request(endpoint, forwarded_for);
        let endpoint = endpoint.clone();

        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(request?).await?;
            let (mut sink, mut source) = stream.split();

            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
            let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

            // Writer pump: ends with a close frame once the owner drops `outbound`.
            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let message = match frame {
                        Frame::Text(text) => Message::Text(text.into()),
                        Frame::Ping(payload) => Message::Ping(payload.into()),
                        Frame::Pong(payload) => Message::Pong(payload.into()),
                    };
                    if sink.send(message).await.is_err() {
                        return;
                    }
                }
                let _ = sink.close().await;
            });

            // Reader pump: dropping `inbound_tx` signals the loss upward.
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    let frame = match message {
                        Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                        Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => Frame::Text(text),
                            Err(_) => {
                                tracing::debug!(endpoint = %endpoint, "Dropping non UTF-8 binary frame");
                                continue;
                            }
                        },
                        Ok(Message::Ping(payload)) => Frame::Ping(payload.to_vec()),
                        Ok(Message::Pong(payload)) => Frame::Pong(payload.to_vec()),
                        Ok(Message::Close(_)) => break,
                        Ok(Message::Frame(_)) => continue,
                        Err(e) => {
                            let e = UpstreamError::from(e);
                            if e.is_benign() {
                                tracing::debug!(endpoint = %endpoint, error = %e, "Upstream read ended");
                            } else {
                                tracing::warn!(endpoint = %endpoint, error = %e, "Upstream read error");
                            }
                            break;
                        }
                    };
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
            });

            Ok(UpstreamLink { outbound, inbound })
        })
    }
}
