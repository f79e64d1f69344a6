//! Client socket handling.
//!
//! # Responsibilities
//! - Derive client identity from the peer address and request headers
//! - Pump client frames into the session actor
//! - Write actor frames (relayed messages, pings, close) to the client
//!
//! # Data Flow
//! ```text
//! Client ──── text / pong / close ────→ SessionHandle → session actor
//! Client ←──── text / ping / close ──── ClientLink.outbound
//! ```

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use futures_util::{SinkExt, StreamExt};

use crate::session::{ClientHeaders, ClientMetadata};
use crate::supervisor::{ClientFrame, ClientLink};

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Identity of a connecting client.
///
/// A non-empty `X-Forwarded-For` replaces the peer address.
pub fn client_metadata(addr: SocketAddr, headers: &HeaderMap) -> ClientMetadata {
    let client_headers = ClientHeaders {
        origin: header(headers, "origin"),
        user_agent: header(headers, "user-agent"),
        accept_language: header(headers, "accept-language"),
        x_forwarded_for: header(headers, "x-forwarded-for"),
    };

    let ip = if client_headers.x_forwarded_for.trim().is_empty() {
        addr.ip().to_string()
    } else {
        client_headers.x_forwarded_for.clone()
    };

    ClientMetadata {
        ip,
        headers: client_headers,
    }
}

/// Serve one client socket until either side goes away.
pub async fn serve_client(socket: WebSocket, link: ClientLink) {
    let ClientLink { session, mut outbound } = link;
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                ClientFrame::Text(text) => Message::Text(text.into()),
                ClientFrame::Ping => Message::Ping(Bytes::new()),
                ClientFrame::Close => break,
            };
            if sink.send(message).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => session.text(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => session.text(text),
                    Err(_) => tracing::debug!(session_id = %session.id(), "Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Pong(_))) => session.pong(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session.id(), error = %e, "Client read error");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    session.close();
}
