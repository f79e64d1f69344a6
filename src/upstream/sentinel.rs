//! Reserved message shapes used between the proxy and its backends.
//!
//! None of these are relay traffic. Classification only looks at the head
//! of a message so large payloads are never scanned in full.

use serde_json::{Map, Value};

/// Id of the one-time ping sent after open; its reply passes the health check.
pub const CONNECTION_TEST_ID: &str = "NEW_CONNECTION_TEST";

/// Id of the recurring heartbeat ping.
pub const HEARTBEAT_ID: &str = "CONNECTION_PING_TEST";

/// Id attached to re-sent subscription commands.
pub const REPLAY_MARKER: &str = "REPLAYED_SUBSCRIPTION";

/// Bytes of a message inspected for a sentinel id.
pub const CLASSIFY_WINDOW: usize = 100;

/// Kind of reserved message found at the head of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    ConnectionTest,
    Heartbeat,
    Replay,
}

fn ping(id: &str) -> String {
    serde_json::json!({ "id": id, "command": "ping" }).to_string()
}

pub fn connection_test_frame() -> String {
    ping(CONNECTION_TEST_ID)
}

pub fn heartbeat_frame() -> String {
    ping(HEARTBEAT_ID)
}

/// Re-tag a logged subscription command as a replay.
pub fn replay_frame(command: &Map<String, Value>) -> String {
    let mut tagged = command.clone();
    tagged.insert("id".to_string(), Value::String(REPLAY_MARKER.to_string()));
    Value::Object(tagged).to_string()
}

/// Longest prefix of `raw` no longer than `max` bytes, cut on a char boundary.
pub fn head(raw: &str, max: usize) -> &str {
    if raw.len() <= max {
        return raw;
    }
    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

/// Classify a message by the sentinel id in its first bytes, if any.
pub fn classify(raw: &str) -> Option<Sentinel> {
    let window = head(raw, CLASSIFY_WINDOW);
    if window.contains(HEARTBEAT_ID) {
        Some(Sentinel::Heartbeat)
    } else if window.contains(CONNECTION_TEST_ID) {
        Some(Sentinel::ConnectionTest)
    } else if window.contains(REPLAY_MARKER) {
        Some(Sentinel::Replay)
    } else {
        None
    }
}
