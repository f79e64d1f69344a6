//! Subscription log.
//!
//! Records the effective `subscribe`/`unsubscribe` commands a client has sent
//! so they can be replayed on a new upstream. Entries are stored without the
//! client's correlation id; replays carry the replay marker instead.

use serde_json::{Map, Value};

use crate::upstream::sentinel::{self, REPLAY_MARKER};

/// Direction of a subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionKind {
    fn parse(command: &str) -> Option<Self> {
        match command.to_lowercase().as_str() {
            "subscribe" => Some(SubscriptionKind::Subscribe),
            "unsubscribe" => Some(SubscriptionKind::Unsubscribe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionKind::Subscribe => "subscribe",
            SubscriptionKind::Unsubscribe => "unsubscribe",
        }
    }

    fn opposite(self) -> Self {
        match self {
            SubscriptionKind::Subscribe => SubscriptionKind::Unsubscribe,
            SubscriptionKind::Unsubscribe => SubscriptionKind::Subscribe,
        }
    }
}

/// One logged command: its kind plus every other field except `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionCommand {
    pub kind: SubscriptionKind,
    pub content: Map<String, Value>,
}

impl SubscriptionCommand {
    /// Extract a loggable subscription command from a raw client message.
    ///
    /// Returns `None` for anything that is not a JSON object with a
    /// `subscribe`/`unsubscribe` command, and for commands already carrying
    /// the replay marker.
    pub fn parse(raw: &str) -> Option<Self> {
        let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(raw) else {
            return None;
        };
        let kind = object
            .get("command")
            .and_then(Value::as_str)
            .and_then(SubscriptionKind::parse)?;

        if let Some(id) = object.remove("id") {
            if id.as_str() == Some(REPLAY_MARKER) {
                return None;
            }
        }
        object.remove("command");

        Some(Self { kind, content: object })
    }

    /// Full command object, as it would be sent (without an id).
    pub fn to_object(&self) -> Map<String, Value> {
        let mut object = self.content.clone();
        object.insert("command".to_string(), Value::String(self.kind.as_str().to_string()));
        object
    }
}

/// Append-only, deduplicated log of subscription commands.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionLog {
    entries: Vec<SubscriptionCommand>,
}

impl SubscriptionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SubscriptionCommand] {
        &self.entries
    }

    /// Append a command unless it would be redundant.
    ///
    /// Refused when it equals the last entry, or when it repeats an earlier
    /// entry with no opposite command for the same content logged since.
    /// Returns whether the command was appended.
    pub fn record(&mut self, command: SubscriptionCommand) -> bool {
        if self.entries.last() == Some(&command) {
            return false;
        }

        if let Some(last_seen) = self.entries.iter().rposition(|e| *e == command) {
            let opposite = command.kind.opposite();
            let reversed = self.entries[last_seen + 1..]
                .iter()
                .any(|e| e.kind == opposite && e.content == command.content);
            if !reversed {
                return false;
            }
        }

        self.entries.push(command);
        true
    }

    /// Replay frames for every entry from index `from` on, in log order.
    pub fn replay_frames(&self, from: usize) -> Vec<String> {
        self.entries
            .iter()
            .skip(from)
            .map(|e| sentinel::replay_frame(&e.to_object()))
            .collect()
    }
}
