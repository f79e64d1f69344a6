//! Client control messages and the tier policy hook.
//!
//! A client message is a control message when it is small enough to inspect
//! and parses as a JSON object carrying an `__api` key. Control messages are
//! never relayed upstream.

use std::fmt::Debug;

use serde_json::Value;

use crate::registry::Tier;
use crate::session::ClientSession;

/// Key marking a client message as addressed to the proxy.
pub const CONTROL_KEY: &str = "__api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Reply with a status snapshot.
    State,
    /// Move to the upgrade tier.
    Upgrade,
    /// Move to the downgrade tier.
    Downgrade,
    /// Intercepted and ignored.
    Unknown(String),
}

/// Parse a control message. Oversized or malformed input is relay traffic.
pub fn parse_control(raw: &str, inspect_limit: usize) -> Option<ControlMessage> {
    if raw.len() > inspect_limit {
        return None;
    }
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(raw) else {
        return None;
    };
    let api = object.get(CONTROL_KEY)?;

    let control = match api.as_str() {
        Some("state") => ControlMessage::State,
        Some("upgrade") => ControlMessage::Upgrade,
        Some("downgrade") => ControlMessage::Downgrade,
        Some(other) => ControlMessage::Unknown(other.to_string()),
        None => ControlMessage::Unknown(api.to_string()),
    };
    Some(control)
}

/// Decides whether a session may switch tiers.
///
/// Entitlement checks (payments, accounts) plug in here.
pub trait TierPolicy: Send + Sync + Debug {
    fn allow(&self, session: &ClientSession, target: &Tier) -> bool;
}

/// Lets every session switch to any tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllTiers;

impl TierPolicy for AllowAllTiers {
    fn allow(&self, _session: &ClientSession, _target: &Tier) -> bool {
        true
    }
}
