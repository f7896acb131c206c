//! Wire messages exchanged on the bus.
//!
//! - command payload: the server's numeric record id as a decimal string (`"42"`)
//! - status payload: JSON `{"server_id": 42, "status": "online"}`, unknown fields ignored

use crate::error::BusError;
use crate::topics::{CommandAction, SERVER_STATUS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric record id of a server, as carried on the bus.
pub type ServerId = u64;

/// Externally visible server state. Declaration order is the lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Offline,
    Starting,
    Online,
    Stopping,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Offline => "offline",
            ServerStatus::Starting => "starting",
            ServerStatus::Online => "online",
            ServerStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient lifecycle intent. Never persisted; loss after publish is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleCommand {
    pub server_id: ServerId,
    pub action: CommandAction,
}

impl LifecycleCommand {
    pub fn new(server_id: ServerId, action: CommandAction) -> Self {
        Self { server_id, action }
    }

    pub fn topic(&self) -> &'static str {
        self.action.topic()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.server_id.to_string().into_bytes()
    }

    /// Parses a command received on `topic`. Only plain ASCII digits are accepted.
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, BusError> {
        let action = CommandAction::from_topic(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

        let invalid = |reason: String| BusError::InvalidPayload {
            topic: topic.to_string(),
            reason,
        };

        let text = std::str::from_utf8(payload).map_err(|e| invalid(e.to_string()))?;
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(format!("expected a decimal server id, got {text:?}")));
        }
        let server_id = text.parse::<ServerId>().map_err(|e| invalid(e.to_string()))?;

        Ok(Self { server_id, action })
    }
}

/// Authoritative status update emitted by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub server_id: ServerId,
    pub status: ServerStatus,
}

impl StatusEvent {
    pub fn new(server_id: ServerId, status: ServerStatus) -> Self {
        Self { server_id, status }
    }

    pub fn topic(&self) -> &'static str {
        SERVER_STATUS
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(payload).map_err(|e| BusError::InvalidPayload {
            topic: SERVER_STATUS.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_decimal_payload() {
        let cmd = LifecycleCommand::decode("server.start", b"7").unwrap();
        assert_eq!(cmd, LifecycleCommand::new(7, CommandAction::Start));
        assert_eq!(LifecycleCommand::new(42, CommandAction::Stop).encode(), b"42".to_vec());
    }

    #[test]
    fn test_command_rejects_malformed_payloads() {
        for payload in [&b"abc"[..], b"", b"-1", b"+7", b" 7", b"7.0", b"99999999999999999999999"] {
            let err = LifecycleCommand::decode("server.stop", payload).unwrap_err();
            assert!(matches!(err, BusError::InvalidPayload { .. }), "{payload:?} -> {err}");
        }
        assert!(matches!(
            LifecycleCommand::decode("server.status", b"7"),
            Err(BusError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_status_event_ignores_unknown_fields() {
        let event = StatusEvent::decode(br#"{"status":"online","extra":true,"server_id":9}"#).unwrap();
        assert_eq!(event, StatusEvent::new(9, ServerStatus::Online));

        let json: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"server_id": 9, "status": "online"}));
    }

    #[test]
    fn test_status_event_rejects_unknown_status() {
        assert!(StatusEvent::decode(br#"{"server_id":1,"status":"exploded"}"#).is_err());
    }

    #[test]
    fn test_status_order() {
        assert!(ServerStatus::Offline < ServerStatus::Starting);
        assert!(ServerStatus::Starting < ServerStatus::Online);
        assert!(ServerStatus::Online < ServerStatus::Stopping);
        assert_eq!(ServerStatus::default(), ServerStatus::Offline);
    }
}
