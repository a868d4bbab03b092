use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kinds of message pushed to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Connected,
    Heartbeat,
    StatsUpdate,
    Error,
    Pong,
}

/// Outbound message shape: `{type, data, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: None,
        }
    }

    pub fn connected(client_id: &str) -> Self {
        Self::new(
            MessageType::Connected,
            json!({
                "client_id": client_id,
                "message": "Connected to token monitor",
            }),
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, json!({ "status": "ok" }))
    }

    pub fn stats_update(file_path: &str, stats: Option<Value>) -> Self {
        Self::new(
            MessageType::StatsUpdate,
            json!({
                "file_path": file_path,
                "stats": stats,
            }),
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageType::Error, json!({ "message": message.into() }))
    }

    pub fn pong(data: Value) -> Self {
        Self::new(MessageType::Pong, data)
    }

    /// Fill in the generation time unless the caller already set one
    pub fn stamped(mut self) -> Self {
        if self.timestamp.is_none() {
            self.timestamp = Some(Local::now().to_rfc3339_opts(SecondsFormat::Millis, false));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::stats_update("/tmp/stats-cache.json", None).stamped();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "stats_update");
        assert_eq!(value["data"]["file_path"], "/tmp/stats-cache.json");
        assert!(value["data"]["stats"].is_null());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_stamped_keeps_existing_timestamp() {
        let mut envelope = Envelope::heartbeat();
        envelope.timestamp = Some("2026-01-01T00:00:00.000+00:00".to_string());
        let stamped = envelope.clone().stamped();
        assert_eq!(stamped.timestamp, envelope.timestamp);
    }

    #[test]
    fn test_parse_client_message() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(envelope.kind, MessageType::Heartbeat);
        assert!(envelope.data.is_null());
        assert!(serde_json::from_str::<Envelope>(r#"{"type":"ping"}"#).is_err());
    }
}
