//! Data Channel Messages
//!
//! JSON messages exchanged over the per-peer `p2d-data` channel. Ordered
//! and reliable within one peer link; no cross-peer ordering. Unknown
//! message types fail to parse and are dropped at the boundary.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Label of the per-peer data channel. The initiator creates it; the
/// responder adopts the peer's channel.
pub const DATA_CHANNEL_LABEL: &str = "p2d-data";

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Text chat line.
    Chat,
    /// Voice-activity update, throttled to the VAD tick.
    Speaking,
    /// Peer control signal (e.g. mute announcements).
    Control,
}

/// One data-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    #[serde(rename = "type")]
    pub kind: DataKind,
    pub payload: Value,
    /// Sender wall-clock, milliseconds since the epoch.
    pub timestamp: i64,
}

impl DataMessage {
    fn new(kind: DataKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// A chat message.
    #[must_use]
    pub fn chat(text: &str) -> Self {
        Self::new(DataKind::Chat, json!({ "text": text }))
    }

    /// A speaking-state update.
    #[must_use]
    pub fn speaking(speaking: bool) -> Self {
        Self::new(DataKind::Speaking, json!({ "speaking": speaking }))
    }

    /// A control message with an arbitrary payload.
    #[must_use]
    pub fn control(payload: Value) -> Self {
        Self::new(DataKind::Control, payload)
    }

    /// Chat text, if this is a chat message.
    #[must_use]
    pub fn chat_text(&self) -> Option<&str> {
        if self.kind == DataKind::Chat {
            self.payload.get("text").and_then(Value::as_str)
        } else {
            None
        }
    }

    /// Speaking flag, if this is a speaking update.
    #[must_use]
    pub fn speaking_flag(&self) -> Option<bool> {
        if self.kind == DataKind::Speaking {
            self.payload.get("speaking").and_then(Value::as_bool)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_wire_shape() {
        let msg = DataMessage::chat("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"chat""#));
        assert!(json.contains(r#""payload":{"text":"hello"}"#));
        assert!(json.contains("timestamp"));

        let back: DataMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chat_text(), Some("hello"));
    }

    #[test]
    fn speaking_flag_round_trip() {
        let msg = DataMessage::speaking(true);
        let back: DataMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.speaking_flag(), Some(true));
        assert_eq!(back.chat_text(), None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = serde_json::from_str::<DataMessage>(
            r#"{"type":"telemetry","payload":{},"timestamp":0}"#,
        );
        assert!(result.is_err());
    }
}
