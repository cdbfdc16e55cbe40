//! Participant Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A room participant as reported by the rendezvous server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Participant id, unique and stable within a room.
    pub id: String,
    /// Display name, if the participant supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// When the participant joined the room.
    pub joined_at: DateTime<Utc>,
}

impl ParticipantInfo {
    /// Create a participant record joined now.
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            joined_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_omitted_when_absent() {
        let info = ParticipantInfo::new("A", None);
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"id\":\"A\""));
        assert!(json.contains("joinedAt"));
        assert!(!json.contains("name"));
    }

    #[test]
    fn round_trip_with_name() {
        let info = ParticipantInfo::new("B", Some("Bea".into()));
        let json = serde_json::to_string(&info).unwrap();
        let back: ParticipantInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
