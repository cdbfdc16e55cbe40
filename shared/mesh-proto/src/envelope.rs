//! Signaling Envelopes
//!
//! The closed, tagged union relayed between clients and the rendezvous
//! server. Unknown tags fail to parse and are dropped at the boundary by
//! the receiver; they never reach session code.

use serde::{Deserialize, Serialize};

use crate::participant::ParticipantInfo;

/// One signaling message. `senderId` on addressed variants is injected by
/// the server on relay; receivers route by it rather than trusting any
/// sender-supplied id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Envelope {
    /// Client requests membership in a room. Without a participant id the
    /// server assigns a fresh one.
    Join {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Server acknowledges a join, enumerating the members that were
    /// already in the room (excluding the new joiner), in join order.
    JoinAck {
        room_id: String,
        participant_id: String,
        existing: Vec<ParticipantInfo>,
    },
    /// A participant left (client-sent or server-derived from a closed
    /// connection).
    Leave { participant_id: String },
    /// Server notifies pre-existing members of a new participant.
    PeerJoined {
        participant_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Server notifies remaining members of a departure.
    PeerLeft { participant_id: String },
    /// SDP offer addressed to one peer.
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        target_id: String,
        sdp: String,
    },
    /// SDP answer addressed to one peer.
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        target_id: String,
        sdp: String,
    },
    /// ICE candidate addressed to one peer.
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        target_id: String,
        candidate: String,
    },
    /// Heartbeat.
    Ping,
    /// Heartbeat response.
    Pong,
}

impl Envelope {
    /// Target participant for addressed variants.
    #[must_use]
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Offer { target_id, .. }
            | Self::Answer { target_id, .. }
            | Self::IceCandidate { target_id, .. } => Some(target_id),
            _ => None,
        }
    }

    /// Sender id on addressed variants, once the server has injected it.
    #[must_use]
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            Self::Offer { sender_id, .. }
            | Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. } => sender_id.as_deref(),
            _ => None,
        }
    }

    /// Stamp the relaying server's record of the sender onto an addressed
    /// envelope. Other variants are left untouched.
    pub fn set_sender(&mut self, id: &str) {
        match self {
            Self::Offer { sender_id, .. }
            | Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. } => *sender_id = Some(id.to_string()),
            _ => {}
        }
    }

    /// Whether this envelope is heartbeat traffic.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }

    /// Variant tag, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "Join",
            Self::JoinAck { .. } => "JoinAck",
            Self::Leave { .. } => "Leave",
            Self::PeerJoined { .. } => "PeerJoined",
            Self::PeerLeft { .. } => "PeerLeft",
            Self::Offer { .. } => "Offer",
            Self::Answer { .. } => "Answer",
            Self::IceCandidate { .. } => "IceCandidate",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
        }
    }
}
