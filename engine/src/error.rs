//! Engine Errors

use thiserror::Error;

use crate::media::MediaError;

/// Errors surfaced by the mesh engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Transport-level failure (signaling link).
    #[error("Transport error: {0}")]
    Transport(String),

    /// SDP negotiation failure on a peer session.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Device acquisition or media pipeline failure.
    #[error(transparent)]
    Device(#[from] MediaError),

    /// Malformed or unexpected message from server or peer.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WebRTC stack error.
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Operation requires room membership.
    #[error("Not in a room")]
    NotInRoom,

    /// Already joined a room; leave first.
    #[error("Already in a room")]
    AlreadyInRoom,

    /// Repeated negotiation faults paused retries for this peer.
    #[error("Peer {0} is degraded, retries paused")]
    PeerDegraded(String),
}

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}
