//! Meshtalk Client Engine
//!
//! Full-mesh peer-to-peer voice and screen sharing for small groups. A
//! lightweight rendezvous server relays signaling envelopes; media flows
//! directly between peers over encrypted WebRTC sessions.
//!
//! The entry point is [`MeshController`]: join a room, start the
//! microphone or a screen share, and subscribe to [`MeshEvent`]s for
//! remote tracks, speaking flags, and chat.

pub mod channel;
pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod signaling;

pub use channel::{DataKind, DataMessage};
pub use config::{IceServerConfig, MeshConfig};
pub use error::EngineError;
pub use media::quality::{ContentHint, QualityProfile, Resolution};
pub use media::{MediaEvent, MediaPipeline, TrackSource};
pub use mesh::{MeshController, MeshEvent};
pub use peer::{NegotiationState, PeerSession, Role};
pub use signaling::{ConnectionStatus, SignalingClient, SignalingEvent};
