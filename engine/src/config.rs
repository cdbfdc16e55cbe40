//! Engine Configuration

use crate::media::quality::QualityProfile;
use crate::media::vad::DEFAULT_VAD_THRESHOLD;

/// ICE server configuration
#[derive(Debug, Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration for a mesh controller.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Rendezvous server base URL (`http://`, `https://`, `ws://` or `wss://`).
    pub server_url: String,
    /// Display name announced on join.
    pub display_name: Option<String>,
    /// Preassigned participant id; `None` lets the server assign one.
    pub participant_id: Option<String>,
    /// ICE servers used for every peer connection.
    pub ice_servers: Vec<IceServerConfig>,
    /// Quality profile applied to screen shares and codec preference.
    pub quality: QualityProfile,
    /// Voice activity threshold on the 0-255 magnitude scale.
    pub vad_threshold: u8,
}

impl MeshConfig {
    /// Configuration with defaults for everything but the server URL.
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            display_name: None,
            participant_id: None,
            ice_servers: vec![IceServerConfig::default()],
            quality: QualityProfile::default(),
            vad_threshold: DEFAULT_VAD_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_stun_and_vad_threshold() {
        let config = MeshConfig::new("ws://localhost:8080");
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
        assert_eq!(config.vad_threshold, DEFAULT_VAD_THRESHOLD);
        assert!(config.participant_id.is_none());
    }
}
