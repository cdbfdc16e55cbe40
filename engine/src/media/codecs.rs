//! Codec Registry and Preference Ordering
//!
//! Registers the audio/video codecs every peer connection negotiates with
//! and produces preference orderings for video transceivers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::error::EngineError;

/// Requested video codec preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecPreference {
    /// Resolves to AV1 first.
    #[default]
    Auto,
    Av1,
    Vp9,
    H264,
    Vp8,
}

impl CodecPreference {
    /// MIME type of the preferred codec.
    #[must_use]
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Auto | Self::Av1 => "video/AV1",
            Self::Vp9 => "video/VP9",
            Self::H264 => "video/H264",
            Self::Vp8 => "video/VP8",
        }
    }
}

fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".to_string(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "ccm".to_string(),
            parameter: "fir".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "pli".to_string(),
        },
    ]
}

/// Opus capability used for local microphone tracks.
#[must_use]
pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// VP9 capability used for local screen tracks.
#[must_use]
pub fn vp9_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP9".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "profile-id=0".to_string(),
        rtcp_feedback: vec![],
    }
}

/// The video codecs every session registers, in platform order.
#[must_use]
pub fn video_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: "video/AV1".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 45,
            ..Default::default()
        },
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: "video/VP9".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "profile-id=0".to_string(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 98,
            ..Default::default()
        },
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 96,
            ..Default::default()
        },
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 102,
            ..Default::default()
        },
    ]
}

/// Register Opus plus the video codec set on a media engine.
pub fn register_codecs(media_engine: &mut MediaEngine) -> Result<(), webrtc::Error> {
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: opus_capability(),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    for codec in video_codecs() {
        media_engine.register_codec(codec, RTPCodecType::Video)?;
    }

    Ok(())
}

/// Build the shared WebRTC API: registered codecs plus default
/// interceptors.
pub fn build_api() -> Result<Arc<API>, EngineError> {
    let mut media_engine = MediaEngine::default();
    register_codecs(&mut media_engine)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    Ok(Arc::new(api))
}

/// Order the registered video codecs with the preferred codec first.
/// Ties preserve platform (registration) order.
#[must_use]
pub fn preference_order(preference: CodecPreference) -> Vec<RTCRtpCodecParameters> {
    let codecs = video_codecs();
    let mime = preference.mime();

    let (mut preferred, rest): (Vec<_>, Vec<_>) = codecs
        .into_iter()
        .partition(|c| c.capability.mime_type == mime);

    preferred.extend(rest);
    preferred
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mimes(codecs: &[RTCRtpCodecParameters]) -> Vec<&str> {
        codecs
            .iter()
            .map(|c| c.capability.mime_type.as_str())
            .collect()
    }

    #[test]
    fn auto_resolves_to_av1_first() {
        let order = preference_order(CodecPreference::Auto);
        assert_eq!(
            mimes(&order),
            vec!["video/AV1", "video/VP9", "video/VP8", "video/H264"]
        );
    }

    #[test]
    fn explicit_preference_moves_to_front_preserving_ties() {
        let order = preference_order(CodecPreference::H264);
        assert_eq!(
            mimes(&order),
            vec!["video/H264", "video/AV1", "video/VP9", "video/VP8"]
        );

        let order = preference_order(CodecPreference::Vp8);
        assert_eq!(
            mimes(&order),
            vec!["video/VP8", "video/AV1", "video/VP9", "video/H264"]
        );
    }

    #[test]
    fn ordering_keeps_every_codec() {
        for pref in [
            CodecPreference::Auto,
            CodecPreference::Av1,
            CodecPreference::Vp9,
            CodecPreference::H264,
            CodecPreference::Vp8,
        ] {
            assert_eq!(preference_order(pref).len(), video_codecs().len());
        }
    }

    #[test]
    fn api_builds_with_registered_codecs() {
        assert!(build_api().is_ok());
    }
}
