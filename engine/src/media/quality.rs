//! Quality Profiles
//!
//! Resolution, frame-rate, bitrate, codec, and content-hint configuration
//! applied to screen shares and codec negotiation.

use serde::{Deserialize, Serialize};

use super::codecs::CodecPreference;
use super::MediaError;

/// Frame rates a profile may request.
pub const ALLOWED_FRAME_RATES: [u32; 4] = [15, 30, 60, 120];

/// Capture resolution cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Resolution {
    /// No downscale constraint; capture at source resolution.
    #[default]
    #[serde(rename = "native")]
    Native,
    /// 1920x1080 ideal cap.
    #[serde(rename = "1080p")]
    P1080,
    /// 1280x720 ideal cap.
    #[serde(rename = "720p")]
    P720,
}

impl Resolution {
    /// Ideal width/height cap, if constrained.
    #[must_use]
    pub const fn ideal_size(&self) -> Option<(u32, u32)> {
        match self {
            Self::Native => None,
            Self::P1080 => Some((1920, 1080)),
            Self::P720 => Some((1280, 720)),
        }
    }
}

/// What the encoder should optimize for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentHint {
    /// Fluid motion (screen video, games).
    #[default]
    Motion,
    /// Sharp detail (slides, photos).
    Detail,
    /// Static text; compresses well at lower bitrates.
    Text,
}

/// A complete quality profile for one media source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityProfile {
    pub resolution: Resolution,
    /// Applied as both ideal and max frame rate.
    pub frame_rate: u32,
    /// Explicit bits-per-second, or `None` for the adaptive controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    pub codec: CodecPreference,
    pub content_hint: ContentHint,
}

impl Default for QualityProfile {
    fn default() -> Self {
        Self {
            resolution: Resolution::Native,
            frame_rate: 30,
            bitrate: None,
            codec: CodecPreference::Auto,
            content_hint: ContentHint::Motion,
        }
    }
}

impl QualityProfile {
    /// Reject frame rates outside the supported set.
    pub fn validate(&self) -> Result<(), MediaError> {
        if ALLOWED_FRAME_RATES.contains(&self.frame_rate) {
            Ok(())
        } else {
            Err(MediaError::InvalidProfile(format!(
                "unsupported frame rate {} (allowed: {ALLOWED_FRAME_RATES:?})",
                self.frame_rate
            )))
        }
    }

    /// Target encoder bitrate in kbps for the given output height.
    ///
    /// Explicit bitrates win; otherwise the target is derived from
    /// resolution tier and frame rate, biased by the content hint.
    #[must_use]
    pub fn bitrate_kbps(&self, height: u32) -> u32 {
        if let Some(bps) = self.bitrate {
            return (bps / 1000).max(100);
        }

        let base = match (height, self.frame_rate) {
            (h, fps) if h >= 1080 && fps >= 60 => 6_000,
            (h, _) if h >= 1080 => 4_000,
            (h, fps) if h >= 720 && fps >= 60 => 3_000,
            (h, _) if h >= 720 => 2_000,
            _ => 1_000,
        };

        match self.content_hint {
            ContentHint::Motion | ContentHint::Detail => base,
            ContentHint::Text => base * 3 / 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_caps() {
        assert_eq!(Resolution::Native.ideal_size(), None);
        assert_eq!(Resolution::P1080.ideal_size(), Some((1920, 1080)));
        assert_eq!(Resolution::P720.ideal_size(), Some((1280, 720)));
    }

    #[test]
    fn frame_rate_validation() {
        let mut profile = QualityProfile::default();
        for fps in ALLOWED_FRAME_RATES {
            profile.frame_rate = fps;
            assert!(profile.validate().is_ok());
        }

        profile.frame_rate = 24;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn explicit_bitrate_wins() {
        let profile = QualityProfile {
            bitrate: Some(2_500_000),
            ..Default::default()
        };
        assert_eq!(profile.bitrate_kbps(1080), 2_500);
    }

    #[test]
    fn derived_bitrate_scales_with_tier() {
        let profile = QualityProfile {
            frame_rate: 30,
            ..Default::default()
        };
        assert!(profile.bitrate_kbps(1080) > profile.bitrate_kbps(720));
        assert!(profile.bitrate_kbps(720) > profile.bitrate_kbps(480));

        let fast = QualityProfile {
            frame_rate: 60,
            ..Default::default()
        };
        assert!(fast.bitrate_kbps(1080) > profile.bitrate_kbps(1080));
    }

    #[test]
    fn text_hint_lowers_bitrate() {
        let motion = QualityProfile::default();
        let text = QualityProfile {
            content_hint: ContentHint::Text,
            ..Default::default()
        };
        assert!(text.bitrate_kbps(1080) < motion.bitrate_kbps(1080));
    }

    #[test]
    fn profile_serialization() {
        let profile = QualityProfile {
            resolution: Resolution::P1080,
            frame_rate: 60,
            bitrate: None,
            codec: CodecPreference::Av1,
            content_hint: ContentHint::Motion,
        };
        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains(r#""resolution":"1080p""#));
        assert!(json.contains(r#""frameRate":60"#));
        assert!(json.contains(r#""codec":"av1""#));
        assert!(json.contains(r#""contentHint":"motion""#));
        assert!(!json.contains("bitrate"));

        let back: QualityProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profile);
    }
}
