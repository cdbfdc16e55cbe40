//! VP9 RTP Payloader
//!
//! Splits encoded VP9 frames into RTP payloads per RFC 7741 and writes
//! them through a `TrackLocalStaticRTP` (which fills in SSRC, payload
//! type, and timestamps).

use std::sync::Arc;

use webrtc::track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter};

use super::encoder::EncodedPacket;
use super::MediaError;

/// Maximum RTP payload size before fragmentation.
const MAX_PAYLOAD_SIZE: usize = 1200;

/// One-byte VP9 payload descriptor, Profile 0, flexible-mode bits unset.
/// P marks inter-predicted frames; B and E mark the first and last packet
/// of a frame.
fn payload_descriptor(is_keyframe: bool, is_first: bool, is_last: bool) -> u8 {
    let mut desc: u8 = 0;

    if !is_keyframe {
        desc |= 0x02; // P: inter-picture predicted
    }
    if is_first {
        desc |= 0x10; // B: beginning of frame
    }
    if is_last {
        desc |= 0x20; // E: end of frame
    }

    desc
}

/// Writes VP9 frames to a WebRTC track as RTP payloads.
pub struct Vp9Payloader {
    track: Arc<TrackLocalStaticRTP>,
}

impl Vp9Payloader {
    /// Payloader for the given track.
    #[must_use]
    pub const fn new(track: Arc<TrackLocalStaticRTP>) -> Self {
        Self { track }
    }

    /// Send one encoded frame, fragmenting at the MTU boundary.
    pub async fn send_packet(&self, packet: &EncodedPacket) -> Result<(), MediaError> {
        if packet.data.is_empty() {
            return Ok(());
        }

        let chunks: Vec<&[u8]> = packet.data.chunks(MAX_PAYLOAD_SIZE).collect();
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.iter().enumerate() {
            let descriptor = payload_descriptor(packet.is_keyframe, i == 0, i == last);

            let mut payload = Vec::with_capacity(1 + chunk.len());
            payload.push(descriptor);
            payload.extend_from_slice(chunk);

            self.track
                .write(&payload)
                .await
                .map_err(|e| MediaError::VideoError(format!("RTP send: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_single_packet_sets_b_and_e() {
        let desc = payload_descriptor(true, true, true);
        assert_eq!(desc & 0x02, 0x00, "P bit clear for keyframe");
        assert_eq!(desc & 0x10, 0x10, "B bit set");
        assert_eq!(desc & 0x20, 0x20, "E bit set");
    }

    #[test]
    fn fragment_boundaries_mark_first_and_last() {
        let first = payload_descriptor(true, true, false);
        assert_eq!(first & 0x10, 0x10);
        assert_eq!(first & 0x20, 0x00);

        let last = payload_descriptor(true, false, true);
        assert_eq!(last & 0x10, 0x00);
        assert_eq!(last & 0x20, 0x20);
    }

    #[test]
    fn inter_frame_middle_packet_sets_only_p() {
        let desc = payload_descriptor(false, false, false);
        assert_eq!(desc, 0x02);
    }
}
