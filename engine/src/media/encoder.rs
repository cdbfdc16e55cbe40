//! Video Encoder
//!
//! VP9 software encoding via `vpx-encode`.
//!
//! `vpx_encode::Encoder` holds raw pointers and is not `Send`; an encoder
//! lives and dies on the blocking capture thread that created it.

use tracing::debug;
use vpx_encode::{Config, Encoder as VpxEncoder, VideoCodecId};

use super::convert::I420Frame;
use super::MediaError;

/// An encoded video packet ready for RTP packetization.
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
    /// Presentation timestamp in 90 kHz clock units.
    pub pts: u64,
}

/// VP9 encoder wrapping libvpx.
pub struct Vp9Encoder {
    encoder: VpxEncoder,
    frame_count: u64,
    fps: u32,
    i420_buf: Vec<u8>,
}

impl Vp9Encoder {
    /// Create an encoder for the given dimensions and bitrate.
    pub fn new(width: u32, height: u32, fps: u32, bitrate_kbps: u32) -> Result<Self, MediaError> {
        let config = Config {
            width,
            height,
            timebase: [1, fps as i32],
            bitrate: bitrate_kbps,
            codec: VideoCodecId::VP9,
        };

        let encoder = VpxEncoder::new(config)
            .map_err(|e| MediaError::VideoError(format!("VP9 encoder init: {e}")))?;

        debug!(width, height, fps, bitrate_kbps, "VP9 encoder initialized");

        let i420_buf = Vec::with_capacity((width * height * 3 / 2) as usize);

        Ok(Self {
            encoder,
            frame_count: 0,
            fps,
            i420_buf,
        })
    }

    /// Encode one frame. May yield zero or more packets.
    pub fn encode(&mut self, frame: &I420Frame) -> Result<Vec<EncodedPacket>, MediaError> {
        // 90kHz clock timestamp
        let pts_90khz = self.frame_count * 90000 / u64::from(self.fps);

        // libvpx expects one contiguous Y+U+V buffer; reuse the allocation.
        self.i420_buf.clear();
        self.i420_buf.extend_from_slice(&frame.y);
        self.i420_buf.extend_from_slice(&frame.u);
        self.i420_buf.extend_from_slice(&frame.v);

        let packets = self
            .encoder
            .encode(pts_90khz as i64, &self.i420_buf)
            .map_err(|e| MediaError::VideoError(format!("VP9 encode: {e}")))?;

        self.frame_count += 1;

        Ok(packets
            .map(|pkt| EncodedPacket {
                data: pkt.data.to_vec(),
                is_keyframe: pkt.key,
                pts: pts_90khz,
            })
            .collect())
    }
}
