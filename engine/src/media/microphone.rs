//! Microphone Capture
//!
//! Opens a cpal input device, Opus-encodes 20 ms frames, and writes them
//! to a local WebRTC audio track. The non-Send `cpal::Stream` is owned by
//! a blocking task; control flows over channels. A parallel analyser
//! folds each callback buffer into a short-term average magnitude on a
//! 0-255 scale for the voice-activity detector.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use opus::{Application, Channels as OpusChannels, Encoder};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::codecs::opus_capability;
use super::{MediaError, CHANNELS, FRAME_SIZE, FRAME_SIZE_MS, SAMPLE_RATE};

/// Control messages for the capture task.
enum CaptureControl {
    Stop,
}

/// A live microphone: the owned track plus capture controls.
pub struct Microphone {
    /// Track fed by the capture task. Sessions hold non-owning clones.
    pub track: Arc<TrackLocalStaticSample>,
    /// Analyser output, 0-255 average magnitude.
    pub level: Arc<AtomicU8>,
    control_tx: mpsc::Sender<CaptureControl>,
}

impl Microphone {
    /// Open the given input device (or the default) and start capturing.
    pub fn start(device_id: Option<&str>, muted: Arc<AtomicBool>) -> Result<Self, MediaError> {
        let device = find_input_device(device_id)?;

        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            "microphone".to_string(),
        ));

        let level = Arc::new(AtomicU8::new(0));
        let (control_tx, mut control_rx) = mpsc::channel::<CaptureControl>(1);
        let (packet_tx, mut packet_rx) = mpsc::channel::<Bytes>(100);

        // Capture task owns the cpal stream.
        let level_clone = level.clone();
        tokio::task::spawn_blocking(move || {
            run_capture_task(device, muted, level_clone, packet_tx, &mut control_rx);
        });

        // Writer task feeds encoded frames to the track.
        let track_clone = track.clone();
        tokio::spawn(async move {
            while let Some(data) = packet_rx.recv().await {
                let sample = Sample {
                    data,
                    duration: Duration::from_millis(FRAME_SIZE_MS as u64),
                    ..Default::default()
                };
                if let Err(e) = track_clone.write_sample(&sample).await {
                    debug!(error = %e, "Dropped audio sample");
                }
            }
        });

        info!("Audio capture started");
        Ok(Self {
            track,
            level,
            control_tx,
        })
    }

    /// Stop capturing and release the device.
    pub async fn stop(&self) {
        let _ = self.control_tx.send(CaptureControl::Stop).await;
        debug!("Audio capture stop requested");
    }
}

/// Resolve an input device by name, or the default.
fn find_input_device(device_id: Option<&str>) -> Result<Device, MediaError> {
    let host = cpal::default_host();

    match device_id {
        Some(name) => {
            let mut devices = host
                .input_devices()
                .map_err(|e| MediaError::ConfigError(e.to_string()))?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| MediaError::DeviceNotFound(name.to_string()))
        }
        None => host.default_input_device().ok_or(MediaError::NoInputDevice),
    }
}

/// Run the capture task (owns the stream).
fn run_capture_task(
    device: Device,
    muted: Arc<AtomicBool>,
    level: Arc<AtomicU8>,
    packet_tx: mpsc::Sender<Bytes>,
    control_rx: &mut mpsc::Receiver<CaptureControl>,
) {
    use cpal::traits::StreamTrait;
    use cpal::{BufferSize, SampleRate, StreamConfig};

    let config = StreamConfig {
        channels: CHANNELS,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: BufferSize::Default,
    };

    let encoder = match Encoder::new(SAMPLE_RATE, OpusChannels::Stereo, Application::Voip) {
        Ok(enc) => Arc::new(std::sync::Mutex::new(enc)),
        Err(e) => {
            error!(error = %e, "Failed to create Opus encoder");
            return;
        }
    };

    let sample_buffer = Arc::new(std::sync::Mutex::new(Vec::with_capacity(
        FRAME_SIZE * CHANNELS as usize * 2,
    )));
    let frame_samples = FRAME_SIZE * CHANNELS as usize;

    let stream = match device.build_input_stream(
        &config,
        move |data: &[f32], _| {
            // Analyser runs regardless of mute so level meters keep working.
            let avg = if data.is_empty() {
                0.0
            } else {
                data.iter().map(|s| s.abs()).sum::<f32>() / data.len() as f32
            };
            level.store((avg * 255.0).min(255.0) as u8, Ordering::Relaxed);

            let mut buffer = match sample_buffer.lock() {
                Ok(buffer) => buffer,
                Err(_) => return,
            };

            if muted.load(Ordering::Relaxed) {
                // Muted: keep the device open but ship nothing, and drop
                // partial frames so unmute starts clean.
                buffer.clear();
                return;
            }

            buffer.extend_from_slice(data);

            while buffer.len() >= frame_samples {
                let frame: Vec<f32> = buffer.drain(..frame_samples).collect();

                let samples_i16: Vec<i16> = frame
                    .iter()
                    .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                    .collect();

                let mut encoded = vec![0u8; 4000];
                if let Ok(mut enc) = encoder.lock() {
                    match enc.encode(&samples_i16, &mut encoded) {
                        Ok(len) => {
                            encoded.truncate(len);
                            if packet_tx.try_send(Bytes::from(encoded)).is_err() {
                                warn!("Encoded audio dropped (writer behind)");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Opus encode error");
                        }
                    }
                }
            }
        },
        |err| {
            error!(error = %err, "Audio capture stream error");
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to build capture stream");
            return;
        }
    };

    if let Err(e) = stream.play() {
        error!(error = %e, "Failed to start capture stream");
        return;
    }

    // Block until stop signal
    while let Some(msg) = control_rx.blocking_recv() {
        match msg {
            CaptureControl::Stop => break,
        }
    }

    drop(stream);
    info!("Capture task stopped");
}
