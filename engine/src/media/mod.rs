//! Media Pipeline
//!
//! Owns every local media source: microphone capture with Opus encoding
//! and voice-activity analysis, plus any number of concurrent screen
//! shares. Sessions hold non-owning references to the produced tracks;
//! track lifecycle changes are broadcast so the mesh controller can drive
//! renegotiation consistently.

pub mod codecs;
pub mod convert;
pub mod encoder;
pub mod microphone;
pub mod quality;
pub mod screen;
pub mod vad;
pub mod video_rtp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::interval;
use tracing::{debug, info};
use webrtc::track::track_local::TrackLocal;

use microphone::Microphone;
use quality::{ContentHint, QualityProfile};
use screen::ScreenHandle;
use vad::{VadDetector, VAD_TICK};

/// Audio configuration constants
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 2;
pub const FRAME_SIZE_MS: usize = 20;
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize * FRAME_SIZE_MS) / 1000; // 960 samples per channel

/// Media pipeline errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No input device available")]
    NoInputDevice,
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Failed to get device config: {0}")]
    ConfigError(String),
    #[error("Failed to build stream: {0}")]
    StreamError(String),
    #[error("Opus encoder error: {0}")]
    EncoderError(String),
    #[error("Screen capture not supported on this platform")]
    CaptureNotSupported,
    #[error("Permission denied for screen capture")]
    CapturePermissionDenied,
    #[error("Capture source not found: {0}")]
    SourceNotFound(String),
    #[error("Invalid quality profile: {0}")]
    InvalidProfile(String),
    #[error("Video encoder error: {0}")]
    VideoError(String),
}

/// Where a local track comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    /// One screen share, keyed by its monotonic index.
    Screen(u64),
}

impl TrackSource {
    /// Stream id carried in SDP and used by the host API.
    #[must_use]
    pub fn stream_id(&self) -> String {
        match self {
            Self::Microphone => "microphone".to_string(),
            Self::Screen(n) => format!("screen-{n}"),
        }
    }

    /// Parse a stream id back into a source.
    #[must_use]
    pub fn from_stream_id(stream_id: &str) -> Option<Self> {
        if stream_id == "microphone" {
            return Some(Self::Microphone);
        }
        stream_id
            .strip_prefix("screen-")
            .and_then(|n| n.parse().ok())
            .map(Self::Screen)
    }
}

/// A live local track with its source tag.
#[derive(Clone)]
pub struct LocalTrack {
    pub source: TrackSource,
    pub track: Arc<dyn TrackLocal + Send + Sync>,
    pub content_hint: Option<ContentHint>,
}

/// Track lifecycle and voice-activity events.
#[derive(Clone)]
pub enum MediaEvent {
    /// A local track went live.
    TrackStarted(LocalTrack),
    /// A local track ended (stopped, or the source went away).
    TrackEnded(TrackSource),
    /// Local speaking state changed.
    SpeakingChanged(bool),
}

pub(crate) struct PipelineInner {
    pub(crate) events: broadcast::Sender<MediaEvent>,
    microphone: Mutex<Option<MicrophoneState>>,
    pub(crate) screens: Mutex<HashMap<u64, ScreenHandle>>,
    next_screen_id: AtomicU64,
    muted: Arc<AtomicBool>,
    speaking: Arc<AtomicBool>,
    vad_threshold: u8,
}

struct MicrophoneState {
    mic: Microphone,
    vad_shutdown: watch::Sender<bool>,
}

/// Owner of all local media sources.
#[derive(Clone)]
pub struct MediaPipeline {
    inner: Arc<PipelineInner>,
}

impl MediaPipeline {
    /// Create a pipeline with the given VAD threshold.
    #[must_use]
    pub fn new(vad_threshold: u8) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(PipelineInner {
                events,
                microphone: Mutex::new(None),
                screens: Mutex::new(HashMap::new()),
                next_screen_id: AtomicU64::new(0),
                muted: Arc::new(AtomicBool::new(false)),
                speaking: Arc::new(AtomicBool::new(false)),
                vad_threshold,
            }),
        }
    }

    /// Subscribe to track lifecycle and speaking events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.inner.events.subscribe()
    }

    /// Open the microphone and produce a live audio track.
    ///
    /// The device is opened raw: no echo cancellation, noise suppression,
    /// or gain control is inserted between the device and the analyser.
    pub async fn start_microphone(&self, device_id: Option<&str>) -> Result<LocalTrack, MediaError> {
        // Restarting replaces the previous capture.
        self.stop_microphone().await;

        let mic = Microphone::start(device_id, self.inner.muted.clone())?;
        let local = LocalTrack {
            source: TrackSource::Microphone,
            track: mic.track.clone() as Arc<dyn TrackLocal + Send + Sync>,
            content_hint: None,
        };

        let (vad_shutdown, vad_shutdown_rx) = watch::channel(false);
        spawn_vad_task(
            mic.level.clone(),
            self.inner.muted.clone(),
            self.inner.speaking.clone(),
            self.inner.vad_threshold,
            self.inner.events.clone(),
            vad_shutdown_rx,
        );

        *self.inner.microphone.lock().await = Some(MicrophoneState { mic, vad_shutdown });

        let _ = self.inner.events.send(MediaEvent::TrackStarted(local.clone()));
        info!("Microphone started");

        Ok(local)
    }

    /// Release the microphone. The ended track propagates to all sessions
    /// through the event channel.
    pub async fn stop_microphone(&self) {
        let state = self.inner.microphone.lock().await.take();
        if let Some(state) = state {
            state.mic.stop().await;
            let _ = state.vad_shutdown.send(true);
            if self.inner.speaking.swap(false, Ordering::Relaxed) {
                let _ = self.inner.events.send(MediaEvent::SpeakingChanged(false));
            }
            let _ = self
                .inner
                .events
                .send(MediaEvent::TrackEnded(TrackSource::Microphone));
            info!("Microphone stopped");
        }
    }

    /// Flip the mute bit without tearing down the device. Returns the new
    /// muted state.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.inner.muted.load(Ordering::Relaxed);
        self.inner.muted.store(muted, Ordering::Relaxed);
        debug!(muted, "Mute toggled");
        muted
    }

    /// Current muted state.
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    /// Current local speaking state.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.inner.speaking.load(Ordering::Relaxed)
    }

    /// Current analyser level (0-255), for level meters.
    pub async fn mic_level(&self) -> u8 {
        self.inner
            .microphone
            .lock()
            .await
            .as_ref()
            .map_or(0, |state| state.mic.level.load(Ordering::Relaxed))
    }

    /// Start a screen share with the given profile. Returns the live
    /// track; its stream id has the form `screen-<n>`.
    pub async fn start_screen_share(
        &self,
        profile: &QualityProfile,
        source_id: Option<&str>,
    ) -> Result<LocalTrack, MediaError> {
        profile.validate()?;

        let target = screen::resolve_target(source_id)?;
        let id = self.inner.next_screen_id.fetch_add(1, Ordering::Relaxed) + 1;

        let track = screen::spawn_screen_pipeline(self.inner.clone(), id, profile, target).await?;
        let local = LocalTrack {
            source: TrackSource::Screen(id),
            track: track as Arc<dyn TrackLocal + Send + Sync>,
            content_hint: Some(profile.content_hint),
        };

        let _ = self.inner.events.send(MediaEvent::TrackStarted(local.clone()));
        info!(stream_id = %local.source.stream_id(), "Screen share started");

        Ok(local)
    }

    /// Stop one screen share (`screen-<n>`), or all of them when no
    /// stream id is given. Returns the stream ids that were stopped.
    pub async fn stop_screen_share(
        &self,
        stream_id: Option<&str>,
    ) -> Result<Vec<String>, MediaError> {
        let screens = self.inner.screens.lock().await;

        let ids: Vec<u64> = match stream_id {
            Some(stream_id) => {
                let Some(TrackSource::Screen(id)) = TrackSource::from_stream_id(stream_id) else {
                    return Err(MediaError::SourceNotFound(stream_id.to_string()));
                };
                if !screens.contains_key(&id) {
                    return Err(MediaError::SourceNotFound(stream_id.to_string()));
                }
                vec![id]
            }
            None => screens.keys().copied().collect(),
        };

        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = screens.get(&id) {
                handle.stop();
                stopped.push(handle.stream_id());
            }
        }
        // Removal from the map and the TrackEnded broadcast happen when
        // the capture task actually exits.

        Ok(stopped)
    }

    /// Snapshot of all live tracks, for attaching to a new session.
    pub async fn live_tracks(&self) -> Vec<LocalTrack> {
        let mut tracks = Vec::new();

        if let Some(state) = self.inner.microphone.lock().await.as_ref() {
            tracks.push(LocalTrack {
                source: TrackSource::Microphone,
                track: state.mic.track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                content_hint: None,
            });
        }

        let screens = self.inner.screens.lock().await;
        let mut ids: Vec<u64> = screens.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let handle = &screens[&id];
            tracks.push(LocalTrack {
                source: TrackSource::Screen(id),
                track: handle.track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                content_hint: Some(handle.content_hint),
            });
        }

        tracks
    }

    /// Stop every source.
    pub async fn stop_all(&self) {
        self.stop_microphone().await;
        let _ = self.stop_screen_share(None).await;
        info!("All media sources stopped");
    }
}

/// Drive VAD decisions at the tick cadence, broadcasting transitions.
fn spawn_vad_task(
    level: Arc<AtomicU8>,
    muted: Arc<AtomicBool>,
    speaking: Arc<AtomicBool>,
    threshold: u8,
    events: broadcast::Sender<MediaEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut detector = VadDetector::new(threshold);
        let mut tick = interval(VAD_TICK);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let level = level.load(Ordering::Relaxed);
                    let muted = muted.load(Ordering::Relaxed);
                    if let Some(state) = detector.update(level, muted) {
                        speaking.store(state, Ordering::Relaxed);
                        let _ = events.send(MediaEvent::SpeakingChanged(state));
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_round_trip() {
        assert_eq!(TrackSource::Microphone.stream_id(), "microphone");
        assert_eq!(TrackSource::Screen(3).stream_id(), "screen-3");

        assert_eq!(
            TrackSource::from_stream_id("microphone"),
            Some(TrackSource::Microphone)
        );
        assert_eq!(
            TrackSource::from_stream_id("screen-7"),
            Some(TrackSource::Screen(7))
        );
        assert_eq!(TrackSource::from_stream_id("webcam-1"), None);
        assert_eq!(TrackSource::from_stream_id("screen-x"), None);
    }

    #[tokio::test]
    async fn mute_toggle_flips_state() {
        let pipeline = MediaPipeline::new(vad::DEFAULT_VAD_THRESHOLD);
        assert!(!pipeline.is_muted());
        assert!(pipeline.toggle_mute());
        assert!(pipeline.is_muted());
        assert!(!pipeline.toggle_mute());
        assert!(!pipeline.is_muted());
    }

    #[tokio::test]
    async fn stop_unknown_screen_share_errors() {
        let pipeline = MediaPipeline::new(vad::DEFAULT_VAD_THRESHOLD);
        assert!(matches!(
            pipeline.stop_screen_share(Some("screen-9")).await,
            Err(MediaError::SourceNotFound(_))
        ));
        // Stopping all with nothing live is a no-op.
        assert_eq!(pipeline.stop_screen_share(None).await.unwrap().len(), 0);
    }
}
