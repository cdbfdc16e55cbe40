//! Screen Capture
//!
//! Native display/window capture via `scap`, encoded to VP9 and fed to a
//! local RTP track. Each share is an independent pipeline: capture and
//! encode on one blocking thread, RTP writes on an async task, and a
//! watcher that broadcasts the track's end when the capture stops —
//! whether by request or because the user closed the source.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::codecs::vp9_capability;
use super::convert::BgraToI420Converter;
use super::encoder::{EncodedPacket, Vp9Encoder};
use super::quality::{ContentHint, QualityProfile, Resolution};
use super::video_rtp::Vp9Payloader;
use super::{MediaError, MediaEvent, PipelineInner, TrackSource};

/// A capture source (display or window).
#[derive(Debug, Clone)]
pub struct CaptureSource {
    /// `display:<id>` or `window:<id>`.
    pub id: String,
    /// Monitor name or window title.
    pub name: String,
}

/// A running screen share.
pub struct ScreenHandle {
    pub id: u64,
    pub track: Arc<TrackLocalStaticRTP>,
    pub content_hint: ContentHint,
    shutdown: watch::Sender<bool>,
}

impl ScreenHandle {
    /// Stream id of the form `screen-<n>`.
    #[must_use]
    pub fn stream_id(&self) -> String {
        TrackSource::Screen(self.id).stream_id()
    }

    /// Request the capture loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Enumerate available capture sources.
pub fn enumerate_sources() -> Result<Vec<CaptureSource>, MediaError> {
    check_capture_access()?;

    let sources = scap::get_all_targets()
        .into_iter()
        .map(|target| match target {
            scap::Target::Display(display) => CaptureSource {
                id: format!("display:{}", display.id),
                name: if display.title.is_empty() {
                    format!("Display {}", display.id)
                } else {
                    display.title
                },
            },
            scap::Target::Window(window) => CaptureSource {
                id: format!("window:{}", window.id),
                name: if window.title.is_empty() {
                    format!("Window {}", window.id)
                } else {
                    window.title
                },
            },
        })
        .collect();

    Ok(sources)
}

/// Resolve a capture target by source id, or the primary display.
pub fn resolve_target(source_id: Option<&str>) -> Result<scap::Target, MediaError> {
    check_capture_access()?;

    let targets = scap::get_all_targets();

    match source_id {
        Some(wanted) => targets
            .into_iter()
            .find(|target| {
                let id = match target {
                    scap::Target::Display(d) => format!("display:{}", d.id),
                    scap::Target::Window(w) => format!("window:{}", w.id),
                };
                id == wanted
            })
            .ok_or_else(|| MediaError::SourceNotFound(wanted.to_string())),
        None => targets
            .into_iter()
            .find(|t| matches!(t, scap::Target::Display(_)))
            .ok_or_else(|| MediaError::SourceNotFound("no displays available".into())),
    }
}

fn check_capture_access() -> Result<(), MediaError> {
    if !scap::is_supported() {
        return Err(MediaError::CaptureNotSupported);
    }
    if !scap::has_permission() && !scap::request_permission() {
        return Err(MediaError::CapturePermissionDenied);
    }
    Ok(())
}

/// Start the capture → encode → RTP pipeline for one share. The handle
/// is registered before any task runs so an instantly-failing capture
/// still retires the share through the normal path.
pub(crate) async fn spawn_screen_pipeline(
    inner: Arc<PipelineInner>,
    id: u64,
    profile: &QualityProfile,
    target: scap::Target,
) -> Result<Arc<TrackLocalStaticRTP>, MediaError> {
    let source = TrackSource::Screen(id);
    let track = Arc::new(TrackLocalStaticRTP::new(
        vp9_capability(),
        "screen-video".to_string(),
        source.stream_id(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (packet_tx, mut packet_rx) = mpsc::channel::<EncodedPacket>(32);

    inner.screens.lock().await.insert(
        id,
        ScreenHandle {
            id,
            track: track.clone(),
            content_hint: profile.content_hint,
            shutdown: shutdown_tx,
        },
    );

    // Capture and encode own a blocking thread (the encoder is not Send).
    let capture_profile = profile.clone();
    let capture = tokio::task::spawn_blocking(move || {
        run_capture_encode(target, &capture_profile, &packet_tx, &shutdown_rx);
    });

    let payloader = Vp9Payloader::new(track.clone());
    let writer = tokio::spawn(async move {
        while let Some(packet) = packet_rx.recv().await {
            if let Err(e) = payloader.send_packet(&packet).await {
                debug!(error = %e, "Dropped video packet");
            }
        }
    });

    // When capture ends (stop requested, window closed, OS-level cancel),
    // retire the share and tell every holder the track is gone.
    tokio::spawn(async move {
        let _ = capture.await;
        let _ = writer.await;

        if inner.screens.lock().await.remove(&id).is_some() {
            info!(stream_id = %source.stream_id(), "Screen share ended");
            let _ = inner.events.send(MediaEvent::TrackEnded(source));
        }
    });

    Ok(track)
}

/// Capture frames and encode them until shutdown or end of stream.
fn run_capture_encode(
    target: scap::Target,
    profile: &QualityProfile,
    packet_tx: &mpsc::Sender<EncodedPacket>,
    shutdown_rx: &watch::Receiver<bool>,
) {
    let options = build_capture_options(profile, target);

    let mut capturer = match scap::capturer::Capturer::build(options) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create capturer");
            return;
        }
    };

    capturer.start_capture();
    info!(fps = profile.frame_rate, "Capture started");

    // Converter and encoder are sized from the first frame so native
    // resolution needs no up-front probing.
    let mut converter: Option<BgraToI420Converter> = None;
    let mut encoder: Option<Vp9Encoder> = None;

    loop {
        if *shutdown_rx.borrow() {
            info!("Capture shutdown requested");
            break;
        }

        match capturer.get_next_frame() {
            Ok(scap::frame::Frame::BGRA(bgra)) => {
                let stride_width = bgra.width as u32;
                let (width, height) = (stride_width & !1, (bgra.height as u32) & !1);
                if width == 0 || height == 0 {
                    continue;
                }

                if converter
                    .as_ref()
                    .is_none_or(|c| c.dimensions() != (width, height))
                {
                    converter = Some(BgraToI420Converter::new(width, height));
                    encoder = match Vp9Encoder::new(
                        width,
                        height,
                        profile.frame_rate,
                        profile.bitrate_kbps(height),
                    ) {
                        Ok(enc) => Some(enc),
                        Err(e) => {
                            error!(error = %e, "Failed to create encoder");
                            break;
                        }
                    };
                }

                let (Some(conv), Some(enc)) = (converter.as_mut(), encoder.as_mut()) else {
                    continue;
                };
                let frame = conv.convert(&bgra.data, stride_width);

                match enc.encode(&frame) {
                    Ok(packets) => {
                        for packet in packets {
                            if packet_tx.try_send(packet).is_err() {
                                debug!("Encoded frame dropped (sender behind)");
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Encode failed");
                        break;
                    }
                }
            }
            Ok(_) => {
                warn!("Unexpected frame format, skipping");
            }
            Err(e) => {
                // End of stream: window closed or sharing cancelled.
                info!(error = %e, "Capture ended");
                break;
            }
        }
    }

    capturer.stop_capture();
    info!("Capture stopped");
}

/// Translate a quality profile into capture options.
fn build_capture_options(profile: &QualityProfile, target: scap::Target) -> scap::capturer::Options {
    let output_resolution = match profile.resolution {
        Resolution::Native => scap::capturer::Resolution::Captured,
        Resolution::P1080 => scap::capturer::Resolution::_1080p,
        Resolution::P720 => scap::capturer::Resolution::_720p,
    };

    scap::capturer::Options {
        fps: profile.frame_rate,
        target: Some(target),
        show_cursor: true,
        show_highlight: false,
        excluded_targets: None,
        output_type: scap::frame::FrameType::BGRAFrame,
        output_resolution,
        crop_area: None,
        ..Default::default()
    }
}
