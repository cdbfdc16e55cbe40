//! Mesh Controller
//!
//! Owns every peer session for the local participant. Bridges signaling
//! events to sessions, broadcasts local media to all of them, and exposes
//! the aggregate room state to the host application. Sessions are kept in
//! insertion order so broadcasts iterate deterministically.

use std::collections::HashMap;
use std::sync::Arc;

use mesh_proto::{Envelope, ParticipantInfo};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::track::track_remote::TrackRemote;

use crate::channel::{DataKind, DataMessage};
use crate::config::MeshConfig;
use crate::error::EngineError;
use crate::media::codecs::build_api;
use crate::media::quality::QualityProfile;
use crate::media::{LocalTrack, MediaEvent, MediaPipeline, TrackSource};
use crate::peer::{rtc_configuration, NegotiationState, PeerSession, Role, SessionEvent};
use crate::signaling::{ConnectionStatus, SignalingClient, SignalingEvent};

/// Events surfaced to the host application.
#[derive(Clone)]
pub enum MeshEvent {
    /// Joined a room; the server confirmed our id.
    Joined { self_id: String },
    /// Left the room.
    Left,
    /// A participant is (or was already) in the room.
    ParticipantJoined(ParticipantInfo),
    /// A participant left.
    ParticipantLeft { participant_id: String },
    /// A remote media track arrived from a peer.
    RemoteTrack {
        participant_id: String,
        track: Arc<TrackRemote>,
    },
    /// A peer session changed negotiation state.
    SessionState {
        participant_id: String,
        state: NegotiationState,
    },
    /// A peer's speaking flag changed.
    Speaking {
        participant_id: String,
        speaking: bool,
    },
    /// The local speaking flag changed.
    LocalSpeaking(bool),
    /// Inbound chat line.
    Chat {
        participant_id: String,
        text: String,
        timestamp: i64,
    },
    /// Inbound peer control message.
    Control {
        participant_id: String,
        payload: serde_json::Value,
    },
    /// Signaling connection status changed.
    Connection(ConnectionStatus),
}

struct ControllerInner {
    config: MeshConfig,
    api: Arc<API>,
    media: MediaPipeline,
    signaling: Mutex<Option<SignalingClient>>,
    self_id: RwLock<Option<String>>,
    room_id: RwLock<Option<String>>,
    display_name: RwLock<Option<String>>,
    sessions: RwLock<Vec<Arc<PeerSession>>>,
    participants: RwLock<Vec<ParticipantInfo>>,
    speaking: RwLock<HashMap<String, bool>>,
    remote_tracks: RwLock<HashMap<String, Vec<Arc<TrackRemote>>>>,
    session_events_tx: mpsc::Sender<SessionEvent>,
    events: broadcast::Sender<MeshEvent>,
}

/// The per-participant mesh: one controller, N peer sessions.
#[derive(Clone)]
pub struct MeshController {
    inner: Arc<ControllerInner>,
}

impl MeshController {
    /// Build the controller and its media pipeline. No network activity
    /// until [`Self::join_room`].
    pub fn new(config: MeshConfig) -> Result<Self, EngineError> {
        let api = build_api()?;
        let media = MediaPipeline::new(config.vad_threshold);
        let (session_events_tx, session_events_rx) = mpsc::channel::<SessionEvent>(256);
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(ControllerInner {
            config,
            api,
            media,
            signaling: Mutex::new(None),
            self_id: RwLock::new(None),
            room_id: RwLock::new(None),
            display_name: RwLock::new(None),
            sessions: RwLock::new(Vec::new()),
            participants: RwLock::new(Vec::new()),
            speaking: RwLock::new(HashMap::new()),
            remote_tracks: RwLock::new(HashMap::new()),
            session_events_tx,
            events,
        });

        spawn_session_pump(inner.clone(), session_events_rx);
        spawn_media_pump(inner.clone());

        Ok(Self { inner })
    }

    /// Subscribe to controller events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Mint a fresh room id and join it.
    pub async fn create_room(&self, name: Option<String>) -> Result<String, EngineError> {
        let room_id = Uuid::new_v4().to_string();
        self.join_room(&room_id, name).await?;
        Ok(room_id)
    }

    /// Connect signaling and join a room. The server assigns our id
    /// unless the configuration preassigned one.
    pub async fn join_room(&self, room_id: &str, name: Option<String>) -> Result<(), EngineError> {
        {
            let mut current = self.inner.room_id.write().await;
            if current.is_some() {
                return Err(EngineError::AlreadyInRoom);
            }
            *current = Some(room_id.to_string());
        }
        *self.inner.display_name.write().await =
            name.or_else(|| self.inner.config.display_name.clone());

        let (client, signaling_rx) = SignalingClient::connect(self.inner.config.server_url.clone());
        *self.inner.signaling.lock().await = Some(client);

        spawn_signaling_pump(self.inner.clone(), signaling_rx);

        info!(room_id = %room_id, "Joining room");
        Ok(())
    }

    /// Leave the room: announce, close every session, stop local media,
    /// and disconnect signaling.
    pub async fn leave_room(&self) -> Result<(), EngineError> {
        let room_id = self.inner.room_id.write().await.take();
        if room_id.is_none() {
            return Err(EngineError::NotInRoom);
        }

        let self_id = self.inner.self_id.write().await.take();
        if let (Some(participant_id), Some(client)) =
            (self_id, self.inner.signaling.lock().await.as_ref())
        {
            let _ = client.send(Envelope::Leave { participant_id }).await;
        }

        close_all_sessions(&self.inner).await;
        self.inner.participants.write().await.clear();
        self.inner.speaking.write().await.clear();
        self.inner.remote_tracks.write().await.clear();
        self.inner.media.stop_all().await;

        if let Some(mut client) = self.inner.signaling.lock().await.take() {
            client.disconnect().await;
        }

        let _ = self.inner.events.send(MeshEvent::Left);
        info!("Left room");
        Ok(())
    }

    /// Start microphone capture; the track is broadcast to all sessions.
    pub async fn start_microphone(&self, device_id: Option<&str>) -> Result<(), EngineError> {
        self.inner.media.start_microphone(device_id).await?;
        Ok(())
    }

    /// Stop microphone capture; sessions drop the sender and renegotiate.
    pub async fn stop_microphone(&self) {
        self.inner.media.stop_microphone().await;
    }

    /// Flip the mute bit and announce it to peers. Returns the new state.
    pub async fn toggle_mute(&self) -> bool {
        let muted = self.inner.media.toggle_mute();
        let message = DataMessage::control(json!({ "muted": muted }));
        broadcast_data(&self.inner, &message).await;
        muted
    }

    /// Start a screen share; returns its stream id (`screen-<n>`).
    pub async fn start_screen_share(
        &self,
        profile: &QualityProfile,
        source_id: Option<&str>,
    ) -> Result<String, EngineError> {
        let local = self
            .inner
            .media
            .start_screen_share(profile, source_id)
            .await?;
        Ok(local.source.stream_id())
    }

    /// Stop one screen share, or all of them.
    pub async fn stop_screen_share(
        &self,
        stream_id: Option<&str>,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self.inner.media.stop_screen_share(stream_id).await?)
    }

    /// Send a chat line to every connected peer.
    pub async fn send_chat_message(&self, text: &str) -> Result<(), EngineError> {
        if self.inner.self_id.read().await.is_none() {
            return Err(EngineError::NotInRoom);
        }
        broadcast_data(&self.inner, &DataMessage::chat(text)).await;
        Ok(())
    }

    /// Our server-confirmed participant id.
    pub async fn self_id(&self) -> Option<String> {
        self.inner.self_id.read().await.clone()
    }

    /// Current participant set (excluding ourselves).
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.inner.participants.read().await.clone()
    }

    /// Negotiation state per peer, in session insertion order.
    pub async fn session_states(&self) -> Vec<(String, NegotiationState)> {
        let sessions = self.inner.sessions.read().await.clone();
        let mut states = Vec::with_capacity(sessions.len());
        for session in sessions {
            states.push((session.remote_id.clone(), session.state().await));
        }
        states
    }

    /// Remote tracks received from one peer, in arrival order.
    pub async fn remote_tracks(&self, participant_id: &str) -> Vec<Arc<TrackRemote>> {
        self.inner
            .remote_tracks
            .read()
            .await
            .get(participant_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a peer is currently speaking.
    pub async fn peer_speaking(&self, participant_id: &str) -> bool {
        self.inner
            .speaking
            .read()
            .await
            .get(participant_id)
            .copied()
            .unwrap_or(false)
    }

    /// Local speaking flag.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.inner.media.is_speaking()
    }

    /// Local mute state.
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.inner.media.is_muted()
    }

    /// Signaling connection status.
    pub async fn connection_status(&self) -> ConnectionStatus {
        match self.inner.signaling.lock().await.as_ref() {
            Some(client) => client.status().await,
            None => ConnectionStatus::Disconnected,
        }
    }
}

fn spawn_signaling_pump(
    inner: Arc<ControllerInner>,
    mut signaling_rx: mpsc::Receiver<SignalingEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = signaling_rx.recv().await {
            handle_signaling_event(&inner, event).await;
        }
        debug!("Signaling pump ended");
    });
}

fn spawn_session_pump(inner: Arc<ControllerInner>, mut rx: mpsc::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_session_event(&inner, event).await;
        }
    });
}

fn spawn_media_pump(inner: Arc<ControllerInner>) {
    let mut rx = inner.media.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => handle_media_event(&inner, event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Media event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn handle_signaling_event(inner: &Arc<ControllerInner>, event: SignalingEvent) {
    match event {
        SignalingEvent::Connected => {
            let _ = inner
                .events
                .send(MeshEvent::Connection(ConnectionStatus::Connected));
            rejoin(inner).await;
        }
        SignalingEvent::Disconnected => {
            let _ = inner
                .events
                .send(MeshEvent::Connection(ConnectionStatus::Disconnected));
        }
        SignalingEvent::Reconnecting { attempt } => {
            let _ = inner
                .events
                .send(MeshEvent::Connection(ConnectionStatus::Reconnecting {
                    attempt,
                }));
        }
        SignalingEvent::Envelope(envelope) => route_envelope(inner, envelope).await,
    }
}

/// (Re-)send `Join` for the current room. After a reconnect all previous
/// sessions are stale: peers saw us leave, and will see us rejoin; tear
/// everything down and let the join sequence rebuild the mesh.
async fn rejoin(inner: &Arc<ControllerInner>) {
    let Some(room_id) = inner.room_id.read().await.clone() else {
        return;
    };

    close_all_sessions(inner).await;
    inner.participants.write().await.clear();
    inner.speaking.write().await.clear();
    inner.remote_tracks.write().await.clear();

    let participant_id = {
        let stored = inner.self_id.read().await.clone();
        stored.or_else(|| inner.config.participant_id.clone())
    };
    let name = inner.display_name.read().await.clone();

    if let Some(client) = inner.signaling.lock().await.as_ref() {
        if let Err(e) = client
            .send(Envelope::Join {
                room_id,
                participant_id,
                name,
            })
            .await
        {
            warn!(error = %e, "Failed to send Join");
        }
    }
}

async fn route_envelope(inner: &Arc<ControllerInner>, envelope: Envelope) {
    match envelope {
        Envelope::JoinAck {
            participant_id,
            existing,
            ..
        } => {
            info!(self_id = %participant_id, peers = existing.len(), "Join acknowledged");
            *inner.self_id.write().await = Some(participant_id.clone());
            *inner.participants.write().await = existing.clone();
            let _ = inner.events.send(MeshEvent::Joined {
                self_id: participant_id,
            });

            // We are the newcomer: initiator toward every existing peer.
            for participant in existing {
                let _ = inner
                    .events
                    .send(MeshEvent::ParticipantJoined(participant.clone()));
                match create_session(inner, &participant.id, Role::Initiator).await {
                    Ok(session) => {
                        attach_local_tracks(inner, &session).await;
                        session.request_negotiation().await;
                        let session = session.clone();
                        // Negotiation proceeds in parallel per session.
                        tokio::spawn(async move {
                            if let Err(e) = session.negotiate().await {
                                warn!(remote_id = %session.remote_id, error = %e, "Negotiation failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(remote_id = %participant.id, error = %e, "Failed to create session");
                    }
                }
            }
        }

        Envelope::PeerJoined {
            participant_id,
            name,
        } => {
            info!(participant_id = %participant_id, "Peer joined");

            // A rejoin under the same id invalidates the old session.
            if let Some(old) = remove_session(inner, &participant_id).await {
                old.close().await;
            }

            let participant = ParticipantInfo::new(participant_id.clone(), name);
            {
                let mut participants = inner.participants.write().await;
                participants.retain(|p| p.id != participant_id);
                participants.push(participant.clone());
            }
            let _ = inner.events.send(MeshEvent::ParticipantJoined(participant));

            // The newcomer initiates toward us; we respond. Our live
            // tracks ride along in the answer (or a follow-up offer).
            match create_session(inner, &participant_id, Role::Responder).await {
                Ok(session) => attach_local_tracks(inner, &session).await,
                Err(e) => {
                    warn!(remote_id = %participant_id, error = %e, "Failed to create session");
                }
            }
        }

        Envelope::PeerLeft { participant_id } | Envelope::Leave { participant_id } => {
            info!(participant_id = %participant_id, "Peer left");
            if let Some(session) = remove_session(inner, &participant_id).await {
                session.close().await;
            }
            inner
                .participants
                .write()
                .await
                .retain(|p| p.id != participant_id);
            inner.speaking.write().await.remove(&participant_id);
            inner.remote_tracks.write().await.remove(&participant_id);
            let _ = inner
                .events
                .send(MeshEvent::ParticipantLeft { participant_id });
        }

        Envelope::Offer {
            sender_id: Some(from),
            sdp,
            ..
        } => {
            // An offer from an unknown peer materializes a responder
            // session lazily.
            let session = match find_session(inner, &from).await {
                Some(session) => Some(session),
                None => match create_session(inner, &from, Role::Responder).await {
                    Ok(session) => {
                        attach_local_tracks(inner, &session).await;
                        let participant = ParticipantInfo::new(from.clone(), None);
                        inner.participants.write().await.push(participant.clone());
                        let _ = inner.events.send(MeshEvent::ParticipantJoined(participant));
                        Some(session)
                    }
                    Err(e) => {
                        warn!(remote_id = %from, error = %e, "Failed to create session for offer");
                        None
                    }
                },
            };

            if let Some(session) = session {
                if let Err(e) = session.handle_offer(&sdp).await {
                    warn!(remote_id = %from, error = %e, "Failed to handle offer");
                }
            }
        }

        Envelope::Answer {
            sender_id: Some(from),
            sdp,
            ..
        } => match find_session(inner, &from).await {
            Some(session) => {
                if let Err(e) = session.handle_answer(&sdp).await {
                    warn!(remote_id = %from, error = %e, "Failed to handle answer");
                }
            }
            None => debug!(remote_id = %from, "Answer for unknown session dropped"),
        },

        Envelope::IceCandidate {
            sender_id: Some(from),
            candidate,
            ..
        } => match find_session(inner, &from).await {
            Some(session) => session.add_ice_candidate(&candidate).await,
            None => debug!(remote_id = %from, "Candidate for unknown session dropped"),
        },

        other => {
            warn!(kind = other.kind(), "Unroutable envelope dropped");
        }
    }
}

async fn handle_session_event(inner: &Arc<ControllerInner>, event: SessionEvent) {
    match event {
        SessionEvent::Signal(envelope) => {
            if let Some(client) = inner.signaling.lock().await.as_ref() {
                if let Err(e) = client.send(envelope).await {
                    warn!(error = %e, "Failed to relay session envelope");
                }
            }
        }

        SessionEvent::RemoteTrack { remote_id, track } => {
            inner
                .remote_tracks
                .write()
                .await
                .entry(remote_id.clone())
                .or_default()
                .push(track.clone());
            let _ = inner.events.send(MeshEvent::RemoteTrack {
                participant_id: remote_id,
                track,
            });
        }

        SessionEvent::StateChanged { remote_id, state } => {
            let _ = inner.events.send(MeshEvent::SessionState {
                participant_id: remote_id,
                state,
            });
        }

        SessionEvent::DataChannelOpen { remote_id } => {
            // Bring the newcomer up to date with our speaking state.
            if inner.media.is_speaking() {
                if let Some(session) = find_session(inner, &remote_id).await {
                    let _ = session.send_data(&DataMessage::speaking(true)).await;
                }
            }
        }

        SessionEvent::Data { remote_id, message } => match message.kind {
            DataKind::Chat => {
                if let Some(text) = message.chat_text() {
                    let _ = inner.events.send(MeshEvent::Chat {
                        participant_id: remote_id,
                        text: text.to_string(),
                        timestamp: message.timestamp,
                    });
                }
            }
            DataKind::Speaking => {
                if let Some(speaking) = message.speaking_flag() {
                    inner
                        .speaking
                        .write()
                        .await
                        .insert(remote_id.clone(), speaking);
                    let _ = inner.events.send(MeshEvent::Speaking {
                        participant_id: remote_id,
                        speaking,
                    });
                }
            }
            DataKind::Control => {
                let _ = inner.events.send(MeshEvent::Control {
                    participant_id: remote_id,
                    payload: message.payload,
                });
            }
        },

        SessionEvent::IceFailed { remote_id } => {
            rebuild_session(inner, &remote_id).await;
        }
    }
}

async fn handle_media_event(inner: &Arc<ControllerInner>, event: MediaEvent) {
    match event {
        MediaEvent::TrackStarted(local) => {
            broadcast_track(inner, &local).await;
        }
        MediaEvent::TrackEnded(source) => {
            remove_track_everywhere(inner, source).await;
        }
        MediaEvent::SpeakingChanged(speaking) => {
            let _ = inner.events.send(MeshEvent::LocalSpeaking(speaking));
            broadcast_data(inner, &DataMessage::speaking(speaking)).await;
        }
    }
}

/// Add a new local track on every session (insertion order) and
/// renegotiate each.
async fn broadcast_track(inner: &Arc<ControllerInner>, local: &LocalTrack) {
    let sessions = inner.sessions.read().await.clone();
    for session in sessions {
        if let Err(e) = session.add_track(local).await {
            warn!(remote_id = %session.remote_id, error = %e, "Failed to add track");
            continue;
        }
        if let Err(e) = session.negotiate().await {
            warn!(remote_id = %session.remote_id, error = %e, "Renegotiation failed");
        }
    }
}

/// Remove an ended local track from every session and renegotiate.
async fn remove_track_everywhere(inner: &Arc<ControllerInner>, source: TrackSource) {
    let sessions = inner.sessions.read().await.clone();
    for session in sessions {
        match session.remove_track(source).await {
            Ok(true) => {
                if let Err(e) = session.negotiate().await {
                    warn!(remote_id = %session.remote_id, error = %e, "Renegotiation failed");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(remote_id = %session.remote_id, error = %e, "Failed to remove track");
            }
        }
    }
}

/// Send a data message to every session, in insertion order.
async fn broadcast_data(inner: &Arc<ControllerInner>, message: &DataMessage) {
    let sessions = inner.sessions.read().await.clone();
    for session in sessions {
        if let Err(e) = session.send_data(message).await {
            debug!(remote_id = %session.remote_id, error = %e, "Data send failed");
        }
    }
}

async fn create_session(
    inner: &Arc<ControllerInner>,
    remote_id: &str,
    role: Role,
) -> Result<Arc<PeerSession>, EngineError> {
    let config = rtc_configuration(&inner.config.ice_servers);
    let session = PeerSession::connect(
        &inner.api,
        config,
        remote_id,
        role,
        inner.config.quality.codec,
        inner.session_events_tx.clone(),
    )
    .await?;

    inner.sessions.write().await.push(session.clone());
    Ok(session)
}

async fn attach_local_tracks(inner: &Arc<ControllerInner>, session: &Arc<PeerSession>) {
    for local in inner.media.live_tracks().await {
        if let Err(e) = session.add_track(&local).await {
            warn!(remote_id = %session.remote_id, error = %e, "Failed to attach local track");
        }
    }
}

async fn find_session(inner: &Arc<ControllerInner>, remote_id: &str) -> Option<Arc<PeerSession>> {
    inner
        .sessions
        .read()
        .await
        .iter()
        .find(|s| s.remote_id == remote_id)
        .cloned()
}

async fn remove_session(inner: &Arc<ControllerInner>, remote_id: &str) -> Option<Arc<PeerSession>> {
    let mut sessions = inner.sessions.write().await;
    let idx = sessions.iter().position(|s| s.remote_id == remote_id)?;
    Some(sessions.remove(idx))
}

async fn close_all_sessions(inner: &Arc<ControllerInner>) {
    let sessions: Vec<Arc<PeerSession>> = inner.sessions.write().await.drain(..).collect();
    for session in sessions {
        session.close().await;
    }
}

/// Tear down a failed session and recreate it with the same role. The
/// initiator re-offers; the responder waits for a fresh offer. Degraded
/// peers stay down until they rejoin.
async fn rebuild_session(inner: &Arc<ControllerInner>, remote_id: &str) {
    let Some(old) = remove_session(inner, remote_id).await else {
        return;
    };

    let role = old.role;
    let degraded = old.is_degraded();
    old.close().await;
    inner.remote_tracks.write().await.remove(remote_id);

    if degraded {
        warn!(remote_id = %remote_id, "Peer degraded; not rebuilding");
        return;
    }

    info!(remote_id = %remote_id, ?role, "Rebuilding session");
    match create_session(inner, remote_id, role).await {
        Ok(session) => {
            attach_local_tracks(inner, &session).await;
            if role == Role::Initiator {
                session.request_negotiation().await;
                if let Err(e) = session.negotiate().await {
                    warn!(remote_id = %remote_id, error = %e, "Rebuild negotiation failed");
                }
            }
        }
        Err(e) => {
            warn!(remote_id = %remote_id, error = %e, "Failed to rebuild session");
        }
    }
}
