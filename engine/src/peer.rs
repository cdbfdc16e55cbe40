//! Peer Session
//!
//! One full-duplex WebRTC session to one remote participant: negotiation
//! state machine, track senders, data channel, and ICE recovery. Roles
//! are fixed by join order — the newcomer initiates toward every peer
//! already in the room — so exactly one side issues the initial offer and
//! glare at renegotiation resolves deterministically: the responder rolls
//! back, the initiator ignores the colliding offer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_proto::Envelope;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

use crate::channel::{DataMessage, DATA_CHANNEL_LABEL};
use crate::config::IceServerConfig;
use crate::error::EngineError;
use crate::media::codecs::{preference_order, CodecPreference};
use crate::media::{LocalTrack, TrackSource};

/// Grace window for ICE `Disconnected` before the session is rebuilt.
const ICE_GRACE: Duration = Duration::from_secs(2);

/// Negotiation faults tolerated before a peer is marked degraded.
const MAX_NEGOTIATION_FAULTS: u32 = 3;

/// Which side issues the initial offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The newcomer; offers toward each peer already in the room.
    Initiator,
    /// Was in the room first; answers the newcomer's offer.
    Responder,
}

/// Session negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    NeedsOffer,
    Offered,
    Stable,
    Recovering,
    Closed,
}

/// Events a session reports to its controller.
pub enum SessionEvent {
    /// Outbound envelope to relay through the signaling client.
    Signal(Envelope),
    /// A remote track arrived.
    RemoteTrack {
        remote_id: String,
        track: Arc<TrackRemote>,
    },
    /// Negotiation state transition.
    StateChanged {
        remote_id: String,
        state: NegotiationState,
    },
    /// ICE failed (or stayed disconnected past the grace window); the
    /// controller should rebuild the session with the same role.
    IceFailed { remote_id: String },
    /// The data channel opened.
    DataChannelOpen { remote_id: String },
    /// Inbound data-channel message.
    Data {
        remote_id: String,
        message: DataMessage,
    },
}

/// One session to one remote peer.
pub struct PeerSession {
    pub remote_id: String,
    pub role: Role,
    pc: Arc<webrtc::peer_connection::RTCPeerConnection>,
    state: RwLock<NegotiationState>,
    senders: RwLock<Vec<(TrackSource, Arc<RTCRtpSender>)>>,
    data_channel: RwLock<Option<Arc<RTCDataChannel>>>,
    codec_preference: CodecPreference,
    last_ice_state: RwLock<RTCIceConnectionState>,
    negotiation_faults: AtomicU32,
    degraded: AtomicBool,
    events: mpsc::Sender<SessionEvent>,
    // Serializes SDP operations per session.
    sdp_lock: Mutex<()>,
}

/// Build an `RTCConfiguration` from ICE server config.
#[must_use]
pub fn rtc_configuration(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    let ice_servers: Vec<RTCIceServer> = ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

impl PeerSession {
    /// Create the underlying connection and wire its event handlers. The
    /// initiator also creates the data channel so its m-line is part of
    /// the initial offer.
    pub async fn connect(
        api: &API,
        config: RTCConfiguration,
        remote_id: &str,
        role: Role,
        codec_preference: CodecPreference,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<Self>, EngineError> {
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let session = Arc::new(Self {
            remote_id: remote_id.to_string(),
            role,
            pc,
            state: RwLock::new(NegotiationState::New),
            senders: RwLock::new(Vec::new()),
            data_channel: RwLock::new(None),
            codec_preference,
            last_ice_state: RwLock::new(RTCIceConnectionState::New),
            negotiation_faults: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            events,
            sdp_lock: Mutex::new(()),
        });

        session.setup_handlers();

        if role == Role::Initiator {
            let dc = session
                .pc
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await?;
            session.adopt_data_channel(dc).await;
        }

        info!(remote_id = %remote_id, ?role, "Peer session created");
        Ok(session)
    }

    fn setup_handlers(self: &Arc<Self>) {
        // Local ICE candidates go out addressed to the remote peer.
        let events = self.events.clone();
        let remote_id = self.remote_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            if let Ok(json) = serde_json::to_string(&init) {
                                let _ = events
                                    .send(SessionEvent::Signal(Envelope::IceCandidate {
                                        sender_id: None,
                                        target_id: remote_id,
                                        candidate: json,
                                    }))
                                    .await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize ICE candidate");
                        }
                    }
                })
            }));

        // Remote tracks surface to the controller.
        let events = self.events.clone();
        let remote_id = self.remote_id.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let events = events.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    info!(
                        remote_id = %remote_id,
                        kind = %track.kind(),
                        stream_id = %track.stream_id(),
                        "Remote track received"
                    );
                    let _ = events
                        .send(SessionEvent::RemoteTrack { remote_id, track })
                        .await;
                })
            },
        ));

        // ICE state drives recovery: Failed immediately, Disconnected
        // after a grace window.
        let session_weak = Arc::downgrade(self);
        self.pc
            .on_ice_connection_state_change(Box::new(move |ice_state: RTCIceConnectionState| {
                let session_weak = session_weak.clone();
                Box::pin(async move {
                    let Some(session) = session_weak.upgrade() else {
                        return;
                    };
                    *session.last_ice_state.write().await = ice_state;
                    debug!(remote_id = %session.remote_id, ?ice_state, "ICE state changed");

                    match ice_state {
                        RTCIceConnectionState::Failed => {
                            session.report_ice_failure().await;
                        }
                        RTCIceConnectionState::Disconnected => {
                            let weak = Arc::downgrade(&session);
                            tokio::spawn(async move {
                                tokio::time::sleep(ICE_GRACE).await;
                                let Some(session) = weak.upgrade() else { return };
                                let still_down = matches!(
                                    *session.last_ice_state.read().await,
                                    RTCIceConnectionState::Disconnected
                                        | RTCIceConnectionState::Failed
                                );
                                if still_down {
                                    session.report_ice_failure().await;
                                }
                            });
                        }
                        _ => {}
                    }
                })
            }));

        let remote_id = self.remote_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    debug!(remote_id = %remote_id, ?state, "Peer connection state changed");
                })
            }));

        // The responder adopts the initiator's channel.
        if self.role == Role::Responder {
            let session_weak = Arc::downgrade(self);
            self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let session_weak = session_weak.clone();
                Box::pin(async move {
                    let Some(session) = session_weak.upgrade() else {
                        return;
                    };
                    if dc.label() == DATA_CHANNEL_LABEL {
                        session.adopt_data_channel(dc).await;
                    } else {
                        warn!(label = %dc.label(), "Unexpected data channel ignored");
                    }
                })
            }));
        }
    }

    /// Store a data channel and wire its message handlers.
    async fn adopt_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let events = self.events.clone();
        let remote_id = self.remote_id.clone();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                debug!(remote_id = %remote_id, "Data channel open");
                let _ = events.send(SessionEvent::DataChannelOpen { remote_id }).await;
            })
        }));

        let events = self.events.clone();
        let remote_id = self.remote_id.clone();
        dc.on_message(Box::new(move |msg| {
            let events = events.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                if !msg.is_string {
                    return;
                }
                match serde_json::from_slice::<DataMessage>(&msg.data) {
                    Ok(message) => {
                        let _ = events.send(SessionEvent::Data { remote_id, message }).await;
                    }
                    Err(e) => {
                        warn!(remote_id = %remote_id, error = %e, "Malformed data message dropped");
                    }
                }
            })
        }));

        *self.data_channel.write().await = Some(dc);
    }

    /// Current negotiation state.
    pub async fn state(&self) -> NegotiationState {
        *self.state.read().await
    }

    /// Whether repeated faults paused retries for this peer.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn set_state(&self, new_state: NegotiationState) {
        {
            let mut state = self.state.write().await;
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        let _ = self
            .events
            .send(SessionEvent::StateChanged {
                remote_id: self.remote_id.clone(),
                state: new_state,
            })
            .await;
    }

    /// Flag that the local track set changed and a new offer is needed.
    /// The responder in `New` keeps waiting for the initial offer instead.
    pub async fn request_negotiation(&self) {
        let current = self.state().await;
        match current {
            NegotiationState::New if self.role == Role::Initiator => {
                self.set_state(NegotiationState::NeedsOffer).await;
            }
            NegotiationState::Stable => {
                self.set_state(NegotiationState::NeedsOffer).await;
            }
            _ => {}
        }
    }

    /// Attach a local track. Renegotiation is required before the remote
    /// side observes it.
    pub async fn add_track(&self, local: &LocalTrack) -> Result<(), EngineError> {
        let sender = self.pc.add_track(local.track.clone()).await?;

        // Drain RTCP for this sender; the interceptors need the reads.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.write().await.push((local.source, sender));
        self.apply_codec_preferences().await;
        self.request_negotiation().await;

        debug!(remote_id = %self.remote_id, stream_id = %local.source.stream_id(), "Track added");
        Ok(())
    }

    /// Detach the sender for a local source. Returns whether one existed.
    pub async fn remove_track(&self, source: TrackSource) -> Result<bool, EngineError> {
        let sender = {
            let mut senders = self.senders.write().await;
            senders
                .iter()
                .position(|(s, _)| *s == source)
                .map(|i| senders.remove(i).1)
        };

        let Some(sender) = sender else {
            return Ok(false);
        };

        self.pc.remove_track(&sender).await?;
        self.request_negotiation().await;

        debug!(remote_id = %self.remote_id, stream_id = %source.stream_id(), "Track removed");
        Ok(true)
    }

    /// Create and send an offer if the session needs one.
    pub async fn negotiate(&self) -> Result<(), EngineError> {
        if self.is_degraded() {
            return Err(EngineError::PeerDegraded(self.remote_id.clone()));
        }

        let _guard = self.sdp_lock.lock().await;
        if self.state().await != NegotiationState::NeedsOffer {
            return Ok(());
        }
        self.create_and_send_offer().await
    }

    /// Offer creation; caller holds the SDP lock.
    async fn create_and_send_offer(&self) -> Result<(), EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(|e| self.fault(e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| self.fault(e))?;

        self.set_state(NegotiationState::Offered).await;

        let _ = self
            .events
            .send(SessionEvent::Signal(Envelope::Offer {
                sender_id: None,
                target_id: self.remote_id.clone(),
                sdp: offer.sdp,
            }))
            .await;

        Ok(())
    }

    /// Apply a remote offer and answer it. A colliding offer is ignored
    /// by the initiator; the responder rolls back its pending local
    /// description first.
    pub async fn handle_offer(&self, sdp: &str) -> Result<(), EngineError> {
        let _guard = self.sdp_lock.lock().await;

        let previous = self.state().await;
        let had_pending = matches!(
            previous,
            NegotiationState::NeedsOffer | NegotiationState::Offered
        );

        if self.pc.signaling_state() != RTCSignalingState::Stable {
            if self.role == Role::Initiator {
                debug!(remote_id = %self.remote_id, "Glare: ignoring colliding offer");
                return Ok(());
            }

            debug!(remote_id = %self.remote_id, "Glare: rolling back local offer");
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc
                .set_local_description(rollback)
                .await
                .map_err(|e| self.fault(e))?;
        }

        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| self.fault(e))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| self.fault(e))?;

        let answer = self.pc.create_answer(None).await.map_err(|e| self.fault(e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| self.fault(e))?;

        self.apply_codec_preferences().await;
        self.set_state(NegotiationState::Stable).await;

        let _ = self
            .events
            .send(SessionEvent::Signal(Envelope::Answer {
                sender_id: None,
                target_id: self.remote_id.clone(),
                sdp: answer.sdp,
            }))
            .await;

        // A rolled-back local change still has to be negotiated, and a
        // first answer cannot announce senders the offer had no m-line
        // for; follow up with our own offer now that the session is
        // stable again.
        let has_senders = !self.senders.read().await.is_empty();
        let needs_followup = self.role == Role::Responder
            && (had_pending || (previous == NegotiationState::New && has_senders));
        if needs_followup {
            self.set_state(NegotiationState::NeedsOffer).await;
            self.create_and_send_offer().await?;
        }

        Ok(())
    }

    /// Apply a remote answer to our pending offer.
    pub async fn handle_answer(&self, sdp: &str) -> Result<(), EngineError> {
        let _guard = self.sdp_lock.lock().await;

        if self.state().await != NegotiationState::Offered {
            let err = EngineError::Negotiation(format!(
                "unexpected answer from {} in state {:?}",
                self.remote_id,
                self.state().await
            ));
            self.record_fault();
            return Err(err);
        }

        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| self.fault(e))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| self.fault(e))?;

        self.set_state(NegotiationState::Stable).await;
        Ok(())
    }

    /// Apply a relayed ICE candidate. Failures are non-fatal: the
    /// candidate may have been invalidated by a state transition.
    pub async fn add_ice_candidate(&self, candidate_json: &str) {
        match serde_json::from_str::<RTCIceCandidateInit>(candidate_json) {
            Ok(init) => {
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    debug!(remote_id = %self.remote_id, error = %e, "ICE candidate rejected");
                }
            }
            Err(e) => {
                warn!(remote_id = %self.remote_id, error = %e, "Malformed ICE candidate dropped");
            }
        }
    }

    /// Send a message over the data channel. Messages before the channel
    /// opens are dropped (speaking updates are lossy by design).
    pub async fn send_data(&self, message: &DataMessage) -> Result<(), EngineError> {
        let dc = self.data_channel.read().await.clone();
        let Some(dc) = dc else {
            return Ok(());
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Ok(());
        }

        let json = serde_json::to_string(message)
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        dc.send_text(json).await?;
        Ok(())
    }

    /// Close the session and release the connection.
    pub async fn close(&self) {
        self.set_state(NegotiationState::Closed).await;
        self.senders.write().await.clear();
        *self.data_channel.write().await = None;
        if let Err(e) = self.pc.close().await {
            warn!(remote_id = %self.remote_id, error = %e, "Error closing peer connection");
        }
        info!(remote_id = %self.remote_id, "Peer session closed");
    }

    async fn report_ice_failure(&self) {
        if self.state().await == NegotiationState::Closed {
            return;
        }
        warn!(remote_id = %self.remote_id, "ICE failure, session needs rebuild");
        self.set_state(NegotiationState::Recovering).await;
        let _ = self
            .events
            .send(SessionEvent::IceFailed {
                remote_id: self.remote_id.clone(),
            })
            .await;
    }

    async fn apply_codec_preferences(&self) {
        let order = preference_order(self.codec_preference);
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() == RTPCodecType::Video {
                if let Err(e) = transceiver.set_codec_preferences(order.clone()).await {
                    debug!(remote_id = %self.remote_id, error = %e, "Failed to set codec preferences");
                }
            }
        }
    }

    fn fault(&self, err: webrtc::Error) -> EngineError {
        self.record_fault();
        EngineError::Negotiation(err.to_string())
    }

    fn record_fault(&self) {
        let faults = self.negotiation_faults.fetch_add(1, Ordering::Relaxed) + 1;
        if faults >= MAX_NEGOTIATION_FAULTS && !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                remote_id = %self.remote_id,
                faults,
                "Peer degraded after repeated negotiation faults; pausing retries"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::codecs::build_api;

    async fn session_pair() -> (
        Arc<PeerSession>,
        mpsc::Receiver<SessionEvent>,
        Arc<PeerSession>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let api = build_api().unwrap();
        let (tx_a, rx_a) = mpsc::channel(32);
        let (tx_b, rx_b) = mpsc::channel(32);

        let a = PeerSession::connect(
            &api,
            RTCConfiguration::default(),
            "B",
            Role::Initiator,
            CodecPreference::Auto,
            tx_a,
        )
        .await
        .unwrap();
        let b = PeerSession::connect(
            &api,
            RTCConfiguration::default(),
            "A",
            Role::Responder,
            CodecPreference::Auto,
            tx_b,
        )
        .await
        .unwrap();

        (a, rx_a, b, rx_b)
    }

    async fn next_signal(rx: &mut mpsc::Receiver<SessionEvent>) -> Envelope {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("session event channel closed")
            {
                SessionEvent::Signal(envelope) if !matches!(envelope, Envelope::IceCandidate { .. }) => {
                    return envelope;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn initiator_offers_and_responder_answers_to_stable() {
        let (a, mut rx_a, b, mut rx_b) = session_pair().await;

        a.request_negotiation().await;
        assert_eq!(a.state().await, NegotiationState::NeedsOffer);
        a.negotiate().await.unwrap();
        assert_eq!(a.state().await, NegotiationState::Offered);

        let Envelope::Offer { target_id, sdp, .. } = next_signal(&mut rx_a).await else {
            panic!("expected Offer from initiator");
        };
        assert_eq!(target_id, "B");

        b.handle_offer(&sdp).await.unwrap();
        assert_eq!(b.state().await, NegotiationState::Stable);

        let Envelope::Answer { target_id, sdp, .. } = next_signal(&mut rx_b).await else {
            panic!("expected Answer from responder");
        };
        assert_eq!(target_id, "A");

        a.handle_answer(&sdp).await.unwrap();
        assert_eq!(a.state().await, NegotiationState::Stable);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn responder_in_new_waits_for_offer() {
        let (_a, _rx_a, b, _rx_b) = session_pair().await;

        b.request_negotiation().await;
        assert_eq!(b.state().await, NegotiationState::New);

        b.negotiate().await.unwrap();
        assert_eq!(b.state().await, NegotiationState::New);

        b.close().await;
    }

    #[tokio::test]
    async fn glare_resolves_without_reconnection() {
        let (a, mut rx_a, b, mut rx_b) = session_pair().await;

        // Initial negotiation to Stable.
        a.request_negotiation().await;
        a.negotiate().await.unwrap();
        let Envelope::Offer { sdp, .. } = next_signal(&mut rx_a).await else {
            panic!("expected Offer");
        };
        b.handle_offer(&sdp).await.unwrap();
        let Envelope::Answer { sdp, .. } = next_signal(&mut rx_b).await else {
            panic!("expected Answer");
        };
        a.handle_answer(&sdp).await.unwrap();

        // Simulated concurrent renegotiation: both sides offer at once.
        a.request_negotiation().await;
        b.request_negotiation().await;
        a.negotiate().await.unwrap();
        b.negotiate().await.unwrap();

        let Envelope::Offer { sdp: offer_a, .. } = next_signal(&mut rx_a).await else {
            panic!("expected Offer from A");
        };
        let Envelope::Offer { sdp: offer_b, .. } = next_signal(&mut rx_b).await else {
            panic!("expected Offer from B");
        };

        // The initiator ignores the colliding offer and stays Offered.
        a.handle_offer(&offer_b).await.unwrap();
        assert_eq!(a.state().await, NegotiationState::Offered);

        // The responder rolls back, answers, then re-issues its own offer.
        b.handle_offer(&offer_a).await.unwrap();
        let Envelope::Answer { sdp: answer_b, .. } = next_signal(&mut rx_b).await else {
            panic!("expected Answer from B");
        };
        a.handle_answer(&answer_b).await.unwrap();
        assert_eq!(a.state().await, NegotiationState::Stable);

        // B's rolled-back renegotiation follows up as a fresh offer.
        let Envelope::Offer { sdp: reoffer_b, .. } = next_signal(&mut rx_b).await else {
            panic!("expected follow-up Offer from B");
        };
        a.handle_offer(&reoffer_b).await.unwrap();
        let Envelope::Answer { sdp: answer_a, .. } = next_signal(&mut rx_a).await else {
            panic!("expected Answer from A");
        };
        b.handle_answer(&answer_a).await.unwrap();

        assert_eq!(a.state().await, NegotiationState::Stable);
        assert_eq!(b.state().await, NegotiationState::Stable);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn unexpected_answer_is_a_counted_fault() {
        let (a, _rx_a, _b, _rx_b) = session_pair().await;

        assert!(a.handle_answer("v=0").await.is_err());
        assert!(!a.is_degraded());

        // Repeated faults degrade the peer and pause negotiation.
        assert!(a.handle_answer("v=0").await.is_err());
        assert!(a.handle_answer("v=0").await.is_err());
        assert!(a.is_degraded());
        assert!(matches!(
            a.negotiate().await,
            Err(EngineError::PeerDegraded(_))
        ));

        a.close().await;
    }

    #[tokio::test]
    async fn malformed_ice_candidate_is_non_fatal() {
        let (a, _rx_a, _b, _rx_b) = session_pair().await;
        a.add_ice_candidate("not json").await;
        a.add_ice_candidate(r#"{"candidate":"bogus"}"#).await;
        assert!(!a.is_degraded());
        a.close().await;
    }
}
