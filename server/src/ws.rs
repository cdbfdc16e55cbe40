//! WebSocket Handler
//!
//! One task per connection. Inbound frames are parsed into envelopes and
//! dispatched against the connection's room; outbound envelopes flow
//! through a per-connection channel drained by a writer task.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use mesh_proto::{Envelope, ParticipantInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::rendezvous::{Member, Rendezvous, SharedRoom};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Room registry.
    pub rendezvous: Arc<Rendezvous>,
}

impl AppState {
    /// Create state with an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rendezvous: Arc::new(Rendezvous::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable per-connection record.
struct ConnState {
    room: Option<SharedRoom>,
    participant_id: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one WebSocket connection until it closes.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel drained by the writer task below
    let (tx, mut rx) = mpsc::channel::<Envelope>(100);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize envelope");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnState {
        room: None,
        participant_id: None,
    };

    info!("Connection accepted");

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => handle_envelope(&state, &mut conn, &tx, envelope).await,
                Err(e) => {
                    warn!(error = %e, "Malformed envelope dropped");
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("Connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Connection close counts as a Leave with the last known id.
    leave_current_room(&state, &mut conn).await;
    writer.abort();

    info!("Connection closed");
}

/// Dispatch one parsed envelope.
async fn handle_envelope(
    state: &AppState,
    conn: &mut ConnState,
    tx: &mpsc::Sender<Envelope>,
    envelope: Envelope,
) {
    match envelope {
        Envelope::Join {
            room_id,
            participant_id,
            name,
        } => handle_join(state, conn, tx, room_id, participant_id, name).await,
        Envelope::Leave { .. } => {
            leave_current_room(state, conn).await;
        }
        Envelope::Offer { .. } | Envelope::Answer { .. } | Envelope::IceCandidate { .. } => {
            relay_addressed(conn, envelope).await;
        }
        Envelope::Ping => {
            let _ = tx.send(Envelope::Pong).await;
        }
        Envelope::Pong => {}
        other => {
            // Server-originated variants have no business arriving here.
            warn!(kind = other.kind(), "Unexpected envelope from client, dropped");
        }
    }
}

/// Handle a `Join`: switch rooms if needed, assign an id when absent, ack
/// with the existing membership, and announce the newcomer.
async fn handle_join(
    state: &AppState,
    conn: &mut ConnState,
    tx: &mpsc::Sender<Envelope>,
    room_id: String,
    participant_id: Option<String>,
    name: Option<String>,
) {
    // Rejoining the current room with the current id leaves membership
    // unchanged; just re-ack.
    if let (Some(room), Some(self_id)) = (&conn.room, &conn.participant_id) {
        if room.room_id == room_id && participant_id.as_deref() == Some(self_id.as_str()) {
            let existing = room.member_infos_excluding(self_id).await;
            let _ = tx
                .send(Envelope::JoinAck {
                    room_id,
                    participant_id: self_id.clone(),
                    existing,
                })
                .await;
            return;
        }
    }

    // Joining a different room implies leaving the current one.
    if conn.room.is_some() {
        leave_current_room(state, conn).await;
    }

    let id = participant_id.unwrap_or_else(Rendezvous::assign_participant_id);

    // A participant id belongs to at most one room and one connection.
    state.rendezvous.evict_from_other_rooms(&id, &room_id).await;

    let room = state.rendezvous.get_or_create_room(&room_id).await;

    // A preassigned id may still be registered to a stale connection
    // (e.g. a client reconnecting after heartbeat loss). Evict it so the
    // id maps to exactly one connection.
    if room.contains(&id).await {
        room.remove(&id).await;
        debug!(participant_id = %id, room_id = %room_id, "Evicted stale member on rejoin");
    }

    let existing = room.member_infos_excluding(&id).await;

    room.insert(Member {
        info: ParticipantInfo::new(id.clone(), name.clone()),
        tx: tx.clone(),
    })
    .await;

    conn.room = Some(room.clone());
    conn.participant_id = Some(id.clone());

    let _ = tx
        .send(Envelope::JoinAck {
            room_id: room_id.clone(),
            participant_id: id.clone(),
            existing,
        })
        .await;

    room.broadcast_except(
        &id,
        Envelope::PeerJoined {
            participant_id: id.clone(),
            name,
        },
    )
    .await;

    info!(participant_id = %id, room_id = %room_id, "Participant joined");
}

/// Relay an addressed envelope to its target within the sender's room,
/// with the server's record of the sender injected. Absent targets are
/// silently dropped (the peer may have left).
async fn relay_addressed(conn: &ConnState, mut envelope: Envelope) {
    let (Some(room), Some(self_id)) = (&conn.room, &conn.participant_id) else {
        warn!(kind = envelope.kind(), "Addressed envelope before join, dropped");
        return;
    };

    envelope.set_sender(self_id);

    let Some(target_id) = envelope.target_id().map(str::to_string) else {
        return;
    };

    if !room.send_to(&target_id, envelope).await {
        debug!(target_id = %target_id, "Relay target absent, dropped");
    }
}

/// Remove the connection from its room (if any), announce the departure,
/// and delete the room when it becomes empty.
async fn leave_current_room(state: &AppState, conn: &mut ConnState) {
    let (Some(room), Some(id)) = (conn.room.take(), conn.participant_id.take()) else {
        return;
    };

    room.remove(&id).await;

    room.broadcast_except(
        &id,
        Envelope::PeerLeft {
            participant_id: id.clone(),
        },
    )
    .await;

    state.rendezvous.cleanup_room_if_empty(&room.room_id).await;

    info!(participant_id = %id, room_id = %room.room_id, "Participant left");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with(room: Option<SharedRoom>, id: Option<&str>) -> ConnState {
        ConnState {
            room,
            participant_id: id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn rejoin_same_room_same_id_is_idempotent() {
        let state = AppState::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut conn = conn_with(None, None);

        handle_join(
            &state,
            &mut conn,
            &tx,
            "R".into(),
            Some("A".into()),
            None,
        )
        .await;
        let room = state.rendezvous.get_room("R").await.unwrap();
        assert_eq!(room.len().await, 1);
        assert!(matches!(rx.recv().await, Some(Envelope::JoinAck { .. })));

        handle_join(
            &state,
            &mut conn,
            &tx,
            "R".into(),
            Some("A".into()),
            None,
        )
        .await;
        assert_eq!(room.len().await, 1);
        assert!(matches!(rx.recv().await, Some(Envelope::JoinAck { .. })));
    }

    #[tokio::test]
    async fn join_switches_rooms_and_deletes_empty_one() {
        let state = AppState::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut conn = conn_with(None, None);

        handle_join(&state, &mut conn, &tx, "R1".into(), Some("A".into()), None).await;
        handle_join(&state, &mut conn, &tx, "R2".into(), Some("A".into()), None).await;

        assert!(state.rendezvous.get_room("R1").await.is_none());
        let r2 = state.rendezvous.get_room("R2").await.unwrap();
        assert!(r2.contains("A").await);

        // Two acks, one per join.
        assert!(matches!(rx.recv().await, Some(Envelope::JoinAck { .. })));
        assert!(matches!(rx.recv().await, Some(Envelope::JoinAck { .. })));
    }

    #[tokio::test]
    async fn server_assigns_id_when_absent() {
        let state = AppState::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut conn = conn_with(None, None);

        handle_join(&state, &mut conn, &tx, "R".into(), None, Some("Ada".into())).await;

        let Some(Envelope::JoinAck {
            participant_id,
            existing,
            ..
        }) = rx.recv().await
        else {
            panic!("expected JoinAck");
        };
        assert!(!participant_id.is_empty());
        assert!(existing.is_empty());
        assert_eq!(conn.participant_id.as_deref(), Some(participant_id.as_str()));
    }

    #[tokio::test]
    async fn participant_id_belongs_to_at_most_one_room() {
        let state = AppState::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let mut conn1 = conn_with(None, None);
        let mut conn2 = conn_with(None, None);

        handle_join(&state, &mut conn1, &tx1, "R1".into(), Some("X".into()), None).await;
        handle_join(&state, &mut conn2, &tx2, "R2".into(), Some("X".into()), None).await;

        // The id moved; the vacated room was deleted with it.
        assert!(state.rendezvous.get_room("R1").await.is_none());
        let r2 = state.rendezvous.get_room("R2").await.unwrap();
        assert!(r2.contains("X").await);
        assert_eq!(r2.len().await, 1);
    }

    #[tokio::test]
    async fn addressed_envelope_before_join_is_dropped() {
        let conn = conn_with(None, None);
        // Must not panic or route anywhere.
        relay_addressed(
            &conn,
            Envelope::Offer {
                sender_id: None,
                target_id: "A".into(),
                sdp: "v=0".into(),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn relay_injects_server_recorded_sender() {
        let state = AppState::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let mut conn_a = conn_with(None, None);
        let mut conn_b = conn_with(None, None);

        handle_join(&state, &mut conn_a, &tx_a, "R".into(), Some("A".into()), None).await;
        handle_join(&state, &mut conn_b, &tx_b, "R".into(), Some("B".into()), None).await;
        let _ack_b = rx_b.recv().await;

        // B claims to be someone else; the server stamps its own record.
        relay_addressed(
            &conn_b,
            Envelope::Offer {
                sender_id: Some("mallory".into()),
                target_id: "A".into(),
                sdp: "v=0".into(),
            },
        )
        .await;

        let _ack_a = rx_a.recv().await;
        let _peer_joined = rx_a.recv().await;
        let Some(Envelope::Offer {
            sender_id, sdp, ..
        }) = rx_a.recv().await
        else {
            panic!("expected relayed Offer");
        };
        assert_eq!(sender_id.as_deref(), Some("B"));
        assert_eq!(sdp, "v=0");
    }

    #[tokio::test]
    async fn leave_announces_peer_left_and_deletes_empty_room() {
        let state = AppState::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        let mut conn_a = conn_with(None, None);
        let mut conn_b = conn_with(None, None);

        handle_join(&state, &mut conn_a, &tx_a, "R".into(), Some("A".into()), None).await;
        handle_join(&state, &mut conn_b, &tx_b, "R".into(), Some("B".into()), None).await;

        leave_current_room(&state, &mut conn_b).await;

        let _ack = rx_a.recv().await;
        let _joined = rx_a.recv().await;
        assert!(matches!(
            rx_a.recv().await,
            Some(Envelope::PeerLeft { participant_id }) if participant_id == "B"
        ));

        leave_current_room(&state, &mut conn_a).await;
        assert!(state.rendezvous.get_room("R").await.is_none());
    }
}
