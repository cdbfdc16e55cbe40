//! Room Membership
//!
//! One `Room` per room identifier, holding the currently connected members
//! in join order. All mutation goes through the owning registry's handle.

use std::sync::Arc;

use mesh_proto::{Envelope, ParticipantInfo};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// A connected member of a room.
#[derive(Debug, Clone)]
pub struct Member {
    /// Participant record (id, name, joined-at).
    pub info: ParticipantInfo,
    /// Channel to the member's connection writer task.
    pub tx: mpsc::Sender<Envelope>,
}

/// A room with its connected members, kept in join order so that
/// `existing[]` enumeration and broadcasts are deterministic.
pub struct Room {
    /// Room identifier (opaque to the server).
    pub room_id: String,
    members: RwLock<Vec<Member>>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(room_id: String) -> Self {
        Self {
            room_id,
            members: RwLock::new(Vec::new()),
        }
    }

    /// Insert a member. Returns `false` if the participant id is already
    /// present (the caller decides whether to evict first).
    pub async fn insert(&self, member: Member) -> bool {
        let mut members = self.members.write().await;
        if members.iter().any(|m| m.info.id == member.info.id) {
            return false;
        }
        members.push(member);
        true
    }

    /// Remove a member by participant id.
    pub async fn remove(&self, participant_id: &str) -> Option<Member> {
        let mut members = self.members.write().await;
        let idx = members.iter().position(|m| m.info.id == participant_id)?;
        Some(members.remove(idx))
    }

    /// Whether a participant id is currently a member.
    pub async fn contains(&self, participant_id: &str) -> bool {
        let members = self.members.read().await;
        members.iter().any(|m| m.info.id == participant_id)
    }

    /// Participant records in join order, excluding one id.
    pub async fn member_infos_excluding(&self, exclude_id: &str) -> Vec<ParticipantInfo> {
        let members = self.members.read().await;
        members
            .iter()
            .filter(|m| m.info.id != exclude_id)
            .map(|m| m.info.clone())
            .collect()
    }

    /// Send an envelope to one member. Returns `true` if the member was
    /// present and writable; delivery to a closed peer is dropped.
    pub async fn send_to(&self, participant_id: &str, envelope: Envelope) -> bool {
        let tx = {
            let members = self.members.read().await;
            members
                .iter()
                .find(|m| m.info.id == participant_id)
                .map(|m| m.tx.clone())
        };

        match tx {
            Some(tx) => {
                if let Err(e) = tx.send(envelope).await {
                    warn!(participant_id = %participant_id, error = %e, "Dropping send to closed member");
                }
                true
            }
            None => false,
        }
    }

    /// Broadcast an envelope to all members except one.
    ///
    /// Clones the sender handles before sending to avoid holding the lock
    /// during I/O.
    pub async fn broadcast_except(&self, exclude_id: &str, envelope: Envelope) {
        let senders: Vec<(String, mpsc::Sender<Envelope>)> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|m| m.info.id != exclude_id)
                .map(|m| (m.info.id.clone(), m.tx.clone()))
                .collect()
        };

        for (participant_id, tx) in senders {
            if let Err(e) = tx.send(envelope.clone()).await {
                warn!(participant_id = %participant_id, error = %e, "Failed to relay to member");
            }
        }
    }

    /// Member count.
    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether the room has no members.
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

/// Shared handle to a room.
pub type SharedRoom = Arc<Room>;
