//! Rendezvous Registry
//!
//! Maps room identifiers to live rooms. Rooms are created implicitly on
//! first join and deleted when the last member leaves. The registry never
//! inspects SDP or ICE payloads; it only routes envelopes.

pub mod room;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub use room::{Member, Room, SharedRoom};

/// Registry of all live rooms.
pub struct Rendezvous {
    rooms: RwLock<HashMap<String, SharedRoom>>,
}

impl Rendezvous {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Assign a fresh participant id.
    #[must_use]
    pub fn assign_participant_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Get or create the room for an identifier.
    pub async fn get_or_create_room(&self, room_id: &str) -> SharedRoom {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(room_id.to_string()));
        rooms.insert(room_id.to_string(), room.clone());

        debug!(room_id = %room_id, "Created room");

        room
    }

    /// Get a room by identifier.
    pub async fn get_room(&self, room_id: &str) -> Option<SharedRoom> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Enforce that a participant id lives in at most one room: remove it
    /// from every room except the one it is joining, announcing the
    /// departure to the members left behind.
    pub async fn evict_from_other_rooms(&self, participant_id: &str, joining_room: &str) {
        let rooms: Vec<SharedRoom> = self.rooms.read().await.values().cloned().collect();

        for room in rooms {
            if room.room_id == joining_room {
                continue;
            }
            if room.remove(participant_id).await.is_some() {
                debug!(
                    participant_id = %participant_id,
                    room_id = %room.room_id,
                    "Evicted participant joining another room"
                );
                room.broadcast_except(
                    participant_id,
                    mesh_proto::Envelope::PeerLeft {
                        participant_id: participant_id.to_string(),
                    },
                )
                .await;
                self.cleanup_room_if_empty(&room.room_id).await;
            }
        }
    }

    /// Remove a room if it has no members left.
    pub async fn cleanup_room_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(room_id) {
            if room.is_empty().await {
                rooms.remove(room_id);
                debug!(room_id = %room_id, "Removed empty room");
            }
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proto::ParticipantInfo;
    use tokio::sync::mpsc;

    async fn join(registry: &Rendezvous, room_id: &str, id: &str) -> SharedRoom {
        let room = registry.get_or_create_room(room_id).await;
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        room.insert(Member {
            info: ParticipantInfo::new(id, None),
            tx,
        })
        .await;
        room
    }

    #[tokio::test]
    async fn room_is_created_on_first_join_and_reused() {
        let registry = Rendezvous::new();
        let first = join(&registry, "R", "A").await;
        let second = registry.get_or_create_room("R").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn empty_room_is_deleted() {
        let registry = Rendezvous::new();
        let room = join(&registry, "R", "A").await;

        room.remove("A").await;
        registry.cleanup_room_if_empty("R").await;

        assert!(registry.get_room("R").await.is_none());
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn occupied_room_survives_cleanup() {
        let registry = Rendezvous::new();
        join(&registry, "R", "A").await;

        registry.cleanup_room_if_empty("R").await;

        assert!(registry.get_room("R").await.is_some());
    }

    #[tokio::test]
    async fn assigned_ids_are_unique() {
        let a = Rendezvous::assign_participant_id();
        let b = Rendezvous::assign_participant_id();
        assert_ne!(a, b);
    }
}
