use super::state::{Participant, Room};
use crate::types::{ParticipantId, PeerState};
use crate::utils::{Error, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Authoritative local view of the current room.
///
/// Every mutation is traceable to a signaling channel event or an explicit
/// local leave; the channel dispatch task is the single writer. Other
/// components only read snapshots.
pub struct RoomRegistry {
    local_id: ParticipantId,
    room: RwLock<Option<Room>>,
    participants: RwLock<HashMap<ParticipantId, Participant>>,
}

impl RoomRegistry {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            room: RwLock::new(None),
            participants: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub async fn room(&self) -> Option<Room> {
        self.room.read().await.clone()
    }

    pub async fn participant(&self, id: &str) -> Option<Participant> {
        self.participants.read().await.get(id).cloned()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.participants.read().await.values().cloned().collect()
    }

    /// Remote participants only, in no particular order.
    pub async fn remote_participants(&self) -> Vec<Participant> {
        self.participants
            .read()
            .await
            .values()
            .filter(|p| p.id != self.local_id)
            .cloned()
            .collect()
    }

    /// Seed the registry after a join/create round trip acknowledged by the
    /// server. Replaces any previous room state.
    pub async fn set_room(&self, room: Room, roster: Vec<Participant>) {
        // Lock order: room before participants, everywhere both are held.
        let mut room_guard = self.room.write().await;
        let mut participants = self.participants.write().await;
        participants.clear();
        for p in roster {
            participants.insert(p.id.clone(), p);
        }
        *room_guard = Some(room);
    }

    /// Apply a `user-joined` event. Returns the participant if this was a new
    /// join, `None` if the id was already present (duplicate event).
    pub async fn apply_user_joined(&self, participant: Participant) -> Result<Option<Participant>> {
        let room = self.room.read().await;
        let room = room
            .as_ref()
            .ok_or_else(|| Error::Room("no active room".to_string()))?;

        let mut participants = self.participants.write().await;
        if participants.contains_key(&participant.id) {
            debug!("duplicate user-joined for {}", participant.id);
            return Ok(None);
        }
        if participants.len() >= room.max_participants {
            return Err(Error::Room(format!(
                "room {} is full ({} participants)",
                room.id, room.max_participants
            )));
        }
        info!(
            "participant {} ({:?}) joined room {}",
            participant.id, participant.role, room.id
        );
        participants.insert(participant.id.clone(), participant.clone());
        Ok(Some(participant))
    }

    /// Apply a `user-left` event. Idempotent: returns true only on the first
    /// removal of the id, so a duplicate leave produces no second transition.
    pub async fn apply_user_left(&self, id: &str) -> bool {
        let removed = self.participants.write().await.remove(id).is_some();
        if removed {
            info!("participant {} left", id);
        } else {
            debug!("duplicate user-left for {}", id);
        }
        removed
    }

    /// Apply a `room-updated` event.
    pub async fn apply_room_updated(&self, room: Room) {
        let mut guard = self.room.write().await;
        match guard.as_ref() {
            Some(current) if current.id == room.id => *guard = Some(room),
            Some(current) => {
                warn!(
                    "ignoring room-updated for {} while in room {}",
                    room.id, current.id
                );
            }
            None => *guard = Some(room),
        }
    }

    pub async fn set_connection_state(&self, id: &str, state: PeerState) {
        if let Some(p) = self.participants.write().await.get_mut(id) {
            p.connection_state = state;
        }
    }

    pub async fn set_screen_sharing(&self, id: &str, sharing: bool) {
        if let Some(p) = self.participants.write().await.get_mut(id) {
            p.screen_sharing = sharing;
        }
    }

    /// Drop all room state on local leave.
    pub async fn clear(&self) {
        self.participants.write().await.clear();
        *self.room.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParticipantRole, SessionType};
    use chrono::Utc;

    fn test_room(capacity: usize) -> Room {
        Room {
            id: "room-1".to_string(),
            name: "weekly session".to_string(),
            session_type: SessionType::Group,
            max_participants: capacity,
            recording_enabled: false,
            started_at: Utc::now(),
            ended_at: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn participant(id: &str, role: ParticipantRole) -> Participant {
        Participant::new(id.to_string(), id.to_string(), role)
    }

    #[tokio::test]
    async fn join_then_duplicate_join_is_ignored() {
        let registry = RoomRegistry::new("me".to_string());
        registry.set_room(test_room(4), vec![]).await;

        let joined = registry
            .apply_user_joined(participant("alice", ParticipantRole::Therapist))
            .await
            .unwrap();
        assert!(joined.is_some());

        let again = registry
            .apply_user_joined(participant("alice", ParticipantRole::Therapist))
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(registry.participants().await.len(), 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let registry = RoomRegistry::new("me".to_string());
        registry.set_room(test_room(1), vec![]).await;

        registry
            .apply_user_joined(participant("alice", ParticipantRole::Therapist))
            .await
            .unwrap();
        let err = registry
            .apply_user_joined(participant("bob", ParticipantRole::Client))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let registry = RoomRegistry::new("me".to_string());
        registry.set_room(test_room(4), vec![]).await;
        registry
            .apply_user_joined(participant("alice", ParticipantRole::Client))
            .await
            .unwrap();

        assert!(registry.apply_user_left("alice").await);
        assert!(!registry.apply_user_left("alice").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_seed_and_join_do_not_deadlock() {
        use std::sync::Arc;

        let registry = Arc::new(RoomRegistry::new("me".to_string()));
        registry.set_room(test_room(500), vec![]).await;

        let seeder = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    registry.set_room(test_room(500), vec![]).await;
                }
            })
        };
        let joiner = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let _ = registry
                        .apply_user_joined(participant(
                            &format!("p{}", i),
                            ParticipantRole::Client,
                        ))
                        .await;
                }
            })
        };

        seeder.await.unwrap();
        joiner.await.unwrap();
    }

    #[tokio::test]
    async fn room_updated_for_other_room_is_ignored() {
        let registry = RoomRegistry::new("me".to_string());
        registry.set_room(test_room(4), vec![]).await;

        let mut other = test_room(4);
        other.id = "room-2".to_string();
        registry.apply_room_updated(other).await;

        assert_eq!(registry.room().await.unwrap().id, "room-1");
    }
}
