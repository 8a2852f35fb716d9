use crate::types::{ParticipantId, ParticipantRole, PeerState, RoomId, SessionType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub session_type: SessionType,
    pub max_participants: usize,
    pub recording_enabled: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Opaque appointment linkage owned by the surrounding application.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub role: ParticipantRole,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub connection_state: PeerState,
}

/// Parameters for creating a room; the server assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSpec {
    pub name: String,
    pub session_type: SessionType,
    pub max_participants: usize,
    pub recording_enabled: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Default for RoomSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            session_type: SessionType::Individual,
            max_participants: 2,
            recording_enabled: false,
            metadata: serde_json::Value::Null,
        }
    }
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: String, role: ParticipantRole) -> Self {
        Self {
            id,
            display_name,
            role,
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
            connection_state: PeerState::Absent,
        }
    }
}
