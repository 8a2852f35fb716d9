use super::state::{Room, RoomSpec};
use crate::types::{ParticipantId, RoomId};
use crate::utils::Result;
use async_trait::async_trait;

/// Room lifecycle interface owned by the surrounding application.
///
/// Implementations call the application's REST endpoints and translate any
/// non-2xx response into an `Err`. The core never persists rooms itself; it
/// only reacts to what this collaborator and the signaling channel report.
#[async_trait]
pub trait RoomService: Send + Sync {
    async fn create_room(&self, spec: &RoomSpec) -> Result<Room>;

    async fn join_room(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<Room>;

    async fn leave_room(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<()>;

    async fn end_session(&self, room_id: &RoomId) -> Result<()>;
}
