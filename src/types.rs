use serde::{Deserialize, Serialize};

pub type RoomId = String;
pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Individual,
    Group,
    Family,
    Consultation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Therapist,
    Client,
    Guardian,
}

/// Negotiation state of a single remote participant's peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Absent,
    Negotiating,
    Connected,
    Degraded,
    Failed,
    Closed,
}

impl PeerState {
    /// A peer in a terminal state processes no further negotiation events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}
