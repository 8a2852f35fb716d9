use crate::room::{Participant, Room};
use crate::types::{ParticipantId, RoomId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Wire form of an ICE candidate descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidatePayload> for RTCIceCandidateInit {
    fn from(payload: IceCandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

/// Everything that crosses the signaling channel, in both directions.
///
/// Timestamps are informative only; ordering guarantees come from the
/// channel itself, never from comparing timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    JoinRoom {
        request_id: Uuid,
        room_id: RoomId,
        user_id: ParticipantId,
        participant: Participant,
        timestamp: DateTime<Utc>,
    },
    LeaveRoom {
        request_id: Uuid,
        room_id: RoomId,
        user_id: ParticipantId,
        timestamp: DateTime<Utc>,
    },
    Offer {
        room_id: RoomId,
        user_id: ParticipantId,
        to_user: ParticipantId,
        sdp: String,
        timestamp: DateTime<Utc>,
    },
    Answer {
        room_id: RoomId,
        user_id: ParticipantId,
        to_user: ParticipantId,
        sdp: String,
        timestamp: DateTime<Utc>,
    },
    IceCandidate {
        room_id: RoomId,
        user_id: ParticipantId,
        to_user: ParticipantId,
        candidate: IceCandidatePayload,
        timestamp: DateTime<Utc>,
    },
    UserJoined {
        room_id: RoomId,
        participant: Participant,
        timestamp: DateTime<Utc>,
    },
    UserLeft {
        room_id: RoomId,
        user_id: ParticipantId,
        timestamp: DateTime<Utc>,
    },
    RoomUpdated {
        room_id: RoomId,
        room: Room,
        timestamp: DateTime<Utc>,
    },
    /// Server acknowledgement of a round-trip request.
    Ack {
        request_id: Uuid,
        room: Option<Room>,
        #[serde(default)]
        participants: Vec<Participant>,
        timestamp: DateTime<Utc>,
    },
    /// Server rejection of a round-trip request.
    Error {
        request_id: Option<Uuid>,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl SignalingMessage {
    /// Request id carried by messages that expect a server acknowledgement.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            SignalingMessage::JoinRoom { request_id, .. }
            | SignalingMessage::LeaveRoom { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Request id for messages that complete a pending round trip.
    pub fn completes_request(&self) -> Option<Uuid> {
        match self {
            SignalingMessage::Ack { request_id, .. } => Some(*request_id),
            SignalingMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParticipantRole;

    #[test]
    fn wire_tags_are_kebab_case() {
        let msg = SignalingMessage::UserLeft {
            room_id: "r1".to_string(),
            user_id: "p1".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"user-left\""));
        assert!(json.contains("\"roomId\":\"r1\""));
        assert!(json.contains("\"userId\":\"p1\""));
    }

    #[test]
    fn offer_round_trips_through_json() {
        let msg = SignalingMessage::Offer {
            room_id: "r1".to_string(),
            user_id: "a".to_string(),
            to_user: "b".to_string(),
            sdp: "v=0\r\n".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        match serde_json::from_str::<SignalingMessage>(&json).unwrap() {
            SignalingMessage::Offer { sdp, to_user, .. } => {
                assert_eq!(sdp, "v=0\r\n");
                assert_eq!(to_user, "b");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn parses_server_pushed_user_joined() {
        let json = format!(
            "{{\"type\":\"user-joined\",\"roomId\":\"r1\",\"participant\":{},\"timestamp\":\"2026-01-05T10:00:00Z\"}}",
            serde_json::to_string(&Participant::new(
                "p2".to_string(),
                "Dr. Reyes".to_string(),
                ParticipantRole::Therapist,
            ))
            .unwrap()
        );
        match serde_json::from_str::<SignalingMessage>(&json).unwrap() {
            SignalingMessage::UserJoined { participant, .. } => {
                assert_eq!(participant.id, "p2");
                assert_eq!(participant.role, ParticipantRole::Therapist);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn error_without_request_id_completes_nothing() {
        let msg = SignalingMessage::Error {
            request_id: None,
            message: "boom".to_string(),
            timestamp: Utc::now(),
        };
        assert!(msg.completes_request().is_none());
    }
}
