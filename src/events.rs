use crate::quality::QualitySettings;
use crate::room::Room;
use crate::room::Participant;
use crate::types::{ParticipantId, PeerState};
use log::debug;
use tokio::sync::broadcast;

/// Everything the surrounding application can observe about a session.
///
/// A closed enum with concrete payloads instead of string-keyed emitter
/// events; subscribers match exhaustively.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ParticipantJoined(Participant),
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    ConnectionStateChanged {
        participant_id: ParticipantId,
        state: PeerState,
    },
    QualityAdapted {
        participant_id: ParticipantId,
        reason: String,
        from: QualitySettings,
        to: QualitySettings,
    },
    QualityAdaptationFailed {
        participant_id: ParticipantId,
        detail: String,
    },
    ScreenShareStarted {
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        participant_id: ParticipantId,
    },
    RoomUpdated(Room),
    ChannelUp,
    ChannelDown,
}

/// Broadcast fan-out of [`SessionEvent`]s. Slow subscribers lose the oldest
/// events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // Send only fails when nobody is subscribed, which is fine.
        if self.sender.send(event).is_err() {
            debug!("session event published with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
