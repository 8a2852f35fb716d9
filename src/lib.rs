pub mod config;
pub mod events;
pub mod peer;
pub mod quality;
pub mod room;
pub mod session;
pub mod signaling;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::SessionConfig;
pub use events::SessionEvent;
pub use quality::{CallQualityMetrics, NetworkCondition, QualitySettings, QualityTier};
pub use room::{Participant, Room, RoomService, RoomSpec};
pub use session::RtcSession;
pub use types::{ParticipantRole, PeerState, SessionType};
pub use utils::{Error, Result};
