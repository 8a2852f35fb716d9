pub mod channel;
pub mod messages;

pub use channel::SignalingChannel;
pub use messages::{IceCandidatePayload, SignalingMessage};
