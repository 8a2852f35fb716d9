pub mod media;
pub mod orchestrator;
mod worker;

pub use media::LocalMedia;
pub use orchestrator::{is_offer_initiator, PeerOrchestrator};
