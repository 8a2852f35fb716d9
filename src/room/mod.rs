pub mod registry;
pub mod service;
pub mod state;

pub use registry::RoomRegistry;
pub use service::RoomService;
pub use state::{Participant, Room, RoomSpec};
