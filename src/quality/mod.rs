pub mod controller;
pub mod monitor;
pub mod presets;

pub use controller::{AdaptationRecord, AdaptiveQualityController, CallQualityMetrics};
pub use monitor::{classify_tier, NetworkCondition, NetworkQualityMonitor, QualityTier};
pub use presets::{AudioSettings, QualityPreset, QualitySettings, VideoSettings, PRESET_LADDER};
