use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
}

impl VideoSettings {
    /// All-zero sentinel meaning "video disabled".
    pub const OFF: VideoSettings = VideoSettings {
        width: 0,
        height: 0,
        frame_rate: 0,
        bitrate_kbps: 0,
    };

    pub fn is_off(&self) -> bool {
        *self == VideoSettings::OFF
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub bitrate_kbps: u32,
    pub sample_rate_hz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySettings {
    pub video: VideoSettings,
    pub audio: AudioSettings,
}

/// One rung of the quality ladder, ordered from highest resource use to
/// lowest. `min_bandwidth_kbps` is the floor below which the rung is not
/// considered viable.
#[derive(Debug, Clone, Copy)]
pub struct QualityPreset {
    pub name: &'static str,
    pub min_bandwidth_kbps: u32,
    pub settings: QualitySettings,
}

pub const PRESET_LADDER: [QualityPreset; 5] = [
    QualityPreset {
        name: "ultra",
        min_bandwidth_kbps: 3500,
        settings: QualitySettings {
            video: VideoSettings {
                width: 1920,
                height: 1080,
                frame_rate: 30,
                bitrate_kbps: 4000,
            },
            audio: AudioSettings {
                bitrate_kbps: 128,
                sample_rate_hz: 48_000,
            },
        },
    },
    QualityPreset {
        name: "high",
        min_bandwidth_kbps: 2000,
        settings: QualitySettings {
            video: VideoSettings {
                width: 1280,
                height: 720,
                frame_rate: 30,
                bitrate_kbps: 2500,
            },
            audio: AudioSettings {
                bitrate_kbps: 96,
                sample_rate_hz: 48_000,
            },
        },
    },
    QualityPreset {
        name: "medium",
        min_bandwidth_kbps: 1200,
        settings: QualitySettings {
            video: VideoSettings {
                width: 960,
                height: 540,
                frame_rate: 25,
                bitrate_kbps: 1200,
            },
            audio: AudioSettings {
                bitrate_kbps: 64,
                sample_rate_hz: 48_000,
            },
        },
    },
    QualityPreset {
        name: "low",
        min_bandwidth_kbps: 500,
        settings: QualitySettings {
            video: VideoSettings {
                width: 640,
                height: 360,
                frame_rate: 20,
                bitrate_kbps: 500,
            },
            audio: AudioSettings {
                bitrate_kbps: 48,
                sample_rate_hz: 48_000,
            },
        },
    },
    // Audio only, the rung of last resort. Always viable.
    QualityPreset {
        name: "minimal",
        min_bandwidth_kbps: 0,
        settings: QualitySettings {
            video: VideoSettings::OFF,
            audio: AudioSettings {
                bitrate_kbps: 32,
                sample_rate_hz: 16_000,
            },
        },
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_ordered_highest_to_lowest() {
        for pair in PRESET_LADDER.windows(2) {
            assert!(pair[0].min_bandwidth_kbps > pair[1].min_bandwidth_kbps);
            assert!(pair[0].settings.video.bitrate_kbps >= pair[1].settings.video.bitrate_kbps);
            assert!(pair[0].settings.audio.bitrate_kbps >= pair[1].settings.audio.bitrate_kbps);
        }
    }

    #[test]
    fn last_rung_is_audio_only_and_always_viable() {
        let minimal = PRESET_LADDER[PRESET_LADDER.len() - 1];
        assert_eq!(minimal.min_bandwidth_kbps, 0);
        assert!(minimal.settings.video.is_off());
        assert!(minimal.settings.audio.bitrate_kbps >= 32);
    }
}
