use crate::utils::Result;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// The local participant's outgoing tracks.
///
/// Screen share is a track replacement, not a separate connection: while it
/// is active, [`LocalMedia::video_track`] hands out the screen track and the
/// orchestrator swaps it onto every live sender.
pub struct LocalMedia {
    audio: Option<Arc<TrackLocalStaticSample>>,
    camera: Option<Arc<TrackLocalStaticSample>>,
    screen: Option<Arc<TrackLocalStaticSample>>,
    screen_active: bool,
}

impl LocalMedia {
    /// Build local publishing tracks. Failure here means the local side
    /// cannot publish, but receiving remote media still works.
    pub fn acquire(audio_enabled: bool, video_enabled: bool) -> Result<Self> {
        let audio = audio_enabled.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                "therapy-audio".to_string(),
            ))
        });
        let camera = video_enabled.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    ..Default::default()
                },
                "video".to_string(),
                "therapy-camera".to_string(),
            ))
        });
        Ok(Self {
            audio,
            camera,
            screen: None,
            screen_active: false,
        })
    }

    /// Receive-only fallback when local media acquisition failed.
    pub fn disabled() -> Self {
        Self {
            audio: None,
            camera: None,
            screen: None,
            screen_active: false,
        }
    }

    pub fn audio_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        self.audio
            .clone()
            .map(|t| t as Arc<dyn TrackLocal + Send + Sync>)
    }

    /// The track that should currently go out as "video": the screen while
    /// sharing, the camera otherwise.
    pub fn video_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        let track = if self.screen_active {
            self.screen.clone()
        } else {
            self.camera.clone()
        };
        track.map(|t| t as Arc<dyn TrackLocal + Send + Sync>)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_active
    }

    /// Switch outgoing video to a screen capture track. Returns the track to
    /// swap onto active senders.
    pub fn start_screen_share(&mut self) -> Arc<dyn TrackLocal + Send + Sync> {
        let track = match &self.screen {
            Some(track) => track.clone(),
            None => {
                let track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_string(),
                        ..Default::default()
                    },
                    "screen".to_string(),
                    "therapy-screen".to_string(),
                ));
                self.screen = Some(track.clone());
                track
            }
        };
        self.screen_active = true;
        track as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Swap back to the camera. Returns the camera track, or `None` when the
    /// local side publishes no camera video.
    pub fn stop_screen_share(&mut self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        self.screen_active = false;
        self.screen = None;
        self.camera
            .clone()
            .map(|t| t as Arc<dyn TrackLocal + Send + Sync>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_share_swaps_the_outgoing_video_track() {
        let mut media = LocalMedia::acquire(true, true).unwrap();
        let camera_id = media.video_track().unwrap().id().to_string();

        let screen = media.start_screen_share();
        assert!(media.is_screen_sharing());
        assert_eq!(media.video_track().unwrap().id(), screen.id());
        assert_ne!(screen.id(), camera_id);

        let back = media.stop_screen_share().unwrap();
        assert!(!media.is_screen_sharing());
        assert_eq!(back.id(), camera_id);
    }

    #[test]
    fn disabled_media_publishes_nothing() {
        let media = LocalMedia::disabled();
        assert!(media.audio_track().is_none());
        assert!(media.video_track().is_none());
    }

    #[test]
    fn audio_only_participant_has_no_video_track() {
        let media = LocalMedia::acquire(true, false).unwrap();
        assert!(media.audio_track().is_some());
        assert!(media.video_track().is_none());
    }
}
