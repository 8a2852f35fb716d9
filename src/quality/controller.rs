use super::monitor::{NetworkCondition, QualityTier};
use super::presets::{QualityPreset, QualitySettings, PRESET_LADDER};
use crate::events::{EventBus, SessionEvent};
use crate::peer::PeerOrchestrator;
use crate::types::ParticipantId;
use crate::utils::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

const HISTORY_CAP: usize = 20;
/// Fraction of measured bandwidth a preset may claim.
const BANDWIDTH_SAFETY_MARGIN: f64 = 0.8;
/// Minimum deltas below which a recommendation is considered noise.
const MIN_VIDEO_DELTA_KBPS: u32 = 100;
const MIN_AUDIO_DELTA_KBPS: u32 = 16;
/// Headroom required before adapting upward on a healthy link.
const UPGRADE_HEADROOM: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct AdaptationRecord {
    pub reason: String,
    pub from: QualitySettings,
    pub to: QualitySettings,
    pub timestamp: DateTime<Utc>,
}

/// Per-participant aggregate the controller owns exclusively.
#[derive(Debug, Clone)]
pub struct CallQualityMetrics {
    pub latest_condition: Option<NetworkCondition>,
    pub current_settings: QualitySettings,
    pub recommended_settings: QualitySettings,
    pub history: VecDeque<AdaptationRecord>,
    in_flight: bool,
}

impl CallQualityMetrics {
    fn new(initial: QualitySettings) -> Self {
        Self {
            latest_condition: None,
            current_settings: initial,
            recommended_settings: initial,
            history: VecDeque::new(),
            in_flight: false,
        }
    }

    pub fn is_adapting(&self) -> bool {
        self.in_flight
    }
}

/// Base rung for a tier before the bandwidth margin is applied.
fn base_preset_index(tier: QualityTier) -> usize {
    match tier {
        QualityTier::Excellent => 0,
        QualityTier::Good => 1,
        QualityTier::Fair => 2,
        QualityTier::Poor => 3,
        QualityTier::Critical => 4,
    }
}

/// Pick the highest rung at or below the tier's base that fits within the
/// 20% bandwidth safety margin. The bottom rung has no floor, so this always
/// terminates with a viable preset.
pub fn select_preset(tier: QualityTier, bandwidth_kbps: u32) -> &'static QualityPreset {
    let budget = bandwidth_kbps as f64 * BANDWIDTH_SAFETY_MARGIN;
    let mut index = base_preset_index(tier);
    while PRESET_LADDER[index].min_bandwidth_kbps as f64 > budget {
        index += 1;
    }
    &PRESET_LADDER[index]
}

/// Map a measurement to concrete settings: preset by tier and bandwidth,
/// then fine-tuned on loss, latency and jitter.
pub fn recommend_settings(condition: &NetworkCondition) -> (QualitySettings, String) {
    let preset = select_preset(condition.tier, condition.bandwidth_kbps);
    let mut settings = preset.settings;
    let mut reason = format!("{:?} link, preset {}", condition.tier, preset.name);

    if !settings.video.is_off() {
        if condition.packet_loss_pct > 5.0 {
            settings.video.frame_rate =
                ((settings.video.frame_rate as f64 * 0.7) as u32).max(15);
            settings.video.bitrate_kbps =
                ((settings.video.bitrate_kbps as f64 * 0.7) as u32).max(200);
            reason.push_str(", reduced for packet loss");
        }
        if condition.latency_ms > 200 {
            settings.video.frame_rate =
                ((settings.video.frame_rate as f64 * 0.8) as u32).max(15);
            reason.push_str(", reduced frame rate for latency");
        }
    }
    if condition.jitter_ms > 50 {
        settings.audio.bitrate_kbps =
            ((settings.audio.bitrate_kbps as f64 * 0.8) as u32).max(32);
        reason.push_str(", reduced audio for jitter");
    }

    (settings, reason)
}

/// Hysteresis: ignore noise-level deltas, always follow a degraded link down,
/// and only climb back up on clear headroom.
pub fn should_adapt(
    current: &QualitySettings,
    recommended: &QualitySettings,
    tier: QualityTier,
) -> bool {
    let video_delta = current
        .video
        .bitrate_kbps
        .abs_diff(recommended.video.bitrate_kbps);
    let audio_delta = current
        .audio
        .bitrate_kbps
        .abs_diff(recommended.audio.bitrate_kbps);
    if video_delta < MIN_VIDEO_DELTA_KBPS && audio_delta < MIN_AUDIO_DELTA_KBPS {
        return false;
    }

    match tier {
        QualityTier::Poor | QualityTier::Critical => true,
        QualityTier::Good | QualityTier::Excellent => {
            recommended.video.bitrate_kbps as f64
                >= current.video.bitrate_kbps as f64 * UPGRADE_HEADROOM
        }
        QualityTier::Fair => false,
    }
}

/// Turns [`NetworkCondition`]s into quality setting changes, one participant
/// at a time. At most one adaptation is in flight per participant; a second
/// request while one is pending is dropped, not queued.
pub struct AdaptiveQualityController {
    orchestrator: Arc<PeerOrchestrator>,
    events: EventBus,
    participants: Mutex<HashMap<ParticipantId, Arc<Mutex<CallQualityMetrics>>>>,
    initial_settings: QualitySettings,
}

impl AdaptiveQualityController {
    pub fn new(orchestrator: Arc<PeerOrchestrator>, events: EventBus) -> Self {
        Self {
            orchestrator,
            events,
            participants: Mutex::new(HashMap::new()),
            // Sessions start on the high rung and adapt from there.
            initial_settings: PRESET_LADDER[1].settings,
        }
    }

    fn record_for(&self, participant_id: &str) -> Arc<Mutex<CallQualityMetrics>> {
        self.participants
            .lock()
            .entry(participant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CallQualityMetrics::new(self.initial_settings))))
            .clone()
    }

    pub fn metrics_for(&self, participant_id: &str) -> Option<CallQualityMetrics> {
        self.participants
            .lock()
            .get(participant_id)
            .map(|record| record.lock().clone())
    }

    pub fn remove_participant(&self, participant_id: &str) {
        self.participants.lock().remove(participant_id);
    }

    /// Evaluate one fresh measurement and, when warranted, apply a settings
    /// change through the orchestrator. Failures are isolated per
    /// participant and surfaced as events.
    pub async fn evaluate(
        self: &Arc<Self>,
        participant_id: &ParticipantId,
        condition: NetworkCondition,
    ) -> Result<()> {
        let record = self.record_for(participant_id);
        let (from, recommended, reason) = {
            let mut metrics = record.lock();
            metrics.latest_condition = Some(condition);
            let (recommended, reason) = recommend_settings(&condition);
            metrics.recommended_settings = recommended;

            if !should_adapt(&metrics.current_settings, &recommended, condition.tier) {
                return Ok(());
            }
            if metrics.in_flight {
                debug!(
                    "adaptation already in flight for {}, dropping request",
                    participant_id
                );
                return Ok(());
            }
            metrics.in_flight = true;
            (metrics.current_settings, recommended, reason)
        };

        let controller = self.clone();
        let participant_id = participant_id.clone();
        tokio::spawn(async move {
            let result = controller
                .orchestrator
                .apply_settings(&participant_id, recommended)
                .await;

            let mut metrics = record.lock();
            metrics.in_flight = false;
            match result {
                Ok(()) => {
                    metrics.current_settings = recommended;
                    if metrics.history.len() == HISTORY_CAP {
                        metrics.history.pop_front();
                    }
                    metrics.history.push_back(AdaptationRecord {
                        reason: reason.clone(),
                        from,
                        to: recommended,
                        timestamp: Utc::now(),
                    });
                    drop(metrics);
                    info!(
                        "adapted quality for {}: {}kbps video -> {}kbps ({})",
                        participant_id, from.video.bitrate_kbps, recommended.video.bitrate_kbps, reason
                    );
                    metrics::counter!(
                        "rtc_quality_adaptations",
                        1,
                        "participant" => participant_id.clone()
                    );
                    controller.events.publish(SessionEvent::QualityAdapted {
                        participant_id,
                        reason,
                        from,
                        to: recommended,
                    });
                }
                Err(e) => {
                    drop(metrics);
                    warn!("quality adaptation for {} failed: {}", participant_id, e);
                    controller
                        .events
                        .publish(SessionEvent::QualityAdaptationFailed {
                            participant_id,
                            detail: e.to_string(),
                        });
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(bandwidth: u32, latency: u32, loss: f32, jitter: u32) -> NetworkCondition {
        NetworkCondition::new(bandwidth, latency, loss, jitter)
    }

    #[test]
    fn poor_link_steps_past_unaffordable_low_preset() {
        // 250kbps, tier poor: base rung "low" needs 500 but only 200 is
        // budgeted, so the ladder walks down to audio-only.
        let c = condition(250, 50, 0.0, 0);
        assert_eq!(c.tier, QualityTier::Poor);
        let (settings, reason) = recommend_settings(&c);
        assert!(settings.video.is_off());
        assert!(reason.contains("minimal"));
    }

    #[test]
    fn good_link_without_headroom_steps_down_from_high() {
        // 2000kbps at 120ms: tier good, but high needs 2000 > 1600 budget.
        let c = condition(2000, 120, 0.5, 0);
        assert_eq!(c.tier, QualityTier::Good);
        let preset = select_preset(c.tier, c.bandwidth_kbps);
        assert_eq!(preset.name, "medium");
    }

    #[test]
    fn packet_loss_fine_tunes_an_otherwise_clean_link() {
        // 6% loss: tier fair, then the loss rule trims rate and fps by 30%.
        let c = condition(5000, 20, 6.0, 0);
        assert_eq!(c.tier, QualityTier::Fair);
        let (settings, _) = recommend_settings(&c);
        let medium = PRESET_LADDER[2].settings;
        assert_eq!(
            settings.video.bitrate_kbps,
            (medium.video.bitrate_kbps as f64 * 0.7) as u32
        );
        assert_eq!(
            settings.video.frame_rate,
            ((medium.video.frame_rate as f64 * 0.7) as u32).max(15)
        );
    }

    #[test]
    fn fine_tune_floors_hold() {
        let c = condition(900, 300, 12.0, 80);
        let (settings, _) = recommend_settings(&c);
        if !settings.video.is_off() {
            assert!(settings.video.frame_rate >= 15);
            assert!(settings.video.bitrate_kbps >= 200);
        }
        assert!(settings.audio.bitrate_kbps >= 32);
    }

    #[test]
    fn selected_presets_respect_the_bandwidth_margin() {
        for bandwidth in (0..6000).step_by(50) {
            let c = condition(bandwidth, 50, 0.0, 0);
            let preset = select_preset(c.tier, bandwidth);
            assert!(
                preset.min_bandwidth_kbps as f64 <= bandwidth as f64 * 0.8
                    || preset.min_bandwidth_kbps == 0,
                "preset {} chosen at {}kbps",
                preset.name,
                bandwidth
            );
        }
    }

    #[test]
    fn noise_level_deltas_do_not_adapt() {
        let current = PRESET_LADDER[2].settings;
        let mut recommended = current;
        recommended.video.bitrate_kbps += 40;
        assert!(!should_adapt(&current, &recommended, QualityTier::Good));
    }

    #[test]
    fn degraded_tiers_always_adapt_down() {
        let current = PRESET_LADDER[1].settings;
        let recommended = PRESET_LADDER[4].settings;
        assert!(should_adapt(&current, &recommended, QualityTier::Critical));
        assert!(should_adapt(&current, &recommended, QualityTier::Poor));
    }

    #[test]
    fn healthy_tiers_only_adapt_up_with_headroom() {
        let medium = PRESET_LADDER[2].settings;
        let high = PRESET_LADDER[1].settings;
        let ultra = PRESET_LADDER[0].settings;

        // 1200 * 1.5 = 1800 <= 2500: enough headroom.
        assert!(should_adapt(&medium, &high, QualityTier::Excellent));
        // 2500 * 1.5 = 3750 <= 4000: enough headroom.
        assert!(should_adapt(&high, &ultra, QualityTier::Excellent));
        // A good link never steps down.
        assert!(!should_adapt(&high, &medium, QualityTier::Good));
    }

    #[test]
    fn fair_tier_never_adapts() {
        let current = PRESET_LADDER[1].settings;
        let recommended = PRESET_LADDER[3].settings;
        assert!(!should_adapt(&current, &recommended, QualityTier::Fair));
    }

    #[test]
    fn video_recovery_from_audio_only_counts_as_upgrade() {
        let current = PRESET_LADDER[4].settings;
        let recommended = PRESET_LADDER[2].settings;
        assert!(current.video.is_off());
        assert!(should_adapt(&current, &recommended, QualityTier::Good));
    }
}
