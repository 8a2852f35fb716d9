use super::controller::AdaptiveQualityController;
use crate::peer::PeerOrchestrator;
use crate::types::ParticipantId;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use webrtc::stats::StatsReportType;

/// Link health, most severe last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

/// Classify a measurement into a tier. Evaluated most-severe-first so exactly
/// one tier matches for any input.
pub fn classify_tier(bandwidth_kbps: u32, latency_ms: u32, packet_loss_pct: f32) -> QualityTier {
    if packet_loss_pct > 15.0 || latency_ms > 800 || bandwidth_kbps < 100 {
        QualityTier::Critical
    } else if packet_loss_pct > 8.0 || latency_ms > 400 || bandwidth_kbps < 300 {
        QualityTier::Poor
    } else if packet_loss_pct > 3.0 || latency_ms > 200 || bandwidth_kbps < 800 {
        QualityTier::Fair
    } else if packet_loss_pct > 1.0 || latency_ms > 100 || bandwidth_kbps < 1500 {
        QualityTier::Good
    } else {
        QualityTier::Excellent
    }
}

/// Point-in-time link measurement. The tier is always derived from the other
/// fields, never set independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkCondition {
    pub bandwidth_kbps: u32,
    pub latency_ms: u32,
    pub packet_loss_pct: f32,
    pub jitter_ms: u32,
    pub tier: QualityTier,
    pub timestamp: DateTime<Utc>,
}

impl NetworkCondition {
    pub fn new(bandwidth_kbps: u32, latency_ms: u32, packet_loss_pct: f32, jitter_ms: u32) -> Self {
        Self {
            bandwidth_kbps,
            latency_ms,
            packet_loss_pct,
            jitter_ms,
            tier: classify_tier(bandwidth_kbps, latency_ms, packet_loss_pct),
            timestamp: Utc::now(),
        }
    }
}

/// Counters pulled out of one transport stats report.
#[derive(Debug, Clone, Copy, Default)]
struct RawSample {
    bytes_received: u64,
    /// Worst cumulative loss percentage across media streams.
    packet_loss_pct: f32,
    rtt_ms: Option<f64>,
}

/// Remote-inbound RTT is reported in seconds and only when the remote end
/// has measured one; zero means "no measurement yet".
fn round_trip_ms(rtt_secs: Option<f64>) -> Option<f64> {
    rtt_secs.filter(|rtt| *rtt > 0.0).map(|rtt| rtt * 1000.0)
}

fn reduce_report(report: &webrtc::stats::StatsReport) -> RawSample {
    let mut raw = RawSample::default();
    let mut fallback_rtt: Option<f64> = None;

    for stat in report.reports.values() {
        match stat {
            StatsReportType::InboundRTP(inbound) => {
                raw.bytes_received += inbound.bytes_received;
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                let lost = remote.packets_lost.max(0) as u64;
                let received = remote.packets_received;
                if lost + received > 0 {
                    let pct = lost as f32 / (lost + received) as f32 * 100.0;
                    raw.packet_loss_pct = raw.packet_loss_pct.max(pct);
                }
                if let Some(ms) = round_trip_ms(remote.round_trip_time) {
                    fallback_rtt = Some(ms);
                }
            }
            StatsReportType::CandidatePair(pair) => {
                if pair.nominated && pair.current_round_trip_time > 0.0 {
                    raw.rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                }
            }
            _ => continue,
        }
    }

    if raw.rtt_ms.is_none() {
        raw.rtt_ms = fallback_rtt;
    }
    raw
}

/// Per-participant sampling state: byte counters for bandwidth deltas and a
/// short RTT window for jitter.
#[derive(Debug, Default)]
struct SampleState {
    last_bytes_received: u64,
    last_sampled_at: Option<Instant>,
    rtt_window: VecDeque<f64>,
}

const RTT_WINDOW_LEN: usize = 6;

impl SampleState {
    /// Fold one raw sample in. Returns `None` for the first sample of a
    /// participant, which only primes the counters.
    fn observe(&mut self, raw: RawSample, now: Instant) -> Option<NetworkCondition> {
        let elapsed = self.last_sampled_at.map(|at| now.duration_since(at));
        let byte_delta = raw.bytes_received.saturating_sub(self.last_bytes_received);
        self.last_bytes_received = raw.bytes_received;
        self.last_sampled_at = Some(now);

        if let Some(rtt) = raw.rtt_ms {
            if self.rtt_window.len() == RTT_WINDOW_LEN {
                self.rtt_window.pop_front();
            }
            self.rtt_window.push_back(rtt);
        }

        let elapsed = elapsed?;
        if elapsed.as_secs_f64() <= 0.0 {
            return None;
        }

        let bandwidth_kbps = (byte_delta as f64 * 8.0 / 1000.0 / elapsed.as_secs_f64()) as u32;
        let latency_ms = raw.rtt_ms.unwrap_or(0.0).round() as u32;
        Some(NetworkCondition::new(
            bandwidth_kbps,
            latency_ms,
            raw.packet_loss_pct,
            self.jitter_ms(),
        ))
    }

    /// Jitter as the standard deviation of the recent RTT window.
    fn jitter_ms(&self) -> u32 {
        if self.rtt_window.len() < 2 {
            return 0;
        }
        let mean = self.rtt_window.iter().sum::<f64>() / self.rtt_window.len() as f64;
        let variance = self
            .rtt_window
            .iter()
            .map(|rtt| {
                let diff = rtt - mean;
                diff * diff
            })
            .sum::<f64>()
            / self.rtt_window.len() as f64;
        variance.sqrt().round() as u32
    }
}

/// Samples every active peer connection on a fixed interval, reduces the raw
/// transport statistics to a [`NetworkCondition`] and hands it to the
/// adaptive controller. Stopped via the session's shutdown signal; departed
/// participants are pruned on the next tick.
pub struct NetworkQualityMonitor {
    orchestrator: Arc<PeerOrchestrator>,
    controller: Arc<AdaptiveQualityController>,
    interval: Duration,
}

impl NetworkQualityMonitor {
    pub fn new(
        orchestrator: Arc<PeerOrchestrator>,
        controller: Arc<AdaptiveQualityController>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            controller,
            interval,
        }
    }

    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut states: HashMap<ParticipantId, SampleState> = HashMap::new();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("network quality monitor stopped");
                            return;
                        }
                    }
                }

                let connections = self.orchestrator.active_connections().await;
                states.retain(|id, _| connections.iter().any(|(active, _)| active == id));

                for (participant_id, connection) in connections {
                    let report = connection.get_stats().await;
                    let raw = reduce_report(&report);
                    let state = states.entry(participant_id.clone()).or_default();

                    let Some(condition) = state.observe(raw, Instant::now()) else {
                        continue;
                    };

                    metrics::gauge!(
                        "rtc_bandwidth_kbps",
                        condition.bandwidth_kbps as f64,
                        "participant" => participant_id.clone()
                    );
                    metrics::gauge!(
                        "rtc_latency_ms",
                        condition.latency_ms as f64,
                        "participant" => participant_id.clone()
                    );
                    metrics::gauge!(
                        "rtc_packet_loss_pct",
                        condition.packet_loss_pct as f64,
                        "participant" => participant_id.clone()
                    );

                    debug!(
                        "sampled {}: {}kbps {}ms rtt {:.1}% loss -> {:?}",
                        participant_id,
                        condition.bandwidth_kbps,
                        condition.latency_ms,
                        condition.packet_loss_pct,
                        condition.tier
                    );

                    if let Err(e) = self
                        .controller
                        .evaluate(&participant_id, condition)
                        .await
                    {
                        warn!("quality evaluation for {} failed: {}", participant_id, e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worsening_any_input_never_improves_the_tier() {
        // Descending bandwidth, ascending latency and loss: each step is a
        // strictly worse link along one dimension.
        let bandwidths = [5000, 1500, 1499, 800, 799, 300, 299, 100, 99, 0];
        let latencies = [0, 100, 101, 200, 201, 400, 401, 800, 801];
        let losses = [0.0f32, 1.0, 1.1, 3.0, 3.1, 8.0, 8.1, 15.0, 15.1, 40.0];

        for &lat in &latencies {
            for &loss in &losses {
                for pair in bandwidths.windows(2) {
                    assert!(
                        classify_tier(pair[1], lat, loss) >= classify_tier(pair[0], lat, loss),
                        "less bandwidth improved the tier at {}ms/{}%",
                        lat,
                        loss
                    );
                }
            }
        }
        for &bw in &bandwidths {
            for &loss in &losses {
                for pair in latencies.windows(2) {
                    assert!(
                        classify_tier(bw, pair[1], loss) >= classify_tier(bw, pair[0], loss),
                        "more latency improved the tier at {}kbps/{}%",
                        bw,
                        loss
                    );
                }
            }
        }
        for &bw in &bandwidths {
            for &lat in &latencies {
                for pair in losses.windows(2) {
                    assert!(
                        classify_tier(bw, lat, pair[1]) >= classify_tier(bw, lat, pair[0]),
                        "more loss improved the tier at {}kbps/{}ms",
                        bw,
                        lat
                    );
                }
            }
        }
    }

    #[test]
    fn tier_boundaries_match_the_table() {
        assert_eq!(classify_tier(2000, 50, 16.0), QualityTier::Critical);
        assert_eq!(classify_tier(2000, 801, 0.0), QualityTier::Critical);
        assert_eq!(classify_tier(99, 50, 0.0), QualityTier::Critical);
        assert_eq!(classify_tier(2000, 50, 9.0), QualityTier::Poor);
        assert_eq!(classify_tier(250, 50, 0.0), QualityTier::Poor);
        assert_eq!(classify_tier(2000, 120, 0.5), QualityTier::Good);
        assert_eq!(classify_tier(2000, 50, 6.0), QualityTier::Fair);
        assert_eq!(classify_tier(1600, 50, 0.0), QualityTier::Excellent);
        assert_eq!(classify_tier(1500, 100, 1.0), QualityTier::Excellent);
        assert_eq!(classify_tier(1499, 50, 0.0), QualityTier::Good);
    }

    #[test]
    fn severe_loss_dominates_otherwise_excellent_link() {
        // 6% loss on a fast low-latency link is still only fair.
        assert_eq!(classify_tier(5000, 20, 6.0), QualityTier::Fair);
    }

    #[test]
    fn remote_inbound_rtt_is_optional_and_in_seconds() {
        assert_eq!(round_trip_ms(None), None);
        assert_eq!(round_trip_ms(Some(0.0)), None);
        assert_eq!(round_trip_ms(Some(0.25)), Some(250.0));
    }

    #[test]
    fn first_sample_only_primes_counters() {
        let mut state = SampleState::default();
        let raw = RawSample {
            bytes_received: 1_000_000,
            packet_loss_pct: 0.0,
            rtt_ms: Some(40.0),
        };
        assert!(state.observe(raw, Instant::now()).is_none());
    }

    #[test]
    fn bandwidth_is_derived_from_byte_deltas() {
        let mut state = SampleState::default();
        let start = Instant::now();
        state.observe(
            RawSample {
                bytes_received: 0,
                packet_loss_pct: 0.0,
                rtt_ms: Some(40.0),
            },
            start,
        );

        // 625_000 bytes over 5s = 1000 kbps.
        let condition = state
            .observe(
                RawSample {
                    bytes_received: 625_000,
                    packet_loss_pct: 0.5,
                    rtt_ms: Some(40.0),
                },
                start + Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(condition.bandwidth_kbps, 1000);
        assert_eq!(condition.latency_ms, 40);
        assert_eq!(condition.tier, QualityTier::Good);
    }

    #[test]
    fn jitter_reflects_rtt_spread() {
        let mut state = SampleState::default();
        let start = Instant::now();
        let rtts = [20.0, 80.0, 20.0, 80.0];
        for (i, rtt) in rtts.iter().enumerate() {
            state.observe(
                RawSample {
                    bytes_received: (i as u64) * 100_000,
                    packet_loss_pct: 0.0,
                    rtt_ms: Some(*rtt),
                },
                start + Duration::from_secs(5 * i as u64),
            );
        }
        // stddev of [20, 80, 20, 80] is 30.
        assert_eq!(state.jitter_ms(), 30);
    }
}
