use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::MediaTransport;

const POOR_BITRATE: f64 = 500_000.0; // 500 kbps
const GOOD_BITRATE: f64 = 2_000_000.0; // 2 Mbps
const HIGH_PACKET_LOSS: f64 = 2.0;
const HIGH_RTT_MS: f64 = 150.0;

/// One entry of a transport statistics report.
#[derive(Debug, Clone, PartialEq)]
pub enum StatEntry {
    OutboundVideo {
        id: String,
        bytes_sent: u64,
        timestamp: Instant,
    },
    InboundVideo {
        id: String,
        packets_lost: i64,
    },
    CandidatePair {
        succeeded: bool,
        /// Seconds.
        current_round_trip_time: Option<f64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub entries: Vec<StatEntry>,
}

/// Byte counter of one outbound stat at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteSnapshot {
    pub bytes_sent: u64,
    pub timestamp: Instant,
}

/// Last byte counter per outbound stat id of one connection.
pub type StatsHistory = HashMap<String, ByteSnapshot>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Bits per second.
    pub bitrate: f64,
    pub packets_lost: f64,
    /// Milliseconds.
    pub round_trip_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityGrade {
    Poor,
    Medium,
    Good,
}

impl fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityGrade::Poor => write!(f, "poor"),
            QualityGrade::Medium => write!(f, "medium"),
            QualityGrade::Good => write!(f, "good"),
        }
    }
}

/// Sender-side video encoding limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodingProfile {
    /// Bits per second.
    pub max_bitrate: u64,
    pub scale_down_by: f64,
    pub max_framerate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerQuality {
    pub peer_id: String,
    pub grade: QualityGrade,
}

/// Reduces a stats report to metrics, updating `history` for every outbound video stat.
///
/// Bitrate stays 0 until a previous counter for the same stat exists.
pub fn extract_metrics(report: &StatsSnapshot, history: &mut StatsHistory) -> QualityMetrics {
    let mut metrics = QualityMetrics::default();
    let mut packets_lost = 0i64;
    let mut rtt_sum = 0.0;
    let mut rtt_count = 0u32;

    for entry in &report.entries {
        match entry {
            StatEntry::OutboundVideo {
                id,
                bytes_sent,
                timestamp,
            } => {
                if let Some(last) = history.get(id) {
                    let delta_bytes = bytes_sent.saturating_sub(last.bytes_sent) as f64;
                    let delta_secs = timestamp
                        .saturating_duration_since(last.timestamp)
                        .as_secs_f64();
                    if delta_secs > 0.0 {
                        metrics.bitrate = (delta_bytes * 8.0) / delta_secs;
                    }
                }
                history.insert(
                    id.clone(),
                    ByteSnapshot {
                        bytes_sent: *bytes_sent,
                        timestamp: *timestamp,
                    },
                );
            }
            StatEntry::InboundVideo {
                packets_lost: lost, ..
            } => packets_lost += lost,
            StatEntry::CandidatePair {
                succeeded: true,
                current_round_trip_time: Some(rtt),
            } => {
                rtt_sum += rtt * 1000.0;
                rtt_count += 1;
            }
            StatEntry::CandidatePair { .. } => {}
        }
    }

    metrics.packets_lost = packets_lost.max(0) as f64;
    metrics.round_trip_time = if rtt_count > 0 {
        rtt_sum / rtt_count as f64
    } else {
        0.0
    };
    metrics
}

pub async fn measure(
    transport: &dyn MediaTransport,
    history: &mut StatsHistory,
) -> Result<QualityMetrics> {
    let report = transport.stats().await?;
    Ok(extract_metrics(&report, history))
}

/// Averages three independent 0..=2 scores so no single metric decides the grade alone.
pub fn classify(metrics: &QualityMetrics) -> QualityGrade {
    let bitrate_score = if metrics.bitrate < POOR_BITRATE {
        0
    } else if metrics.bitrate > GOOD_BITRATE {
        2
    } else {
        1
    };

    let loss_score = if metrics.packets_lost > HIGH_PACKET_LOSS {
        0
    } else if metrics.packets_lost < HIGH_PACKET_LOSS / 2.0 {
        2
    } else {
        1
    };

    let rtt_score = if metrics.round_trip_time > HIGH_RTT_MS {
        0
    } else if metrics.round_trip_time < HIGH_RTT_MS / 2.0 {
        2
    } else {
        1
    };

    let total = (bitrate_score + loss_score + rtt_score) as f64 / 3.0;
    if total < 0.7 {
        QualityGrade::Poor
    } else if total > 1.3 {
        QualityGrade::Good
    } else {
        QualityGrade::Medium
    }
}

pub fn profile_for(grade: QualityGrade) -> EncodingProfile {
    match grade {
        QualityGrade::Poor => EncodingProfile {
            max_bitrate: 150_000,
            scale_down_by: 4.0,
            max_framerate: 15.0,
        },
        QualityGrade::Medium => EncodingProfile {
            max_bitrate: 500_000,
            scale_down_by: 2.0,
            max_framerate: 24.0,
        },
        QualityGrade::Good => EncodingProfile {
            max_bitrate: 2_500_000,
            scale_down_by: 1.0,
            max_framerate: 30.0,
        },
    }
}

/// Adaptive bitrate state: byte-counter history per peer and the latest grades.
pub struct QualityMonitor {
    history: HashMap<String, StatsHistory>,
    grades: watch::Sender<Vec<PeerQuality>>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        let (grades, _) = watch::channel(Vec::new());
        Self {
            history: HashMap::new(),
            grades,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerQuality>> {
        self.grades.subscribe()
    }

    /// One optimization pass over `sessions`; a failing peer is logged and skipped.
    pub async fn optimize(
        &mut self,
        sessions: Vec<(String, Arc<dyn MediaTransport>)>,
    ) -> Vec<PeerQuality> {
        self.history
            .retain(|peer_id, _| sessions.iter().any(|(id, _)| id == peer_id));

        let mut results = Vec::with_capacity(sessions.len());
        for (peer_id, transport) in sessions {
            if !transport.has_video_sender().await {
                continue;
            }
            let history = self.history.entry(peer_id.clone()).or_default();
            match Self::optimize_peer(transport.as_ref(), history).await {
                Ok(grade) => {
                    debug!(peer_id = %peer_id, %grade, "Applied quality settings");
                    results.push(PeerQuality { peer_id, grade });
                }
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Error optimizing video quality"),
            }
        }

        self.grades.send_replace(results.clone());
        results
    }

    async fn optimize_peer(
        transport: &dyn MediaTransport,
        history: &mut StatsHistory,
    ) -> Result<QualityGrade> {
        let metrics = measure(transport, history).await?;
        let grade = classify(&metrics);
        transport.apply_encoding(profile_for(grade)).await?;
        Ok(grade)
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn metrics(bitrate: f64, packets_lost: f64, round_trip_time: f64) -> QualityMetrics {
        QualityMetrics {
            bitrate,
            packets_lost,
            round_trip_time,
        }
    }

    #[test]
    fn grades_extremes() {
        assert_eq!(classify(&metrics(3_000_000.0, 0.0, 20.0)), QualityGrade::Good);
        assert_eq!(classify(&metrics(100_000.0, 10.0, 400.0)), QualityGrade::Poor);
        assert_eq!(classify(&metrics(1_000_000.0, 1.5, 100.0)), QualityGrade::Medium);
    }

    #[test]
    fn single_bad_metric_is_smoothed() {
        // 0 + 2 + 2 averages to 1.33
        assert_eq!(classify(&metrics(0.0, 0.0, 10.0)), QualityGrade::Good);
        // 0 + 1 + 2 averages to 1.0
        assert_eq!(classify(&metrics(0.0, 1.0, 10.0)), QualityGrade::Medium);
    }

    #[test]
    fn bitrate_is_monotonic() {
        let bitrates = [0.0, 499_999.0, 500_000.0, 1_500_000.0, 2_000_000.0, 2_000_001.0, 9e9];
        for (loss, rtt) in [(0.0, 10.0), (1.5, 100.0), (5.0, 300.0), (0.0, 300.0), (5.0, 10.0)] {
            let grades: Vec<_> = bitrates
                .iter()
                .map(|&b| classify(&metrics(b, loss, rtt)))
                .collect();
            assert!(grades.windows(2).all(|w| w[0] <= w[1]), "{:?}", grades);
        }
    }

    #[test]
    fn fixed_profiles() {
        let poor = profile_for(QualityGrade::Poor);
        assert_eq!((poor.max_bitrate, poor.scale_down_by, poor.max_framerate), (150_000, 4.0, 15.0));
        let medium = profile_for(QualityGrade::Medium);
        assert_eq!((medium.max_bitrate, medium.scale_down_by, medium.max_framerate), (500_000, 2.0, 24.0));
        let good = profile_for(QualityGrade::Good);
        assert_eq!((good.max_bitrate, good.scale_down_by, good.max_framerate), (2_500_000, 1.0, 30.0));
    }

    #[test]
    fn bitrate_needs_previous_counter() {
        let start = Instant::now();
        let mut history = StatsHistory::new();
        let first = StatsSnapshot {
            entries: vec![StatEntry::OutboundVideo {
                id: "out-1".into(),
                bytes_sent: 1_000,
                timestamp: start,
            }],
        };
        assert_eq!(extract_metrics(&first, &mut history).bitrate, 0.0);
        assert_eq!(history["out-1"].bytes_sent, 1_000);

        let second = StatsSnapshot {
            entries: vec![StatEntry::OutboundVideo {
                id: "out-1".into(),
                bytes_sent: 251_000,
                timestamp: start + Duration::from_secs(2),
            }],
        };
        // 250_000 bytes over 2 seconds
        assert_eq!(extract_metrics(&second, &mut history).bitrate, 1_000_000.0);
    }

    #[test]
    fn rtt_averages_succeeded_pairs() {
        let report = StatsSnapshot {
            entries: vec![
                StatEntry::CandidatePair {
                    succeeded: true,
                    current_round_trip_time: Some(0.05),
                },
                StatEntry::CandidatePair {
                    succeeded: true,
                    current_round_trip_time: Some(0.15),
                },
                StatEntry::CandidatePair {
                    succeeded: false,
                    current_round_trip_time: Some(5.0),
                },
                StatEntry::InboundVideo {
                    id: "in-1".into(),
                    packets_lost: 3,
                },
            ],
        };
        let m = extract_metrics(&report, &mut StatsHistory::new());
        assert!((m.round_trip_time - 100.0).abs() < 1e-9);
        assert_eq!(m.packets_lost, 3.0);
    }

    #[test]
    fn no_pairs_means_zero_rtt() {
        let m = extract_metrics(&StatsSnapshot::default(), &mut StatsHistory::new());
        assert_eq!(m, QualityMetrics::default());
    }
}
