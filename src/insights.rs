//! Insights engine (§4.11, C12).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Direction, InsightsPreset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    CrowdedConsensus,
    FragileConsensus,
    HighLeverage,
    ExtremeLeverage,
    UnstableDirection,
    DirectionFlipCluster,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub anomaly_type: AnomalyType,
    pub symbol: String,
    pub severity: AnomalySeverity,
}

/// Input row: one symbol's current consensus/leverage/flip snapshot.
#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub total_traders: usize,
    pub confidence_score: f64,
    pub sentiment_score: f64,
    pub avg_leverage: f64,
    pub flip_count: u32,
}

/// Detects anomalies for one symbol snapshot against a preset. Duplicate
/// `(type, symbol)` pairs can't occur here since a snapshot is per symbol
/// — callers that merge multiple sources must keep the higher severity
/// (§4.11).
pub fn detect_anomalies(snapshot: &SymbolSnapshot, preset: &InsightsPreset) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    let sentiment_pct = snapshot.sentiment_score.abs() * 100.0;

    if snapshot.total_traders >= preset.crowded_min_traders
        && snapshot.confidence_score >= preset.crowded_min_confidence
        && sentiment_pct >= preset.crowded_min_sentiment_abs
    {
        anomalies.push(Anomaly {
            anomaly_type: AnomalyType::CrowdedConsensus,
            symbol: snapshot.symbol.clone(),
            severity: AnomalySeverity::High,
        });
    }

    if snapshot.total_traders >= preset.crowded_min_traders
        && snapshot.confidence_score < preset.low_confidence_limit
    {
        anomalies.push(Anomaly {
            anomaly_type: AnomalyType::FragileConsensus,
            symbol: snapshot.symbol.clone(),
            severity: AnomalySeverity::Medium,
        });
    }

    if snapshot.avg_leverage >= preset.extreme_leverage_threshold {
        anomalies.push(Anomaly {
            anomaly_type: AnomalyType::ExtremeLeverage,
            symbol: snapshot.symbol.clone(),
            severity: AnomalySeverity::High,
        });
    } else if snapshot.avg_leverage >= preset.high_leverage_threshold {
        anomalies.push(Anomaly {
            anomaly_type: AnomalyType::HighLeverage,
            symbol: snapshot.symbol.clone(),
            severity: AnomalySeverity::Medium,
        });
    }

    if snapshot.flip_count >= preset.cluster_flip_threshold {
        anomalies.push(Anomaly {
            anomaly_type: AnomalyType::DirectionFlipCluster,
            symbol: snapshot.symbol.clone(),
            severity: AnomalySeverity::High,
        });
    } else if snapshot.flip_count >= preset.unstable_flip_threshold {
        anomalies.push(Anomaly {
            anomaly_type: AnomalyType::UnstableDirection,
            symbol: snapshot.symbol.clone(),
            severity: AnomalySeverity::Medium,
        });
    }

    anomalies
}

/// Merges anomalies across symbols, keeping the higher severity for any
/// duplicate `(type, symbol)` pair.
pub fn merge_anomalies(all: Vec<Anomaly>) -> Vec<Anomaly> {
    let mut by_key: HashMap<(AnomalyType, String), Anomaly> = HashMap::new();
    for anomaly in all {
        let key = (anomaly.anomaly_type, anomaly.symbol.clone());
        by_key
            .entry(key)
            .and_modify(|existing| {
                if severity_rank(anomaly.severity) > severity_rank(existing.severity) {
                    *existing = anomaly.clone();
                }
            })
            .or_insert(anomaly);
    }
    by_key.into_values().collect()
}

fn severity_rank(severity: AnomalySeverity) -> u8 {
    match severity {
        AnomalySeverity::Medium => 1,
        AnomalySeverity::High => 2,
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stability {
    pub flips: u32,
    pub flip_rate: f64,
    pub stability_score: f64,
}

/// Replays a symbol's direction updates (non-neutral only) and counts
/// flips — a change from the previous non-neutral direction (§4.11).
pub fn compute_stability(directions_in_order: &[Direction]) -> Stability {
    let mut flips = 0u32;
    for window in directions_in_order.windows(2) {
        if window[0] != window[1] {
            flips += 1;
        }
    }
    let updates = directions_in_order.len();
    let flip_rate = flips as f64 / (updates.saturating_sub(1)).max(1) as f64;
    let stability_score = (0.0f64).max(((1.0 - flip_rate.min(1.0) * 1.5).max(0.0) * 100.0).round());
    Stability {
        flips,
        flip_rate,
        stability_score,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RiskOverview {
    pub risk_score: f64,
    pub level: RiskLevel,
}

/// `min(100, (crowded*18 + high_lev*16 + unstable*14 + low_confidence*10
/// + high_anomalies*6) * score_multiplier)`.
pub fn compute_risk_overview(
    crowded: u32,
    high_leverage: u32,
    unstable: u32,
    low_confidence: u32,
    high_anomalies: u32,
    score_multiplier: f64,
) -> RiskOverview {
    let raw = (crowded as f64 * 18.0
        + high_leverage as f64 * 16.0
        + unstable as f64 * 14.0
        + low_confidence as f64 * 10.0
        + high_anomalies as f64 * 6.0)
        * score_multiplier;
    let risk_score = raw.min(100.0);
    let level = if risk_score >= 70.0 {
        RiskLevel::High
    } else if risk_score >= 40.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    RiskOverview { risk_score, level }
}

/// Per-trader leaderboard input (§4.11).
pub struct LeaderboardInput {
    pub trader_id: String,
    pub trader_weight: f64,
    pub quality_norm: f64,
    pub win_rate_norm: f64,
    pub activity_norm: f64,
    pub avg_leverage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub trader_id: String,
    pub score: f64,
}

fn leverage_penalty(avg_leverage: f64) -> f64 {
    if avg_leverage >= 75.0 {
        0.15
    } else if avg_leverage >= 45.0 {
        0.08
    } else if avg_leverage >= 25.0 {
        0.04
    } else {
        0.0
    }
}

/// Builds the leaderboard, sorted desc, capped at `top` (clamped to
/// `[3, 50]` per §4.11).
pub fn build_leaderboard(inputs: &[LeaderboardInput], top: usize) -> Vec<LeaderboardEntry> {
    let top = top.clamp(3, 50);
    let mut entries: Vec<LeaderboardEntry> = inputs
        .iter()
        .map(|input| {
            let base = 100.0
                * (0.45 * input.trader_weight
                    + 0.30 * input.quality_norm
                    + 0.15 * input.win_rate_norm
                    + 0.10 * input.activity_norm);
            let score = base * (1.0 - leverage_penalty(input.avg_leverage));
            LeaderboardEntry {
                trader_id: input.trader_id.clone(),
                score,
            }
        })
        .collect();
    entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    entries.truncate(top);
    entries
}

#[derive(Debug, Clone, Serialize)]
pub struct InsightsBundle {
    pub generated_at: DateTime<Utc>,
    pub risk_overview: RiskOverview,
    pub anomalies: Vec<Anomaly>,
    pub stability: HashMap<String, Stability>,
    pub leaderboard: Vec<LeaderboardEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preset() -> InsightsPreset {
        crate::models::InsightsRule::default_rule().balanced
    }

    #[test]
    fn detects_crowded_consensus() {
        let snapshot = SymbolSnapshot {
            symbol: "BTCUSDT".into(),
            total_traders: 5,
            confidence_score: 80.0,
            sentiment_score: 0.8,
            avg_leverage: 10.0,
            flip_count: 0,
        };
        let anomalies = detect_anomalies(&snapshot, &preset());
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == AnomalyType::CrowdedConsensus));
    }

    #[test]
    fn merge_keeps_higher_severity() {
        let a = Anomaly {
            anomaly_type: AnomalyType::HighLeverage,
            symbol: "BTCUSDT".into(),
            severity: AnomalySeverity::Medium,
        };
        let b = Anomaly {
            anomaly_type: AnomalyType::HighLeverage,
            symbol: "BTCUSDT".into(),
            severity: AnomalySeverity::High,
        };
        let merged = merge_anomalies(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].severity, AnomalySeverity::High);
    }

    #[test]
    fn stability_counts_flips_between_directions() {
        let directions = vec![Direction::Long, Direction::Long, Direction::Short, Direction::Long];
        let stability = compute_stability(&directions);
        assert_eq!(stability.flips, 2);
    }

    #[test]
    fn leaderboard_sorted_desc_and_capped() {
        let inputs: Vec<LeaderboardInput> = (0..10)
            .map(|i| LeaderboardInput {
                trader_id: format!("trader-{i}"),
                trader_weight: i as f64 / 10.0,
                quality_norm: 0.5,
                win_rate_norm: 0.5,
                activity_norm: 0.5,
                avg_leverage: 10.0,
            })
            .collect();
        let leaderboard = build_leaderboard(&inputs, 3);
        assert_eq!(leaderboard.len(), 3);
        assert_eq!(leaderboard[0].trader_id, "trader-9");
    }
}
