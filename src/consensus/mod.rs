//! Consensus engine and heatmap/symbol queries (§4.9-§4.10, C10/C11).

pub mod heatmap;

use serde::Serialize;

use crate::models::{ConsensusDirection, Direction};
use crate::numeric::safe_div;

pub const TIME_RANGE_1H_MS: i64 = 3_600_000;
pub const TIME_RANGE_4H_MS: i64 = 14_400_000;
pub const TIME_RANGE_24H_MS: i64 = 86_400_000;
pub const TIME_RANGE_7D_MS: i64 = 604_800_000;

/// One currently-open `(trader, direction)` pair contributing to a
/// symbol's consensus (§4.9).
#[derive(Debug, Clone, Copy)]
pub struct OpenContribution {
    pub direction: Direction,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusResult {
    pub symbol: String,
    pub long_weight: f64,
    pub short_weight: f64,
    pub sum_weights: f64,
    pub sentiment_score: f64,
    pub trader_coverage: f64,
    pub weight_coverage: f64,
    pub confidence_score: u32,
    pub direction: ConsensusDirection,
    pub total_traders: usize,
}

const EPS: f64 = 1e-9;

pub fn compute_consensus(symbol: &str, contributions: &[OpenContribution]) -> ConsensusResult {
    let long_weight: f64 = contributions
        .iter()
        .filter(|c| c.direction == Direction::Long)
        .map(|c| c.weight)
        .sum();
    let short_weight: f64 = contributions
        .iter()
        .filter(|c| c.direction == Direction::Short)
        .map(|c| c.weight)
        .sum();
    let sum_weights = long_weight + short_weight;

    let sentiment_score = if sum_weights <= EPS {
        0.0
    } else {
        ((long_weight - short_weight) / sum_weights.max(EPS)).clamp(-1.0, 1.0)
    };

    let total_traders = contributions.len();
    let trader_coverage = (total_traders as f64 / 3.0).min(1.0);
    let weight_coverage = safe_div(sum_weights, 0.5).min(1.0);

    let confidence_score =
        (sentiment_score.abs() * trader_coverage * weight_coverage * 100.0).round() as u32;

    let direction = if sentiment_score > 0.05 {
        ConsensusDirection::Long
    } else if sentiment_score < -0.05 {
        ConsensusDirection::Short
    } else {
        ConsensusDirection::Neutral
    };

    ConsensusResult {
        symbol: symbol.to_string(),
        long_weight,
        short_weight,
        sum_weights,
        sentiment_score,
        trader_coverage,
        weight_coverage,
        confidence_score,
        direction,
        total_traders,
    }
}

/// Sort order for heatmap/consensus listings: confidence desc, then
/// total traders desc (§4.9).
pub fn sort_for_listing(results: &mut [ConsensusResult]) {
    results.sort_by(|a, b| {
        b.confidence_score
            .cmp(&a.confidence_score)
            .then(b.total_traders.cmp(&a.total_traders))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_when_no_contributions() {
        let result = compute_consensus("BTCUSDT", &[]);
        assert_eq!(result.sentiment_score, 0.0);
        assert_eq!(result.direction, ConsensusDirection::Neutral);
    }

    #[test]
    fn long_heavy_book_is_long_consensus() {
        let contributions = vec![
            OpenContribution { direction: Direction::Long, weight: 0.8 },
            OpenContribution { direction: Direction::Long, weight: 0.6 },
            OpenContribution { direction: Direction::Short, weight: 0.1 },
        ];
        let result = compute_consensus("BTCUSDT", &contributions);
        assert_eq!(result.direction, ConsensusDirection::Long);
        assert!(result.confidence_score > 0);
    }

    #[test]
    fn sort_orders_by_confidence_then_traders() {
        let mut results = vec![
            ConsensusResult {
                symbol: "A".into(), long_weight: 0.0, short_weight: 0.0, sum_weights: 0.0,
                sentiment_score: 0.0, trader_coverage: 0.0, weight_coverage: 0.0,
                confidence_score: 50, direction: ConsensusDirection::Long, total_traders: 2,
            },
            ConsensusResult {
                symbol: "B".into(), long_weight: 0.0, short_weight: 0.0, sum_weights: 0.0,
                sentiment_score: 0.0, trader_coverage: 0.0, weight_coverage: 0.0,
                confidence_score: 50, direction: ConsensusDirection::Long, total_traders: 5,
            },
        ];
        sort_for_listing(&mut results);
        assert_eq!(results[0].symbol, "B");
    }
}
