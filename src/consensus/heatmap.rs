//! Heatmap & symbol queries (§4.10, C11).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Direction, Segment};
use crate::numeric::{clamp_or_zero, safe_div};

use super::{TIME_RANGE_1H_MS, TIME_RANGE_24H_MS, TIME_RANGE_4H_MS, TIME_RANGE_7D_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    H1,
    H4,
    H24,
    D7,
    All,
}

impl TimeRange {
    /// Window length in milliseconds; `None` for `All` (infinite).
    pub fn millis(self) -> Option<i64> {
        match self {
            TimeRange::H1 => Some(TIME_RANGE_1H_MS),
            TimeRange::H4 => Some(TIME_RANGE_4H_MS),
            TimeRange::H24 => Some(TIME_RANGE_24H_MS),
            TimeRange::D7 => Some(TIME_RANGE_7D_MS),
            TimeRange::All => None,
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        TimeRange::H24
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeverageBucket {
    All,
    Under20,
    Between20And50,
    Between50And100,
    Over100,
}

impl LeverageBucket {
    pub fn contains(self, leverage: f64) -> bool {
        match self {
            LeverageBucket::All => true,
            LeverageBucket::Under20 => leverage < 20.0,
            LeverageBucket::Between20And50 => (20.0..=50.0).contains(&leverage),
            LeverageBucket::Between50And100 => (50.0..=100.0).contains(&leverage),
            LeverageBucket::Over100 => leverage > 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentQueryFilter {
    VisibleOnly,
    HiddenOnly,
    Both,
}

/// Segment filter treats `Unknown` as visible under `Both` (§4.10).
pub fn segment_matches(filter: SegmentQueryFilter, segment: Segment) -> bool {
    match filter {
        SegmentQueryFilter::VisibleOnly => segment == Segment::Visible,
        SegmentQueryFilter::HiddenOnly => segment == Segment::Hidden,
        SegmentQueryFilter::Both => segment != Segment::Hidden,
    }
}

/// Parses `recentlyOpened` strings like `15m`, `4h`, `2d` into a
/// duration. Returns `None` for anything not matching `^\d+(m|h|d)$`.
pub fn parse_recently_opened(raw: &str) -> Option<chrono::Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let amount: i64 = digits.parse().ok()?;
    match unit {
        "m" => Some(chrono::Duration::minutes(amount)),
        "h" => Some(chrono::Duration::hours(amount)),
        "d" => Some(chrono::Duration::days(amount)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Momentum {
    Forming,
    Weakening,
    Stable,
}

/// `forming` if opens in the last 1h are >= 1.5x opens in the prior
/// 1h-4h window; `weakening` if <= 0.5x; else `stable` (§4.10).
pub fn classify_momentum(opens_last_1h: u32, opens_prior_1h_to_4h: u32) -> Momentum {
    if opens_prior_1h_to_4h == 0 {
        return if opens_last_1h > 0 {
            Momentum::Forming
        } else {
            Momentum::Stable
        };
    }
    let ratio = opens_last_1h as f64 / opens_prior_1h_to_4h as f64;
    if ratio >= 1.5 {
        Momentum::Forming
    } else if ratio <= 0.5 {
        Momentum::Weakening
    } else {
        Momentum::Stable
    }
}

/// Recommended position sizing fraction against the confidence score
/// (§4.10).
pub fn sizing_fraction(confidence_score: f64) -> f64 {
    if confidence_score >= 85.0 {
        0.03
    } else if confidence_score >= 75.0 {
        0.02
    } else if confidence_score >= 65.0 {
        0.01
    } else if confidence_score >= 55.0 {
        0.005
    } else {
        0.0
    }
}

/// `roe = unrealized_pnl / (notional/leverage) * 100`.
pub fn compute_roe(unrealized_pnl: f64, notional: f64, leverage: f64) -> f64 {
    let margin = safe_div(notional, leverage);
    clamp_or_zero(safe_div(unrealized_pnl, margin) * 100.0, -1e6, 1e6)
}

/// `pnl_percent = unrealized_pnl / (amount*entry_price) * 100`.
pub fn compute_pnl_percent(unrealized_pnl: f64, amount: f64, entry_price: f64) -> f64 {
    clamp_or_zero(safe_div(unrealized_pnl, amount * entry_price) * 100.0, -1e6, 1e6)
}

/// Coefficient of variation (stddev/mean) of entry prices across
/// traders holding the same symbol — the "entry-price spread" (§4.10).
pub fn entry_price_spread(entry_prices: &[f64]) -> f64 {
    if entry_prices.len() < 2 {
        return 0.0;
    }
    let mean = entry_prices.iter().sum::<f64>() / entry_prices.len() as f64;
    if mean.abs() < f64::EPSILON {
        return 0.0;
    }
    let variance = entry_prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>()
        / entry_prices.len() as f64;
    (variance.sqrt() / mean).abs()
}

pub fn hold_duration_seconds(open_time: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(open_time).num_seconds().max(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct HeatmapPositionView {
    pub trader_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub roe: f64,
    pub pnl_percent: f64,
    pub hold_duration_seconds: i64,
    pub leverage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolHeatmapEntry {
    pub symbol: String,
    pub entry_price_spread: f64,
    pub momentum: Momentum,
    pub sizing_fraction: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leverage_buckets_are_inclusive_at_boundaries() {
        assert!(LeverageBucket::Between20And50.contains(20.0));
        assert!(LeverageBucket::Between20And50.contains(50.0));
        assert!(LeverageBucket::Between50And100.contains(100.0));
        assert!(LeverageBucket::Over100.contains(100.01));
    }

    #[test]
    fn segment_filter_treats_unknown_as_visible_for_both() {
        assert!(segment_matches(SegmentQueryFilter::Both, Segment::Unknown));
        assert!(!segment_matches(SegmentQueryFilter::HiddenOnly, Segment::Unknown));
    }

    #[test]
    fn recently_opened_parses_valid_and_rejects_invalid() {
        assert_eq!(parse_recently_opened("15m"), Some(chrono::Duration::minutes(15)));
        assert_eq!(parse_recently_opened("bogus"), None);
        assert_eq!(parse_recently_opened("4x"), None);
    }

    #[test]
    fn momentum_classification_thresholds() {
        assert_eq!(classify_momentum(3, 2), Momentum::Forming);
        assert_eq!(classify_momentum(1, 4), Momentum::Weakening);
        assert_eq!(classify_momentum(2, 2), Momentum::Stable);
    }

    #[test]
    fn sizing_fraction_table() {
        assert_eq!(sizing_fraction(90.0), 0.03);
        assert_eq!(sizing_fraction(80.0), 0.02);
        assert_eq!(sizing_fraction(70.0), 0.01);
        assert_eq!(sizing_fraction(60.0), 0.005);
        assert_eq!(sizing_fraction(30.0), 0.0);
    }
}
