//! Core data model (§3).
//!
//! These types are the shared vocabulary between the derivation layer,
//! storage layer, and API. Dynamic upstream payloads are deliberately kept
//! as `serde_json::Value` in `upstream`/`scraper` (§9, "Dynamic payload
//! shapes") — typed projections happen explicitly in `derive::*`, never
//! through broad structural coercion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// §3 Trader.segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Visible,
    Hidden,
    Unknown,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Visible => "visible",
            Segment::Hidden => "hidden",
            Segment::Unknown => "unknown",
        }
    }

    /// Segment derived from the latest payload's `positionShow` flag.
    pub fn from_position_show(position_show: Option<bool>) -> Self {
        match position_show {
            Some(true) => Segment::Visible,
            Some(false) => Segment::Hidden,
            None => Segment::Unknown,
        }
    }
}

/// Staleness classification of a trader's `positionShow` flag (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStaleness {
    Fresh,
    Stale1h,
    Stale24h,
    NeverSet,
}

impl FlagStaleness {
    pub fn classify(last_change: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_change {
            None => FlagStaleness::NeverSet,
            Some(changed_at) => {
                let age = now.signed_duration_since(changed_at);
                if age < chrono::Duration::hours(1) {
                    FlagStaleness::Fresh
                } else if age < chrono::Duration::hours(24) {
                    FlagStaleness::Stale1h
                } else {
                    FlagStaleness::Stale24h
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub trader_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub segment: Segment,
    pub segment_changed_at: Option<DateTime<Utc>>,
}

/// Position/order side enums (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// A live position contained inside `RawIngest.activePositions` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub amount: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub break_even_price: Option<f64>,
    pub notional: f64,
    pub leverage: f64,
    pub isolated: bool,
    pub unrealized_pnl: f64,
    pub cumulative_realized: f64,
    pub adl_bucket: Option<u8>,
}

/// An order contained inside `RawIngest.orderHistory` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub total_pnl: Option<f64>,
    pub order_time: DateTime<Utc>,
    pub order_update_time: Option<DateTime<Utc>>,
}

/// A normalized event (§3, §4.8 event log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
}

impl EventKind {
    pub fn direction(&self) -> Direction {
        match self {
            EventKind::OpenLong | EventKind::CloseLong => Direction::Long,
            EventKind::OpenShort | EventKind::CloseShort => Direction::Short,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, EventKind::OpenLong | EventKind::OpenShort)
    }

    pub fn close_counterpart_for(direction: Direction) -> EventKind {
        match direction {
            Direction::Long => EventKind::CloseLong,
            Direction::Short => EventKind::CloseShort,
        }
    }

    pub fn open_for(direction: Direction) -> EventKind {
        match direction {
            Direction::Long => EventKind::OpenLong,
            Direction::Short => EventKind::OpenShort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub trader_id: String,
    pub symbol: String,
    pub kind: EventKind,
    pub event_time: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub price: Option<f64>,
    pub amount: f64,
    pub realized_pnl: Option<f64>,
}

/// Reconstructed per-`(trader,symbol,direction)` lifecycle state (§3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionState {
    pub id: Option<i64>,
    pub trader_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub amount: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub estimated_open_time: DateTime<Utc>,
    pub estimated_close_time: Option<DateTime<Utc>>,
    pub disappeared_at: Option<DateTime<Utc>>,
    pub leverage: Option<f64>,
    pub opening_event_id: Option<i64>,
    /// Set only by the order-history fallback reconstruction (§4.7).
    pub confidence: Option<f64>,
    /// Last mark price observed for this row directly in `activePositions`
    /// (only available for visible traders; `None` for hidden/fallback rows).
    pub mark_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

impl PositionState {
    /// Uncertainty bounds on the open time: `[last snapshot without, first
    /// snapshot with]`, falling back to the point estimate when unknown.
    pub fn open_time_bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.estimated_open_time, self.first_seen_at)
    }

    /// Uncertainty bounds on the close time: `[last_seen_at,
    /// disappeared_at]`, falling back to the point estimate.
    pub fn close_time_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.disappeared_at
            .map(|disappeared| (self.last_seen_at, disappeared))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn factor(&self) -> f64 {
        match self {
            Confidence::High => 1.0,
            Confidence::Medium => 0.7,
            Confidence::Low => 0.4,
        }
    }
}

/// §3 TraderScore — one row per trader, upserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderScore {
    pub trader_id: String,
    pub quality_score: f64,
    pub confidence: Confidence,
    pub win_rate: Option<f64>,
    pub sample_size: usize,
    pub trader_weight: f64,
    pub updated_at: DateTime<Utc>,
    /// Segment as of the most recent derivation pass (§3, §4.10).
    pub segment: Segment,
}

/// §3 SymbolAggregation — derived, rebuildable from PositionState.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolAggregation {
    pub symbol: String,
    pub open_longs: usize,
    pub open_shorts: usize,
    pub total_opens: u64,
    pub latest_event_id: Option<i64>,
}

/// §4.9 consensus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDirection {
    Long,
    Short,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    FirstTraderClose,
    AutoReverseSignal,
    ManualClose,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Manual,
    Auto,
}

/// §3 SimulatedPosition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedPosition {
    pub id: i64,
    pub platform: String,
    pub symbol: String,
    pub direction: Direction,
    pub status: SimulatedStatus,
    pub leverage: f64,
    pub margin_notional: f64,
    pub position_notional: f64,
    pub entry_price: f64,
    pub effective_entry_price: f64,
    pub exit_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub close_trigger_trader_id: Option<String>,
    pub close_trigger_event_kind: Option<EventKind>,
    pub pnl_usdt: Option<f64>,
    pub roi_pct: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    /// Best price seen in the position's favorable direction since open —
    /// the anchor a trailing stop measures retracement against (§4.12).
    pub peak_favorable_price: Option<f64>,
    pub slippage_bps: f64,
    pub commission_bps: f64,
    pub portfolio_id: String,
    pub source: PositionSource,
}

/// §3 Portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub name: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub kelly_fraction: f64,
    pub min_sample_size: usize,
    pub max_risk_per_trade: f64,
    pub max_portfolio_risk: f64,
    pub max_open_positions: usize,
    pub default_slippage_bps: f64,
    pub default_commission_bps: f64,
}

impl Portfolio {
    pub fn default_with_id(id: impl Into<String>, initial_balance: f64) -> Self {
        Self {
            id: id.into(),
            name: "default".to_string(),
            initial_balance,
            current_balance: initial_balance,
            kelly_fraction: 0.25,
            min_sample_size: 20,
            max_risk_per_trade: 0.02,
            max_portfolio_risk: 0.3,
            max_open_positions: 10,
            default_slippage_bps: 5.0,
            default_commission_bps: 4.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentFilter {
    Visible,
    Hidden,
    Both,
}

/// §3 AutoTriggerRule — singleton by default id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTriggerRule {
    pub id: String,
    pub enabled: bool,
    pub segment_filter: SegmentFilter,
    pub time_range_ms: i64,
    pub min_traders: usize,
    pub min_confidence: f64,
    pub min_sentiment_abs: f64,
    pub leverage: f64,
    pub margin_notional: f64,
    pub cooldown_minutes: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub portfolio_id: String,
}

pub const DEFAULT_RULE_ID: &str = "default";

/// 24h time-range bucket, in milliseconds (§4.10).
pub const TIME_RANGE_24H_MS: i64 = 86_400_000;

impl AutoTriggerRule {
    pub fn default_rule(portfolio_id: impl Into<String>) -> Self {
        Self {
            id: DEFAULT_RULE_ID.to_string(),
            enabled: false,
            segment_filter: SegmentFilter::Both,
            time_range_ms: TIME_RANGE_24H_MS,
            min_traders: 3,
            min_confidence: 60.0,
            min_sentiment_abs: 40.0,
            leverage: 10.0,
            margin_notional: 100.0,
            cooldown_minutes: 60,
            last_run_at: None,
            portfolio_id: portfolio_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightsMode {
    Conservative,
    Balanced,
    Aggressive,
}

/// One preset bundle of §4.11 anomaly/risk thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsPreset {
    pub crowded_min_traders: usize,
    pub crowded_min_confidence: f64,
    pub crowded_min_sentiment_abs: f64,
    pub low_confidence_limit: f64,
    pub high_leverage_threshold: f64,
    pub extreme_leverage_threshold: f64,
    pub unstable_flip_threshold: u32,
    pub cluster_flip_threshold: u32,
    pub score_multiplier: f64,
}

impl InsightsPreset {
    /// Sanitizes every field into fixed numeric ranges at load time,
    /// regardless of what was stored (§4.11).
    pub fn sanitize(&self) -> Self {
        Self {
            crowded_min_traders: self.crowded_min_traders.clamp(1, 50),
            crowded_min_confidence: self.crowded_min_confidence.clamp(0.0, 100.0),
            crowded_min_sentiment_abs: self.crowded_min_sentiment_abs.clamp(0.0, 100.0),
            low_confidence_limit: self.low_confidence_limit.clamp(0.0, 100.0),
            high_leverage_threshold: self.high_leverage_threshold.clamp(1.0, 200.0),
            extreme_leverage_threshold: self.extreme_leverage_threshold.clamp(1.0, 200.0),
            unstable_flip_threshold: self.unstable_flip_threshold.clamp(1, 50),
            cluster_flip_threshold: self.cluster_flip_threshold.clamp(1, 50),
            score_multiplier: self.score_multiplier.clamp(0.1, 3.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsRule {
    pub id: String,
    pub default_mode: InsightsMode,
    pub conservative: InsightsPreset,
    pub balanced: InsightsPreset,
    pub aggressive: InsightsPreset,
}

pub const INSIGHTS_RULE_ID: &str = "default";

impl InsightsRule {
    pub fn default_rule() -> Self {
        Self {
            id: INSIGHTS_RULE_ID.to_string(),
            default_mode: InsightsMode::Balanced,
            conservative: InsightsPreset {
                crowded_min_traders: 5,
                crowded_min_confidence: 70.0,
                crowded_min_sentiment_abs: 60.0,
                low_confidence_limit: 30.0,
                high_leverage_threshold: 30.0,
                extreme_leverage_threshold: 60.0,
                unstable_flip_threshold: 3,
                cluster_flip_threshold: 5,
                score_multiplier: 1.2,
            },
            balanced: InsightsPreset {
                crowded_min_traders: 3,
                crowded_min_confidence: 60.0,
                crowded_min_sentiment_abs: 50.0,
                low_confidence_limit: 25.0,
                high_leverage_threshold: 40.0,
                extreme_leverage_threshold: 75.0,
                unstable_flip_threshold: 4,
                cluster_flip_threshold: 6,
                score_multiplier: 1.0,
            },
            aggressive: InsightsPreset {
                crowded_min_traders: 2,
                crowded_min_confidence: 45.0,
                crowded_min_sentiment_abs: 35.0,
                low_confidence_limit: 20.0,
                high_leverage_threshold: 50.0,
                extreme_leverage_threshold: 100.0,
                unstable_flip_threshold: 6,
                cluster_flip_threshold: 9,
                score_multiplier: 0.85,
            },
        }
    }

    pub fn preset(&self, mode: InsightsMode) -> InsightsPreset {
        match mode {
            InsightsMode::Conservative => self.conservative.sanitize(),
            InsightsMode::Balanced => self.balanced.sanitize(),
            InsightsMode::Aggressive => self.aggressive.sanitize(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_from_position_show() {
        assert_eq!(Segment::from_position_show(Some(true)), Segment::Visible);
        assert_eq!(Segment::from_position_show(Some(false)), Segment::Hidden);
        assert_eq!(Segment::from_position_show(None), Segment::Unknown);
    }

    #[test]
    fn preset_sanitizes_out_of_range_values() {
        let dirty = InsightsPreset {
            crowded_min_traders: 0,
            crowded_min_confidence: 500.0,
            crowded_min_sentiment_abs: -10.0,
            low_confidence_limit: 1000.0,
            high_leverage_threshold: 0.0,
            extreme_leverage_threshold: 99999.0,
            unstable_flip_threshold: 0,
            cluster_flip_threshold: 999,
            score_multiplier: 10.0,
        };
        let clean = dirty.sanitize();
        assert_eq!(clean.crowded_min_traders, 1);
        assert_eq!(clean.crowded_min_confidence, 100.0);
        assert_eq!(clean.crowded_min_sentiment_abs, 0.0);
        assert_eq!(clean.score_multiplier, 3.0);
    }

    #[test]
    fn event_kind_round_trips_direction() {
        assert_eq!(EventKind::open_for(Direction::Long), EventKind::OpenLong);
        assert_eq!(
            EventKind::close_counterpart_for(Direction::Short),
            EventKind::CloseShort
        );
        assert!(EventKind::OpenShort.is_open());
        assert!(!EventKind::CloseLong.is_open());
    }
}
