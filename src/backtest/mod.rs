//! Backtest-Lite: deterministic event-replay over a symbol's event
//! history (§4.15, C15). Advanced metrics live in [`analytics`].

pub mod analytics;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::consensus::{compute_consensus, OpenContribution};
use crate::models::{ConsensusDirection, Direction, Event, EventKind};
use crate::numeric::round4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct VirtualTrade {
    pub symbol: String,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub pnl_usdt: Option<f64>,
    pub roi_pct: Option<f64>,
    pub status: TradeStatus,
}

pub struct BacktestConfig {
    pub leverage: f64,
    pub margin_notional: f64,
    pub slippage_bps: f64,
    pub commission_bps: f64,
    pub min_traders: usize,
    pub min_confidence: f64,
    pub min_sentiment_abs: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            leverage: 10.0,
            margin_notional: 100.0,
            slippage_bps: 5.0,
            commission_bps: 4.0,
            min_traders: 3,
            min_confidence: 60.0,
            min_sentiment_abs: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BacktestSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub breakeven: usize,
    pub win_rate_pct: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub avg_roi_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolRollup {
    pub symbol: String,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestOutput {
    pub trades: Vec<VirtualTrade>,
    pub summary: BacktestSummary,
    pub per_symbol: Vec<SymbolRollup>,
}

#[derive(Default)]
struct SymbolState {
    open_long: HashSet<String>,
    open_short: HashSet<String>,
    active: Option<VirtualTrade>,
    last_price: Option<f64>,
}

fn effective_price(base_price: f64, slippage_bps: f64, direction: Direction, is_entry: bool) -> f64 {
    let buying = matches!((direction, is_entry), (Direction::Long, true) | (Direction::Short, false));
    let factor = slippage_bps / 10_000.0;
    if buying {
        base_price * (1.0 + factor)
    } else {
        base_price * (1.0 - factor)
    }
}

fn commission(position_notional: f64, commission_bps: f64) -> f64 {
    position_notional * commission_bps / 10_000.0
}

fn close_trade(
    state: &mut SymbolState,
    exit_time: DateTime<Utc>,
    exit_price: f64,
    config: &BacktestConfig,
    closed: &mut Vec<VirtualTrade>,
) {
    let Some(mut trade) = state.active.take() else {
        return;
    };
    let effective_exit = effective_price(exit_price, config.slippage_bps, trade.direction, false);
    let move_pct = match trade.direction {
        Direction::Long => (effective_exit - trade.entry_price) / trade.entry_price,
        Direction::Short => (trade.entry_price - effective_exit) / trade.entry_price,
    };
    let position_notional = config.margin_notional * config.leverage;
    let gross_pnl = position_notional * move_pct;
    let exit_commission = commission(position_notional, config.commission_bps);
    let net_pnl = gross_pnl - exit_commission;

    trade.exit_time = Some(exit_time);
    trade.exit_price = Some(round4(effective_exit));
    trade.pnl_usdt = Some(round4(net_pnl));
    trade.roi_pct = Some(round4(net_pnl / config.margin_notional * 100.0));
    trade.status = TradeStatus::Closed;
    closed.push(trade);
}

fn try_open_trade(
    symbol: &str,
    state: &mut SymbolState,
    trader_weights: &HashMap<String, f64>,
    price: f64,
    now: DateTime<Utc>,
    config: &BacktestConfig,
) {
    if state.active.is_some() {
        return;
    }
    let contributions: Vec<OpenContribution> = state
        .open_long
        .iter()
        .map(|t| OpenContribution {
            direction: Direction::Long,
            weight: trader_weights.get(t).copied().unwrap_or(1.0),
        })
        .chain(state.open_short.iter().map(|t| OpenContribution {
            direction: Direction::Short,
            weight: trader_weights.get(t).copied().unwrap_or(1.0),
        }))
        .collect();

    let result = compute_consensus(symbol, &contributions);
    let meets = result.direction != ConsensusDirection::Neutral
        && result.total_traders >= config.min_traders
        && (result.confidence_score as f64) >= config.min_confidence
        && result.sentiment_score.abs() * 100.0 >= config.min_sentiment_abs;
    if !meets {
        return;
    }

    let direction = if result.direction == ConsensusDirection::Long {
        Direction::Long
    } else {
        Direction::Short
    };
    let entry_price = effective_price(price, config.slippage_bps, direction, true);
    state.active = Some(VirtualTrade {
        symbol: symbol.to_string(),
        direction,
        entry_time: now,
        exit_time: None,
        entry_price: round4(entry_price),
        exit_price: None,
        pnl_usdt: None,
        roi_pct: None,
        status: TradeStatus::Open,
    });
}

/// Replays `events` (any order; this function sorts them) across their
/// symbols' open/closed consensus state and produces the resulting virtual
/// trade list and rollups (§4.15). `trader_weights` defaults to `1.0` for
/// any trader absent from the map.
pub fn run_backtest(
    events: &[Event],
    trader_weights: &HashMap<String, f64>,
    config: &BacktestConfig,
) -> BacktestOutput {
    let mut ordered: Vec<&Event> = events.iter().collect();
    ordered.sort_by_key(|e| (e.event_time.unwrap_or(e.fetched_at), e.fetched_at));

    let mut state_by_symbol: HashMap<String, SymbolState> = HashMap::new();
    let mut closed_trades = Vec::new();

    for event in ordered {
        let state = state_by_symbol.entry(event.symbol.clone()).or_default();
        if let Some(price) = event.price.filter(|p| *p > 0.0) {
            state.last_price = Some(price);
        }

        match event.kind {
            EventKind::OpenLong => {
                state.open_long.insert(event.trader_id.clone());
            }
            EventKind::CloseLong => {
                state.open_long.remove(&event.trader_id);
            }
            EventKind::OpenShort => {
                state.open_short.insert(event.trader_id.clone());
            }
            EventKind::CloseShort => {
                state.open_short.remove(&event.trader_id);
            }
        }

        let event_time = event.event_time.unwrap_or(event.fetched_at);

        if let Some(active) = &state.active {
            if event.kind == EventKind::close_counterpart_for(active.direction) {
                let exit_price = event
                    .price
                    .filter(|p| *p > 0.0)
                    .or(state.last_price)
                    .unwrap_or(active.entry_price);
                close_trade(state, event_time, exit_price, config, &mut closed_trades);
                continue;
            }
        }

        if state.active.is_none() {
            if let Some(price) = event.price.filter(|p| *p > 0.0).or(state.last_price) {
                try_open_trade(&event.symbol, state, trader_weights, price, event_time, config);
            }
        }
    }

    summarize(closed_trades)
}

fn summarize(trades: Vec<VirtualTrade>) -> BacktestOutput {
    let mut wins = 0usize;
    let mut losses = 0usize;
    let mut breakeven = 0usize;
    let mut total_pnl = 0.0;
    let mut total_roi = 0.0;
    let mut per_symbol: HashMap<String, SymbolRollup> = HashMap::new();

    for trade in &trades {
        let pnl = trade.pnl_usdt.unwrap_or(0.0);
        total_pnl += pnl;
        total_roi += trade.roi_pct.unwrap_or(0.0);
        if pnl > 0.0 {
            wins += 1;
        } else if pnl < 0.0 {
            losses += 1;
        } else {
            breakeven += 1;
        }

        let rollup = per_symbol.entry(trade.symbol.clone()).or_insert(SymbolRollup {
            symbol: trade.symbol.clone(),
            trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
        });
        rollup.trades += 1;
        rollup.total_pnl += pnl;
        if pnl > 0.0 {
            rollup.wins += 1;
        } else if pnl < 0.0 {
            rollup.losses += 1;
        }
    }

    let count = trades.len();
    let win_rate_pct = if count > 0 {
        wins as f64 / count as f64 * 100.0
    } else {
        0.0
    };
    let avg_pnl = if count > 0 { total_pnl / count as f64 } else { 0.0 };
    let avg_roi_pct = if count > 0 { total_roi / count as f64 } else { 0.0 };

    let mut rollups: Vec<SymbolRollup> = per_symbol.into_values().collect();
    rollups.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    BacktestOutput {
        trades,
        summary: BacktestSummary {
            trades: count,
            wins,
            losses,
            breakeven,
            win_rate_pct: round4(win_rate_pct),
            total_pnl: round4(total_pnl),
            avg_pnl: round4(avg_pnl),
            avg_roi_pct: round4(avg_roi_pct),
        },
        per_symbol: rollups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(symbol: &str, trader: &str, kind: EventKind, t: DateTime<Utc>, price: f64) -> Event {
        Event {
            id: None,
            trader_id: trader.to_string(),
            symbol: symbol.to_string(),
            kind,
            event_time: Some(t),
            fetched_at: t,
            price: Some(price),
            amount: 1.0,
            realized_pnl: None,
        }
    }

    #[test]
    fn opens_and_closes_a_trade_on_consensus_and_counter_event() {
        let t0 = Utc::now();
        let events = vec![
            event("BTCUSDT", "t1", EventKind::OpenLong, t0, 100.0),
            event("BTCUSDT", "t2", EventKind::OpenLong, t0 + Duration::seconds(1), 100.0),
            event("BTCUSDT", "t3", EventKind::OpenLong, t0 + Duration::seconds(2), 101.0),
            event("BTCUSDT", "t1", EventKind::CloseLong, t0 + Duration::seconds(10), 110.0),
        ];
        let weights = HashMap::new();
        let config = BacktestConfig {
            min_traders: 3,
            min_confidence: 0.0,
            min_sentiment_abs: 0.0,
            ..BacktestConfig::default()
        };
        let output = run_backtest(&events, &weights, &config);
        assert_eq!(output.summary.trades, 1);
        assert_eq!(output.trades[0].status, TradeStatus::Closed);
        assert!(output.trades[0].pnl_usdt.unwrap() > 0.0);
    }

    #[test]
    fn no_trade_when_thresholds_unmet() {
        let t0 = Utc::now();
        let events = vec![event("ETHUSDT", "t1", EventKind::OpenLong, t0, 100.0)];
        let weights = HashMap::new();
        let config = BacktestConfig::default();
        let output = run_backtest(&events, &weights, &config);
        assert_eq!(output.summary.trades, 0);
    }
}
