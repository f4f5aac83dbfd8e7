//! Trader metrics (§4.4, C5) — a pure function from a raw payload's orders
//! and active positions to a metrics record. Deterministic given the
//! input; no I/O, no clock reads beyond what the caller passes in.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Confidence, LivePosition, Order, OrderSide, PositionSide};
use crate::numeric::{round_to, safe_div};

#[derive(Debug, Clone, Serialize)]
pub struct TraderMetrics {
    pub win_rate: Option<f64>,
    pub wins: u32,
    pub losses: u32,
    pub breakeven: u32,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub positions_visible: bool,
    pub avg_leverage: Option<f64>,
    pub quality_score: f64,
    pub confidence: Confidence,
    pub closed_trades_7d: u32,
}

pub struct TraderMetricsInput<'a> {
    pub orders: &'a [Order],
    pub active_positions: &'a [LivePosition],
    /// ROI series as `(timestamp, roi_pct)` pairs, ascending by time.
    pub roi_series: &'a [(DateTime<Utc>, f64)],
    pub now: DateTime<Utc>,
}

fn is_closing_trade(order: &Order) -> bool {
    matches!(
        (order.side, order.position_side),
        (OrderSide::Sell, PositionSide::Long) | (OrderSide::Buy, PositionSide::Short)
    )
}

/// Mean and population standard deviation of a slice, or `(0.0, 0.0)` for
/// fewer than two samples.
fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

pub fn compute_trader_metrics(input: &TraderMetricsInput) -> TraderMetrics {
    let mut closing: Vec<&Order> = input
        .orders
        .iter()
        .filter(|o| is_closing_trade(o))
        .collect();
    closing.sort_by_key(|o| o.order_time);

    let mut wins = 0u32;
    let mut losses = 0u32;
    let mut breakeven = 0u32;
    let mut streak_wins = 0u32;
    let mut streak_losses = 0u32;
    let mut max_consecutive_wins = 0u32;
    let mut max_consecutive_losses = 0u32;
    let mut closed_trades_7d = 0u32;
    let cutoff_7d = input.now - chrono::Duration::days(7);
    let mut pnl_returns = Vec::new();

    for order in &closing {
        let pnl = order.total_pnl.unwrap_or(0.0);
        pnl_returns.push(pnl);

        if order.order_time >= cutoff_7d {
            closed_trades_7d += 1;
        }

        if pnl > 0.0 {
            wins += 1;
            streak_wins += 1;
            streak_losses = 0;
            max_consecutive_wins = max_consecutive_wins.max(streak_wins);
        } else if pnl < 0.0 {
            losses += 1;
            streak_losses += 1;
            streak_wins = 0;
            max_consecutive_losses = max_consecutive_losses.max(streak_losses);
        } else {
            breakeven += 1;
            streak_wins = 0;
            streak_losses = 0;
        }
    }

    let win_rate = if wins + losses == 0 {
        None
    } else {
        Some(wins as f64 / (wins + losses) as f64)
    };

    let positions_visible = input
        .active_positions
        .iter()
        .any(|p| !p.symbol.is_empty());
    let avg_leverage = if positions_visible {
        let sum: f64 = input.active_positions.iter().map(|p| p.leverage).sum();
        Some(sum / input.active_positions.len() as f64)
    } else {
        None
    };

    let (mean_pnl, stddev_pnl) = mean_stddev(&pnl_returns);
    let sharpe = if stddev_pnl > f64::EPSILON {
        mean_pnl / stddev_pnl
    } else {
        0.0
    };

    let roi30d_term = if input.roi_series.len() >= 2 {
        let first = input.roi_series.first().unwrap().1;
        let last = input.roi_series.last().unwrap().1;
        ((last - first) / 2.0).clamp(-15.0, 15.0)
    } else {
        0.0
    };

    let mut score = 50.0;
    score += win_rate.map(|r| (r * 20.0).round()).unwrap_or(0.0);
    score += (sharpe.min(3.0) * 5.0).round();
    score += roi30d_term;
    if positions_visible {
        if let Some(lev) = avg_leverage {
            if lev > 50.0 {
                score -= 10.0;
            } else if lev > 30.0 {
                score -= 5.0;
            } else if lev < 20.0 {
                score += 5.0;
            }
        }
    }
    score -= 5.0 * max_consecutive_losses.min(3) as f64;
    let quality_score = score.clamp(0.0, 100.0);

    let confidence = if closed_trades_7d >= 20 {
        Confidence::High
    } else if closed_trades_7d >= 10 {
        Confidence::Medium
    } else {
        Confidence::Low
    };

    TraderMetrics {
        win_rate: win_rate.map(|r| round_to(r, 4)),
        wins,
        losses,
        breakeven,
        max_consecutive_wins,
        max_consecutive_losses,
        positions_visible,
        avg_leverage: avg_leverage.map(|l| round_to(l, 2)),
        quality_score: round_to(quality_score, 2),
        confidence,
        closed_trades_7d,
    }
}

#[allow(dead_code)]
fn roi_delta_over_count(count: usize) -> f64 {
    safe_div(1.0, count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: OrderSide, position_side: PositionSide, pnl: Option<f64>, time: DateTime<Utc>) -> Order {
        Order {
            symbol: "BTCUSDT".into(),
            side,
            position_side,
            executed_qty: 1.0,
            avg_price: 100.0,
            total_pnl: pnl,
            order_time: time,
            order_update_time: None,
        }
    }

    #[test]
    fn win_rate_null_when_no_closing_trades() {
        let now = Utc::now();
        let input = TraderMetricsInput {
            orders: &[],
            active_positions: &[],
            roi_series: &[],
            now,
        };
        let metrics = compute_trader_metrics(&input);
        assert_eq!(metrics.win_rate, None);
        assert_eq!(metrics.quality_score, 50.0);
    }

    #[test]
    fn win_rate_and_streaks_from_closing_trades() {
        let now = Utc::now();
        let orders = vec![
            order(OrderSide::Sell, PositionSide::Long, Some(5.0), now - chrono::Duration::days(1)),
            order(OrderSide::Sell, PositionSide::Long, Some(3.0), now - chrono::Duration::hours(12)),
            order(OrderSide::Sell, PositionSide::Long, Some(-2.0), now - chrono::Duration::hours(6)),
        ];
        let input = TraderMetricsInput {
            orders: &orders,
            active_positions: &[],
            roi_series: &[],
            now,
        };
        let metrics = compute_trader_metrics(&input);
        assert_eq!(metrics.wins, 2);
        assert_eq!(metrics.losses, 1);
        assert_eq!(metrics.max_consecutive_wins, 2);
        assert_eq!(metrics.win_rate, Some((2.0f64 / 3.0 * 10000.0).round() / 10000.0));
    }
}
