//! Advanced analytics over a trade sequence: equity-curve ratios, Monte
//! Carlo bootstrap, and walk-forward validation (§4.16, C16).
//!
//! VaR/CVaR use historical simulation over realized trade returns; the
//! Monte Carlo resampler draws from that same distribution with a seeded
//! RNG so results are reproducible.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct TradeRecord {
    pub pnl: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvancedMetrics {
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub max_drawdown_duration: usize,
    pub calmar: f64,
    pub var_95: f64,
    pub cvar_95: f64,
    pub profit_factor: f64,
    pub recovery_factor: f64,
}

fn equity_curve(trades: &[TradeRecord], initial_balance: f64) -> Vec<f64> {
    let mut equity = initial_balance;
    let mut curve = Vec::with_capacity(trades.len() + 1);
    curve.push(equity);
    for trade in trades {
        equity += trade.pnl;
        curve.push(equity);
    }
    curve
}

fn returns_series(curve: &[f64]) -> Vec<f64> {
    curve
        .windows(2)
        .filter_map(|w| {
            if w[0].abs() > f64::EPSILON {
                Some((w[1] - w[0]) / w[0])
            } else {
                None
            }
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64], avg: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn max_drawdown_with_duration(curve: &[f64]) -> (f64, usize) {
    if curve.is_empty() {
        return (0.0, 0);
    }
    let mut peak = curve[0];
    let mut max_dd = 0.0;
    let mut duration = 0usize;
    let mut current_run = 0usize;
    for &equity in curve {
        if equity > peak {
            peak = equity;
            current_run = 0;
        } else {
            current_run += 1;
            duration = duration.max(current_run);
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    (max_dd, duration)
}

/// Computes the full advanced-metrics bundle for one ordered trade
/// sequence (§4.16). `rf_daily` is the risk-free daily rate subtracted
/// from average returns before the Sharpe/Sortino ratio.
pub fn compute_advanced_metrics(
    trades: &[TradeRecord],
    initial_balance: f64,
    rf_daily: f64,
) -> AdvancedMetrics {
    let curve = equity_curve(trades, initial_balance);
    let returns = returns_series(&curve);
    let avg_return = mean(&returns);
    let sigma = std_dev(&returns, avg_return);

    let sharpe = if sigma > f64::EPSILON {
        (avg_return - rf_daily) / sigma
    } else {
        0.0
    };

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let downside_avg = mean(&downside);
    let downside_sigma = std_dev(&downside, downside_avg);
    let sortino = if downside_sigma > f64::EPSILON {
        (avg_return - rf_daily) / downside_sigma
    } else {
        0.0
    };

    let (max_drawdown, max_drawdown_duration) = max_drawdown_with_duration(&curve);

    let calmar = if let (Some(first), Some(last)) = (trades.first(), trades.last()) {
        let span_years =
            (last.timestamp - first.timestamp).num_seconds() as f64 / (365.25 * 86_400.0);
        if span_years > f64::EPSILON && initial_balance > 0.0 && max_drawdown > f64::EPSILON {
            let final_balance = *curve.last().unwrap_or(&initial_balance);
            let cagr = (final_balance / initial_balance).powf(1.0 / span_years) - 1.0;
            cagr / max_drawdown
        } else {
            0.0
        }
    } else {
        0.0
    };

    let mut sorted_returns = returns.clone();
    sorted_returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let var_threshold = percentile(&sorted_returns, 5.0);
    let var_95 = var_threshold.abs();
    let tail: Vec<f64> = sorted_returns
        .iter()
        .copied()
        .filter(|r| *r <= var_threshold)
        .collect();
    let cvar_95 = mean(&tail).abs();

    let gross_wins: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).sum();
    let gross_losses: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p < 0.0).sum();
    let profit_factor = if gross_losses.abs() > f64::EPSILON {
        gross_wins / gross_losses.abs()
    } else if gross_wins > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let net_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
    let recovery_factor = if max_drawdown > f64::EPSILON && initial_balance > 0.0 {
        net_pnl / (max_drawdown * initial_balance)
    } else {
        0.0
    };

    AdvancedMetrics {
        sharpe,
        sortino,
        max_drawdown,
        max_drawdown_duration,
        calmar,
        var_95,
        cvar_95,
        profit_factor,
        recovery_factor,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonteCarloResult {
    pub num_simulations: usize,
    pub mean_final_equity: f64,
    pub median_final_equity: f64,
    pub std_dev_final_equity: f64,
    pub interval_95_low: f64,
    pub interval_95_high: f64,
    pub probability_of_ruin: f64,
}

/// Bootstraps `num_simulations` (default 1000, clamped `[100, 10000]`)
/// resamplings of the trade PnL series with replacement, run in parallel
/// over `rayon` (§4.16). `seed` makes runs reproducible.
pub fn run_monte_carlo(
    trades: &[TradeRecord],
    initial_balance: f64,
    num_simulations: Option<usize>,
    seed: u64,
) -> MonteCarloResult {
    let num_simulations = num_simulations.unwrap_or(1000).clamp(100, 10_000);
    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();

    let final_equities: Vec<f64> = (0..num_simulations)
        .into_par_iter()
        .map(|i| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            let mut equity = initial_balance;
            let mut ruined = false;
            for _ in 0..pnls.len() {
                if let Some(pnl) = pnls.choose(&mut rng) {
                    equity += pnl;
                    if equity <= 0.0 {
                        ruined = true;
                    }
                }
            }
            if ruined {
                equity.min(0.0) - 1.0
            } else {
                equity
            }
        })
        .collect();

    let mean_final_equity = mean(&final_equities);
    let std_dev_final_equity = std_dev(&final_equities, mean_final_equity);
    let probability_of_ruin =
        final_equities.iter().filter(|e| **e <= 0.0).count() as f64 / num_simulations as f64;

    let mut sorted = final_equities.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median_final_equity = percentile(&sorted, 50.0);
    let interval_95_low = percentile(&sorted, 2.5);
    let interval_95_high = percentile(&sorted, 97.5);

    MonteCarloResult {
        num_simulations,
        mean_final_equity,
        median_final_equity,
        std_dev_final_equity,
        interval_95_low,
        interval_95_high,
        probability_of_ruin,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardResult {
    pub num_windows: usize,
    pub mean_in_sample_win_rate: f64,
    pub mean_out_sample_win_rate: f64,
    pub correlation: f64,
    pub overfit_score: f64,
}

fn win_rate(trades: &[TradeRecord]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
    wins as f64 / trades.len() as f64
}

fn correlation(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 {
        return 0.0;
    }
    let mean_x = mean(xs);
    let mean_y = mean(ys);
    let cov: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let var_x = xs.iter().map(|x| (x - mean_x).powi(2)).sum::<f64>();
    let var_y = ys.iter().map(|y| (y - mean_y).powi(2)).sum::<f64>();
    let denom = (var_x * var_y).sqrt();
    if denom > f64::EPSILON {
        cov / denom
    } else {
        0.0
    }
}

/// Splits `trades` into `num_windows` (default 5) consecutive blocks,
/// each divided at `in_sample_ratio` (default 0.7), and compares in- vs
/// out-of-sample win rates (§4.16). Refuses below 50 trades.
pub fn run_walk_forward(
    trades: &[TradeRecord],
    num_windows: Option<usize>,
    in_sample_ratio: Option<f64>,
) -> Result<WalkForwardResult, String> {
    if trades.len() < 50 {
        return Err(format!(
            "walk-forward validation requires at least 50 trades, got {}",
            trades.len()
        ));
    }
    let num_windows = num_windows.unwrap_or(5).max(1);
    let in_sample_ratio = in_sample_ratio.unwrap_or(0.7).clamp(0.1, 0.9);

    let window_size = trades.len() / num_windows;
    if window_size == 0 {
        return Err("not enough trades to fill the requested number of windows".to_string());
    }

    let mut in_sample_rates = Vec::with_capacity(num_windows);
    let mut out_sample_rates = Vec::with_capacity(num_windows);

    for window_index in 0..num_windows {
        let start = window_index * window_size;
        let end = if window_index == num_windows - 1 {
            trades.len()
        } else {
            start + window_size
        };
        let window = &trades[start..end];
        let split = ((window.len() as f64) * in_sample_ratio).round() as usize;
        let (in_sample, out_sample) = window.split_at(split.min(window.len()));
        in_sample_rates.push(win_rate(in_sample));
        out_sample_rates.push(win_rate(out_sample));
    }

    let mean_in = mean(&in_sample_rates);
    let mean_out = mean(&out_sample_rates);
    let overfit_score = if mean_in.abs() > f64::EPSILON {
        (mean_in - mean_out).abs() / mean_in
    } else {
        0.0
    };

    Ok(WalkForwardResult {
        num_windows,
        mean_in_sample_win_rate: mean_in,
        mean_out_sample_win_rate: mean_out,
        correlation: correlation(&in_sample_rates, &out_sample_rates),
        overfit_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn trades(pnls: &[f64]) -> Vec<TradeRecord> {
        let t0 = Utc::now();
        pnls.iter()
            .enumerate()
            .map(|(i, pnl)| TradeRecord {
                pnl: *pnl,
                timestamp: t0 + Duration::hours(i as i64),
            })
            .collect()
    }

    #[test]
    fn sharpe_and_sortino_zero_when_no_variance() {
        let records = trades(&[10.0, 10.0, 10.0]);
        let metrics = compute_advanced_metrics(&records, 1000.0, 0.0);
        assert_eq!(metrics.sharpe, 0.0);
        assert_eq!(metrics.sortino, 0.0);
    }

    #[test]
    fn profit_factor_is_wins_over_losses() {
        let records = trades(&[100.0, -50.0, 50.0, -25.0]);
        let metrics = compute_advanced_metrics(&records, 1000.0, 0.0);
        assert!((metrics.profit_factor - (150.0 / 75.0)).abs() < 1e-9);
    }

    #[test]
    fn monte_carlo_respects_simulation_clamp() {
        let records = trades(&[10.0, -5.0, 20.0, -10.0]);
        let result = run_monte_carlo(&records, 1000.0, Some(50), 42);
        assert_eq!(result.num_simulations, 100);
    }

    #[test]
    fn walk_forward_refuses_below_fifty_trades() {
        let records = trades(&[1.0; 10]);
        assert!(run_walk_forward(&records, None, None).is_err());
    }

    #[test]
    fn walk_forward_runs_on_enough_trades() {
        let pnls: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 10.0 } else { -5.0 }).collect();
        let records = trades(&pnls);
        let result = run_walk_forward(&records, None, None).unwrap();
        assert_eq!(result.num_windows, 5);
    }
}
