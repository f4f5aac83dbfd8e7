//! Simulated-trading and backtest endpoints (§4.12-§4.16, C13-C16).
//!
//! Two surfaces share one engine: `/signals/simulation/*` drives the
//! consensus-following auto-trigger loop, `/simulation/*` is the
//! general-purpose portfolio/position/backtest API a manual trader uses.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::backtest::analytics::{
    compute_advanced_metrics, run_monte_carlo, run_walk_forward, AdvancedMetrics,
    MonteCarloResult, TradeRecord, WalkForwardResult,
};
use crate::backtest::{run_backtest, BacktestConfig, BacktestOutput, TradeStatus};
use crate::consensus::{compute_consensus, OpenContribution};
use crate::error::{AppError, AppResult};
use crate::models::{
    AutoTriggerRule, CloseReason, Direction, Portfolio, PositionSource, SimulatedPosition,
    DEFAULT_RULE_ID,
};
use crate::numeric::round4;
use crate::simulation::auto_trigger::{run_auto_trigger_pass, AutoTriggerDecision};
use crate::simulation::store::{
    close_simulated_position, open_simulated_position, precheck_portfolio_risk, OpenRequest,
};
use crate::storage::backtest_run::BacktestRunRecord;

const AUTO_TRIGGER_LOCK_KEY: &str = "auto-trigger:default";

fn portfolio_or_default_id(portfolio_id: Option<String>) -> String {
    portfolio_id.unwrap_or_else(|| "default".to_string())
}

async fn load_portfolio(state: &AppState, id: &str) -> AppResult<Portfolio> {
    state
        .db
        .get_portfolio(id)?
        .ok_or_else(|| AppError::not_found(format!("portfolio {id} not found")))
}

/// Resolves a current reference price for `symbol` from the latest logged
/// event, the only live-price signal this store keeps (§4.13). Manual
/// callers may always override with an explicit price in the request body.
fn resolve_symbol_price(state: &AppState, symbol: &str) -> AppResult<Option<f64>> {
    let events = state.db.events_for_replay(symbol)?;
    let latest_price = events.iter().rev().find_map(|e| e.price.filter(|p| *p > 0.0));
    Ok(crate::simulation::reference_price::resolve_reference_price(&[], latest_price))
}

fn require_price(state: &AppState, symbol: &str, explicit: Option<f64>) -> AppResult<f64> {
    if let Some(price) = explicit.filter(|p| *p > 0.0) {
        return Ok(price);
    }
    resolve_symbol_price(state, symbol)?
        .ok_or_else(|| AppError::InsufficientData(format!("no reference price available for {symbol}")))
}

// ---------------------------------------------------------------------
// /signals/simulation/open, /:id/close, /positions
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OpenPositionRequest {
    #[serde(rename = "portfolioId")]
    pub portfolio_id: Option<String>,
    pub platform: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    pub leverage: f64,
    #[serde(rename = "marginNotional")]
    pub margin_notional: f64,
    #[serde(rename = "entryPrice")]
    pub entry_price: Option<f64>,
    #[serde(rename = "slippageBps")]
    pub slippage_bps: Option<f64>,
    #[serde(rename = "commissionBps")]
    pub commission_bps: Option<f64>,
    #[serde(rename = "stopLossPrice")]
    pub stop_loss_price: Option<f64>,
    #[serde(rename = "takeProfitPrice")]
    pub take_profit_price: Option<f64>,
    #[serde(rename = "trailingStopPct")]
    pub trailing_stop_pct: Option<f64>,
}

pub async fn open_position(
    State(state): State<AppState>,
    Json(req): Json<OpenPositionRequest>,
) -> AppResult<Json<SimulatedPosition>> {
    let portfolio_id = portfolio_or_default_id(req.portfolio_id);
    let lock = state.portfolio_lock(&portfolio_id);
    let _guard = lock.lock().await;

    let portfolio = load_portfolio(&state, &portfolio_id).await?;
    let entry_price = require_price(&state, &req.symbol, req.entry_price)?;

    let open_positions = state.db.open_positions_for_portfolio(&portfolio_id)?;
    let open_margin_total: f64 = open_positions.iter().map(|p| p.margin_notional).sum();
    precheck_portfolio_risk(
        open_margin_total,
        req.margin_notional,
        portfolio.current_balance,
        portfolio.max_portfolio_risk,
        open_positions.len(),
        portfolio.max_open_positions,
    )?;

    let position = open_simulated_position(
        &state.db,
        OpenRequest {
            platform: req.platform.unwrap_or_else(|| "binance".to_string()),
            symbol: req.symbol,
            direction: req.direction,
            leverage: req.leverage,
            margin_notional: req.margin_notional,
            entry_price,
            slippage_bps: req.slippage_bps.unwrap_or(portfolio.default_slippage_bps),
            commission_bps: req.commission_bps.unwrap_or(portfolio.default_commission_bps),
            portfolio_id,
            source: PositionSource::Manual,
            stop_loss_price: req.stop_loss_price,
            take_profit_price: req.take_profit_price,
            trailing_stop_pct: req.trailing_stop_pct,
        },
    )?;
    Ok(Json(position))
}

#[derive(Debug, Deserialize)]
pub struct ClosePositionRequest {
    #[serde(rename = "exitPrice")]
    pub exit_price: Option<f64>,
}

pub async fn close_position(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ClosePositionRequest>,
) -> AppResult<Json<SimulatedPosition>> {
    let existing = state
        .db
        .get_simulated_position(id)?
        .ok_or_else(|| AppError::not_found(format!("simulated position {id} not found")))?;
    let lock = state.portfolio_lock(&existing.portfolio_id);
    let _guard = lock.lock().await;

    let exit_price = require_price(&state, &existing.symbol, req.exit_price)?;
    let closed = close_simulated_position(&state.db, id, exit_price, CloseReason::ManualClose)?;
    Ok(Json(closed))
}

#[derive(Debug, Deserialize)]
pub struct ListPositionsQuery {
    #[serde(rename = "portfolioId")]
    pub portfolio_id: Option<String>,
    pub status: Option<String>,
}

pub async fn list_positions(
    State(state): State<AppState>,
    Query(query): Query<ListPositionsQuery>,
) -> AppResult<Json<Vec<SimulatedPosition>>> {
    let portfolio_id = portfolio_or_default_id(query.portfolio_id);
    let all = state.db.positions_for_portfolio(&portfolio_id)?;
    let filtered = match query.status.as_deref() {
        Some("open") => all.into_iter().filter(|p| p.status == crate::models::SimulatedStatus::Open).collect(),
        Some("closed") => all.into_iter().filter(|p| p.status == crate::models::SimulatedStatus::Closed).collect(),
        _ => all,
    };
    Ok(Json(filtered))
}

// ---------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileDecision {
    Closed {
        position_id: i64,
        symbol: String,
        trigger_trader_id: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    #[serde(rename = "portfolioId")]
    pub portfolio_id: Option<String>,
    #[serde(default)]
    pub commit: bool,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub decisions: Vec<ReconcileDecision>,
    pub committed: bool,
}

/// Closes any open position (manual or auto) in `portfolio_id` against the
/// first matching close event logged after it opened — the same rule the
/// auto-trigger engine applies to its own AUTO positions, generalized here
/// to the whole portfolio (§4.12, §4.14 step 1).
async fn reconcile_portfolio(
    state: &AppState,
    portfolio_id: &str,
    commit: bool,
) -> AppResult<Vec<ReconcileDecision>> {
    let open_positions = state.db.open_positions_for_portfolio(portfolio_id)?;
    let mut decisions = Vec::new();
    for position in open_positions {
        let events = state.db.events_for_replay(&position.symbol)?;
        let matching = events.into_iter().find(|event| {
            event.kind.direction() == position.direction
                && !event.kind.is_open()
                && event.event_time.unwrap_or(event.fetched_at) > position.opened_at
        });
        if let Some(event) = matching {
            if commit {
                let exit_price = event.price.filter(|p| *p > 0.0).unwrap_or(position.entry_price);
                close_simulated_position(&state.db, position.id, exit_price, CloseReason::FirstTraderClose)?;
                state.db.set_close_trigger(position.id, &event.trader_id, event.kind)?;
            }
            decisions.push(ReconcileDecision::Closed {
                position_id: position.id,
                symbol: position.symbol,
                trigger_trader_id: event.trader_id,
            });
        }
    }
    Ok(decisions)
}

pub async fn get_reconcile(
    State(state): State<AppState>,
    Query(query): Query<ReconcileQuery>,
) -> AppResult<Json<ReconcileResponse>> {
    let portfolio_id = portfolio_or_default_id(query.portfolio_id);
    let decisions = reconcile_portfolio(&state, &portfolio_id, false).await?;
    Ok(Json(ReconcileResponse { decisions, committed: false }))
}

pub async fn post_reconcile(
    State(state): State<AppState>,
    Query(query): Query<ReconcileQuery>,
) -> AppResult<Json<ReconcileResponse>> {
    let portfolio_id = portfolio_or_default_id(query.portfolio_id);
    let lock = state.portfolio_lock(&portfolio_id);
    let _guard = lock.lock().await;
    let decisions = reconcile_portfolio(&state, &portfolio_id, true).await?;
    Ok(Json(ReconcileResponse { decisions, committed: true }))
}

// ---------------------------------------------------------------------
// report
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PortfolioReport {
    pub portfolio: Portfolio,
    pub open_positions: usize,
    pub closed_positions: usize,
    pub total_pnl: f64,
    pub win_rate_pct: f64,
    pub roi_pct: f64,
}

fn build_report(portfolio: Portfolio, positions: &[SimulatedPosition]) -> PortfolioReport {
    let (open, closed): (Vec<_>, Vec<_>) = positions
        .iter()
        .partition(|p| p.status == crate::models::SimulatedStatus::Open);
    let total_pnl: f64 = closed.iter().filter_map(|p| p.pnl_usdt).sum();
    let wins = closed.iter().filter(|p| p.pnl_usdt.unwrap_or(0.0) > 0.0).count();
    let win_rate_pct = if closed.is_empty() {
        0.0
    } else {
        wins as f64 / closed.len() as f64 * 100.0
    };
    let roi_pct = if portfolio.initial_balance > 0.0 {
        (portfolio.current_balance - portfolio.initial_balance) / portfolio.initial_balance * 100.0
    } else {
        0.0
    };
    PortfolioReport {
        open_positions: open.len(),
        closed_positions: closed.len(),
        total_pnl: round4(total_pnl),
        win_rate_pct: round4(win_rate_pct),
        roi_pct: round4(roi_pct),
        portfolio,
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    #[serde(rename = "portfolioId")]
    pub portfolio_id: Option<String>,
}

pub async fn report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> AppResult<Json<PortfolioReport>> {
    let portfolio_id = portfolio_or_default_id(query.portfolio_id);
    let portfolio = load_portfolio(&state, &portfolio_id).await?;
    let positions = state.db.positions_for_portfolio(&portfolio_id)?;
    Ok(Json(build_report(portfolio, &positions)))
}

// ---------------------------------------------------------------------
// auto-trigger rule + auto-run
// ---------------------------------------------------------------------

pub async fn get_auto_rule(State(state): State<AppState>) -> AppResult<Json<AutoTriggerRule>> {
    let rule = state
        .db
        .get_auto_trigger_rule(DEFAULT_RULE_ID)?
        .unwrap_or_else(|| AutoTriggerRule::default_rule("default"));
    Ok(Json(rule))
}

pub async fn put_auto_rule(
    State(state): State<AppState>,
    Json(rule): Json<AutoTriggerRule>,
) -> AppResult<Json<AutoTriggerRule>> {
    let lock = state.rule_lock(AUTO_TRIGGER_LOCK_KEY);
    let _guard = lock.lock().await;
    state.db.upsert_auto_trigger_rule(&rule)?;
    Ok(Json(rule))
}

#[derive(Debug, Deserialize)]
pub struct AutoRunQuery {
    #[serde(rename = "dryRun", default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct AutoRunResponse {
    pub decisions: Vec<AutoTriggerDecision>,
    pub committed: bool,
}

/// Builds one `ConsensusResult` per symbol with any currently-open trader
/// position, from the symbol's reconstructed `PositionState` rows weighted
/// by each contributor's `trader_weight` (§4.9, §4.14).
fn build_consensus_snapshot(state: &AppState) -> AppResult<Vec<crate::consensus::ConsensusResult>> {
    let scores = state.db.list_trader_scores()?;
    let weights: HashMap<String, f64> = scores.iter().map(|s| (s.trader_id.clone(), s.trader_weight)).collect();
    let positions = state.db.all_active_positions()?;

    let mut by_symbol: HashMap<String, Vec<OpenContribution>> = HashMap::new();
    for position in &positions {
        by_symbol.entry(position.symbol.clone()).or_default().push(OpenContribution {
            direction: position.direction,
            weight: weights.get(&position.trader_id).copied().unwrap_or(1.0),
        });
    }

    Ok(by_symbol
        .into_iter()
        .map(|(symbol, contributions)| compute_consensus(&symbol, &contributions))
        .collect())
}

pub async fn auto_run(
    State(state): State<AppState>,
    Query(query): Query<AutoRunQuery>,
) -> AppResult<Json<AutoRunResponse>> {
    let rule = state
        .db
        .get_auto_trigger_rule(DEFAULT_RULE_ID)?
        .ok_or_else(|| AppError::not_found("auto-trigger rule not configured"))?;

    let lock = state.rule_lock(AUTO_TRIGGER_LOCK_KEY);
    let _guard = lock.lock().await;

    let consensus = build_consensus_snapshot(&state)?;
    let mut reference_prices = HashMap::new();
    for result in &consensus {
        if let Some(price) = resolve_symbol_price(&state, &result.symbol)? {
            reference_prices.insert(result.symbol.clone(), price);
        }
    }

    let commit = !query.dry_run;
    let decisions =
        run_auto_trigger_pass(&state.db, &rule, &consensus, &reference_prices, Utc::now(), commit)?;
    Ok(Json(AutoRunResponse { decisions, committed: commit }))
}

// ---------------------------------------------------------------------
// backtest-lite
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BacktestLiteQuery {
    pub symbol: Option<String>,
    pub leverage: Option<f64>,
    #[serde(rename = "marginNotional")]
    pub margin_notional: Option<f64>,
    #[serde(rename = "slippageBps")]
    pub slippage_bps: Option<f64>,
    #[serde(rename = "commissionBps")]
    pub commission_bps: Option<f64>,
    #[serde(rename = "minTraders")]
    pub min_traders: Option<usize>,
    #[serde(rename = "minConfidence")]
    pub min_confidence: Option<f64>,
    #[serde(rename = "minSentimentAbs")]
    pub min_sentiment_abs: Option<f64>,
    #[serde(rename = "advancedMetrics", default)]
    pub advanced_metrics: bool,
    #[serde(rename = "monteCarlo", default)]
    pub monte_carlo: bool,
    #[serde(rename = "walkForward", default)]
    pub walk_forward: bool,
    #[serde(rename = "numSimulations")]
    pub num_simulations: Option<usize>,
    #[serde(default)]
    pub persist: bool,
}

#[derive(Debug, Serialize)]
pub struct BacktestLiteResponse {
    #[serde(flatten)]
    pub output: BacktestOutput,
    pub advanced_metrics: Option<AdvancedMetrics>,
    pub monte_carlo: Option<MonteCarloResult>,
    pub walk_forward: Option<WalkForwardResult>,
    pub run_id: Option<String>,
}

pub async fn backtest_lite(
    State(state): State<AppState>,
    Query(query): Query<BacktestLiteQuery>,
) -> AppResult<Json<BacktestLiteResponse>> {
    let symbols = match &query.symbol {
        Some(symbol) => vec![symbol.clone()],
        None => state.db.distinct_symbols()?,
    };

    let mut events = Vec::new();
    for symbol in &symbols {
        events.extend(state.db.events_for_replay(symbol)?);
    }

    let scores = state.db.list_trader_scores()?;
    let trader_weights: HashMap<String, f64> =
        scores.iter().map(|s| (s.trader_id.clone(), s.trader_weight)).collect();

    let config = BacktestConfig {
        leverage: query.leverage.unwrap_or(10.0),
        margin_notional: query.margin_notional.unwrap_or(100.0),
        slippage_bps: query.slippage_bps.unwrap_or(5.0),
        commission_bps: query.commission_bps.unwrap_or(4.0),
        min_traders: query.min_traders.unwrap_or(3),
        min_confidence: query.min_confidence.unwrap_or(60.0),
        min_sentiment_abs: query.min_sentiment_abs.unwrap_or(40.0),
    };

    let output = run_backtest(&events, &trader_weights, &config);

    let closed_trades: Vec<TradeRecord> = output
        .trades
        .iter()
        .filter(|t| t.status == TradeStatus::Closed)
        .map(|t| TradeRecord {
            pnl: t.pnl_usdt.unwrap_or(0.0),
            timestamp: t.exit_time.unwrap_or(t.entry_time),
        })
        .collect();

    let advanced_metrics = if query.advanced_metrics && !closed_trades.is_empty() {
        Some(compute_advanced_metrics(&closed_trades, config.margin_notional, 0.0))
    } else {
        None
    };

    let monte_carlo = if query.monte_carlo && !closed_trades.is_empty() {
        Some(run_monte_carlo(&closed_trades, config.margin_notional, query.num_simulations, 42))
    } else {
        None
    };

    let walk_forward = if query.walk_forward {
        run_walk_forward(&closed_trades, None, None).ok()
    } else {
        None
    };

    let run_id = if query.persist && advanced_metrics.is_some() {
        let id = Uuid::new_v4().to_string();
        let config_json = serde_json::json!({
            "symbol": query.symbol,
            "leverage": config.leverage,
            "marginNotional": config.margin_notional,
            "slippageBps": config.slippage_bps,
            "commissionBps": config.commission_bps,
            "minTraders": config.min_traders,
            "minConfidence": config.min_confidence,
            "minSentimentAbs": config.min_sentiment_abs,
        });
        let result_json = serde_json::to_value(&output).map_err(anyhow::Error::from)?;
        state.db.insert_backtest_run(&BacktestRunRecord {
            id: id.clone(),
            created_at: Utc::now(),
            config: config_json,
            result: result_json,
        })?;
        Some(id)
    } else {
        None
    };

    Ok(Json(BacktestLiteResponse {
        output,
        advanced_metrics,
        monte_carlo,
        walk_forward,
        run_id,
    }))
}

// ---------------------------------------------------------------------
// /simulation/portfolios
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreatePortfolioRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "initialBalance")]
    pub initial_balance: f64,
    #[serde(rename = "kellyFraction")]
    pub kelly_fraction: Option<f64>,
    #[serde(rename = "minSampleSize")]
    pub min_sample_size: Option<usize>,
    #[serde(rename = "maxRiskPerTrade")]
    pub max_risk_per_trade: Option<f64>,
    #[serde(rename = "maxPortfolioRisk")]
    pub max_portfolio_risk: Option<f64>,
    #[serde(rename = "maxOpenPositions")]
    pub max_open_positions: Option<usize>,
}

pub async fn create_portfolio(
    State(state): State<AppState>,
    Json(req): Json<CreatePortfolioRequest>,
) -> AppResult<Json<Portfolio>> {
    let id = req.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let lock = state.portfolio_lock(&id);
    let _guard = lock.lock().await;

    let mut portfolio = Portfolio::default_with_id(id, req.initial_balance);
    if let Some(name) = req.name {
        portfolio.name = name;
    }
    if let Some(v) = req.kelly_fraction {
        portfolio.kelly_fraction = v;
    }
    if let Some(v) = req.min_sample_size {
        portfolio.min_sample_size = v;
    }
    if let Some(v) = req.max_risk_per_trade {
        portfolio.max_risk_per_trade = v;
    }
    if let Some(v) = req.max_portfolio_risk {
        portfolio.max_portfolio_risk = v;
    }
    if let Some(v) = req.max_open_positions {
        portfolio.max_open_positions = v;
    }
    state.db.upsert_portfolio(&portfolio)?;
    Ok(Json(portfolio))
}

pub async fn list_portfolios(State(state): State<AppState>) -> AppResult<Json<Vec<Portfolio>>> {
    Ok(Json(state.db.list_portfolios()?))
}

pub async fn get_portfolio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Portfolio>> {
    Ok(Json(load_portfolio(&state, &id).await?))
}

pub async fn portfolio_performance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PortfolioReport>> {
    let portfolio = load_portfolio(&state, &id).await?;
    let positions = state.db.positions_for_portfolio(&id)?;
    Ok(Json(build_report(portfolio, &positions)))
}

// ---------------------------------------------------------------------
// /simulation/positions/calculate-size, /open, /:id/risk, /monitor
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskModel {
    Fixed,
    RiskBased,
    Kelly,
}

#[derive(Debug, Deserialize)]
pub struct CalculateSizeRequest {
    #[serde(rename = "portfolioId")]
    pub portfolio_id: Option<String>,
    #[serde(rename = "riskModel")]
    pub risk_model: RiskModel,
    #[serde(rename = "entryPrice")]
    pub entry_price: f64,
    #[serde(rename = "stopLossPrice")]
    pub stop_loss_price: Option<f64>,
    pub leverage: f64,
    #[serde(rename = "winRate")]
    pub win_rate: Option<f64>,
    #[serde(rename = "avgWin")]
    pub avg_win: Option<f64>,
    #[serde(rename = "avgLoss")]
    pub avg_loss: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct CalculateSizeResponse {
    #[serde(rename = "marginNotional")]
    pub margin_notional: f64,
    #[serde(rename = "positionNotional")]
    pub position_notional: f64,
    #[serde(rename = "riskModel")]
    pub risk_model: String,
}

/// Position sizing per risk model (§4.12, "Risk-managed position sizing").
/// `RiskBased` sizes to a fixed dollar risk given a stop distance; `Kelly`
/// applies the classic `f* = p - q/b` formula scaled by the portfolio's
/// fractional-Kelly setting. Both clamp to the portfolio's per-trade cap.
fn calculate_margin_notional(portfolio: &Portfolio, req: &CalculateSizeRequest) -> AppResult<f64> {
    let risk_budget = portfolio.current_balance * portfolio.max_risk_per_trade;
    let margin = match req.risk_model {
        RiskModel::Fixed => risk_budget,
        RiskModel::RiskBased => {
            let stop = req
                .stop_loss_price
                .ok_or_else(|| AppError::validation("stopLossPrice required for RISK_BASED sizing"))?;
            let stop_distance_pct = (req.entry_price - stop).abs() / req.entry_price;
            if stop_distance_pct <= f64::EPSILON {
                return Err(AppError::validation("stopLossPrice must differ from entryPrice"));
            }
            risk_budget / (stop_distance_pct * req.leverage)
        }
        RiskModel::Kelly => {
            let win_rate = req
                .win_rate
                .ok_or_else(|| AppError::validation("winRate required for KELLY sizing"))?;
            let avg_win = req
                .avg_win
                .ok_or_else(|| AppError::validation("avgWin required for KELLY sizing"))?;
            let avg_loss = req
                .avg_loss
                .ok_or_else(|| AppError::validation("avgLoss required for KELLY sizing"))?;
            if avg_loss <= f64::EPSILON {
                return Err(AppError::validation("avgLoss must be > 0 for KELLY sizing"));
            }
            let payoff_ratio = avg_win / avg_loss;
            let kelly_fraction = win_rate - (1.0 - win_rate) / payoff_ratio;
            let scaled = (kelly_fraction * portfolio.kelly_fraction).max(0.0);
            portfolio.current_balance * scaled
        }
    };
    Ok(round4(margin.min(risk_budget).max(0.0)))
}

pub async fn calculate_size(
    State(state): State<AppState>,
    Json(req): Json<CalculateSizeRequest>,
) -> AppResult<Json<CalculateSizeResponse>> {
    let portfolio_id = portfolio_or_default_id(req.portfolio_id.clone());
    let portfolio = load_portfolio(&state, &portfolio_id).await?;
    let margin_notional = calculate_margin_notional(&portfolio, &req)?;
    let risk_model = match req.risk_model {
        RiskModel::Fixed => "FIXED",
        RiskModel::RiskBased => "RISK_BASED",
        RiskModel::Kelly => "KELLY",
    };
    Ok(Json(CalculateSizeResponse {
        margin_notional,
        position_notional: round4(margin_notional * req.leverage),
        risk_model: risk_model.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct OpenRiskManagedRequest {
    #[serde(rename = "portfolioId")]
    pub portfolio_id: Option<String>,
    pub platform: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    pub leverage: f64,
    #[serde(rename = "entryPrice")]
    pub entry_price: Option<f64>,
    #[serde(rename = "riskModel")]
    pub risk_model: RiskModel,
    #[serde(rename = "stopLossPrice")]
    pub stop_loss_price: Option<f64>,
    #[serde(rename = "takeProfitPrice")]
    pub take_profit_price: Option<f64>,
    #[serde(rename = "trailingStopPct")]
    pub trailing_stop_pct: Option<f64>,
    #[serde(rename = "winRate")]
    pub win_rate: Option<f64>,
    #[serde(rename = "avgWin")]
    pub avg_win: Option<f64>,
    #[serde(rename = "avgLoss")]
    pub avg_loss: Option<f64>,
    #[serde(rename = "slippageBps")]
    pub slippage_bps: Option<f64>,
    #[serde(rename = "commissionBps")]
    pub commission_bps: Option<f64>,
}

pub async fn open_position_risk_managed(
    State(state): State<AppState>,
    Json(req): Json<OpenRiskManagedRequest>,
) -> AppResult<Json<SimulatedPosition>> {
    let portfolio_id = portfolio_or_default_id(req.portfolio_id.clone());
    let lock = state.portfolio_lock(&portfolio_id);
    let _guard = lock.lock().await;

    let portfolio = load_portfolio(&state, &portfolio_id).await?;
    let entry_price = require_price(&state, &req.symbol, req.entry_price)?;

    let margin_notional = calculate_margin_notional(
        &portfolio,
        &CalculateSizeRequest {
            portfolio_id: Some(portfolio_id.clone()),
            risk_model: req.risk_model,
            entry_price,
            stop_loss_price: req.stop_loss_price,
            leverage: req.leverage,
            win_rate: req.win_rate,
            avg_win: req.avg_win,
            avg_loss: req.avg_loss,
        },
    )?;
    if margin_notional <= 0.0 {
        return Err(AppError::validation("computed margin notional must be > 0"));
    }

    let open_positions = state.db.open_positions_for_portfolio(&portfolio_id)?;
    let open_margin_total: f64 = open_positions.iter().map(|p| p.margin_notional).sum();
    precheck_portfolio_risk(
        open_margin_total,
        margin_notional,
        portfolio.current_balance,
        portfolio.max_portfolio_risk,
        open_positions.len(),
        portfolio.max_open_positions,
    )?;

    let position = open_simulated_position(
        &state.db,
        OpenRequest {
            platform: req.platform.unwrap_or_else(|| "binance".to_string()),
            symbol: req.symbol,
            direction: req.direction,
            leverage: req.leverage,
            margin_notional,
            entry_price,
            slippage_bps: req.slippage_bps.unwrap_or(portfolio.default_slippage_bps),
            commission_bps: req.commission_bps.unwrap_or(portfolio.default_commission_bps),
            portfolio_id,
            source: PositionSource::Manual,
            stop_loss_price: req.stop_loss_price,
            take_profit_price: req.take_profit_price,
            trailing_stop_pct: req.trailing_stop_pct,
        },
    )?;
    Ok(Json(position))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRiskRequest {
    #[serde(rename = "stopLossPrice")]
    pub stop_loss_price: Option<f64>,
    #[serde(rename = "takeProfitPrice")]
    pub take_profit_price: Option<f64>,
    #[serde(rename = "trailingStopPct")]
    pub trailing_stop_pct: Option<f64>,
}

pub async fn update_position_risk(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRiskRequest>,
) -> AppResult<Json<SimulatedPosition>> {
    let existing = state
        .db
        .get_simulated_position(id)?
        .ok_or_else(|| AppError::not_found(format!("simulated position {id} not found")))?;
    let lock = state.portfolio_lock(&existing.portfolio_id);
    let _guard = lock.lock().await;

    state.db.update_position_risk_params(
        id,
        req.stop_loss_price.or(existing.stop_loss_price),
        req.take_profit_price.or(existing.take_profit_price),
        req.trailing_stop_pct.or(existing.trailing_stop_pct),
    )?;
    let updated = state
        .db
        .get_simulated_position(id)?
        .ok_or_else(|| anyhow::anyhow!("simulated position {id} vanished after risk update"))?;
    Ok(Json(updated))
}

#[derive(Debug, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum MonitorAction {
    StopLoss { position_id: i64, price: f64 },
    TakeProfit { position_id: i64, price: f64 },
    TrailingStop { position_id: i64, price: f64 },
}

#[derive(Debug, Serialize)]
pub struct MonitorResponse {
    pub actions: Vec<MonitorAction>,
}

/// Checks every open simulated position against its stop-loss, take-profit,
/// and trailing-stop thresholds and closes any that have triggered (§4.12).
/// The trailing stop retraces from `peak_favorable_price`, which this pass
/// also advances before testing the retracement.
pub async fn monitor_positions(State(state): State<AppState>) -> AppResult<Json<MonitorResponse>> {
    let open_positions = state.db.all_open_simulated_positions()?;
    let mut prices: HashMap<String, f64> = HashMap::new();
    let mut actions = Vec::new();

    for position in open_positions {
        let price = match prices.get(&position.symbol) {
            Some(p) => *p,
            None => match resolve_symbol_price(&state, &position.symbol)? {
                Some(p) => {
                    prices.insert(position.symbol.clone(), p);
                    p
                }
                None => continue,
            },
        };

        let lock = state.portfolio_lock(&position.portfolio_id);
        let _guard = lock.lock().await;

        if let Some(stop) = position.stop_loss_price {
            let triggered = match position.direction {
                Direction::Long => price <= stop,
                Direction::Short => price >= stop,
            };
            if triggered {
                close_simulated_position(&state.db, position.id, price, CloseReason::StopLoss)?;
                actions.push(MonitorAction::StopLoss { position_id: position.id, price });
                continue;
            }
        }

        if let Some(take_profit) = position.take_profit_price {
            let triggered = match position.direction {
                Direction::Long => price >= take_profit,
                Direction::Short => price <= take_profit,
            };
            if triggered {
                close_simulated_position(&state.db, position.id, price, CloseReason::TakeProfit)?;
                actions.push(MonitorAction::TakeProfit { position_id: position.id, price });
                continue;
            }
        }

        if let Some(trailing_pct) = position.trailing_stop_pct {
            state.db.update_peak_favorable_price(position.id, price)?;
            let peak = match position.direction {
                Direction::Long => price.max(position.peak_favorable_price.unwrap_or(price)),
                Direction::Short => price.min(position.peak_favorable_price.unwrap_or(price)),
            };
            let retracement_pct = match position.direction {
                Direction::Long => (peak - price) / peak * 100.0,
                Direction::Short => (price - peak) / peak * 100.0,
            };
            if peak > 0.0 && retracement_pct >= trailing_pct {
                close_simulated_position(&state.db, position.id, price, CloseReason::TrailingStop)?;
                actions.push(MonitorAction::TrailingStop { position_id: position.id, price });
            }
        }
    }

    Ok(Json(MonitorResponse { actions }))
}

// ---------------------------------------------------------------------
// /simulation/backtests
// ---------------------------------------------------------------------

pub async fn list_backtests(State(state): State<AppState>) -> AppResult<Json<Vec<BacktestRunSummary>>> {
    let runs = state.db.list_backtest_runs()?;
    Ok(Json(runs.into_iter().map(BacktestRunSummary::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct BacktestRunSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub config: serde_json::Value,
}

impl From<BacktestRunRecord> for BacktestRunSummary {
    fn from(record: BacktestRunRecord) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
            config: record.config,
        }
    }
}

pub async fn get_backtest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<BacktestRunRecord>> {
    let run = state
        .db
        .get_backtest_run(&id)?
        .ok_or_else(|| AppError::not_found(format!("backtest run {id} not found")))?;
    Ok(Json(run))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

pub async fn delete_backtest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DeleteResponse>> {
    state.db.delete_backtest_run(&id)?;
    Ok(Json(DeleteResponse { deleted: true }))
}
