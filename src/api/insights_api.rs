//! Insights engine endpoints (§4.11, §6).

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::api::signals_api::parse_time_range;
use crate::api::state::AppState;
use crate::error::AppResult;
use crate::insights::{
    build_leaderboard, compute_risk_overview, compute_stability, detect_anomalies,
    merge_anomalies, InsightsBundle, LeaderboardInput, RiskOverview, SymbolSnapshot,
};
use crate::models::{Direction, InsightsMode, InsightsRule, Segment, INSIGHTS_RULE_ID};
use crate::consensus::{compute_consensus, OpenContribution};

fn parse_mode(raw: &str) -> InsightsMode {
    match raw {
        "conservative" => InsightsMode::Conservative,
        "aggressive" => InsightsMode::Aggressive,
        _ => InsightsMode::Balanced,
    }
}

#[derive(Debug, Deserialize)]
pub struct InsightsQuery {
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
    pub segment: Option<String>,
    pub top: Option<usize>,
    pub mode: Option<String>,
}

fn load_rule(state: &AppState) -> AppResult<InsightsRule> {
    Ok(state
        .db
        .get_insights_rule(INSIGHTS_RULE_ID)?
        .unwrap_or_else(InsightsRule::default_rule))
}

pub async fn get_insights(
    State(state): State<AppState>,
    Query(query): Query<InsightsQuery>,
) -> AppResult<Json<InsightsBundle>> {
    let top = query.top.unwrap_or(10).clamp(3, 50);
    let mode = query.mode.as_deref().map(parse_mode);
    let rule = load_rule(&state)?;
    let mode = mode.unwrap_or(rule.default_mode);
    let preset = rule.preset(mode);

    let now = Utc::now();
    let scores = state.db.list_trader_scores()?;
    let score_map: HashMap<String, &crate::models::TraderScore> =
        scores.iter().map(|s| (s.trader_id.clone(), s)).collect();
    let mut positions = state.db.all_active_positions()?;
    let time_range = query.time_range.as_deref().map(parse_time_range).unwrap_or_default();
    if let Some(ms) = time_range.millis() {
        let cutoff = now - chrono::Duration::milliseconds(ms);
        positions.retain(|p| p.estimated_open_time >= cutoff || p.last_seen_at >= cutoff);
    }

    let mut by_symbol: HashMap<String, Vec<&crate::models::PositionState>> = HashMap::new();
    for position in &positions {
        by_symbol.entry(position.symbol.clone()).or_default().push(position);
    }

    let mut anomalies = Vec::new();
    let mut stability_map = HashMap::new();

    for (symbol, symbol_positions) in &by_symbol {
        let contributions: Vec<OpenContribution> = symbol_positions
            .iter()
            .map(|p| OpenContribution {
                direction: p.direction,
                weight: score_map.get(&p.trader_id).map(|s| s.trader_weight).unwrap_or(1.0),
            })
            .collect();
        let consensus = compute_consensus(symbol, &contributions);

        let avg_leverage = {
            let levs: Vec<f64> = symbol_positions.iter().filter_map(|p| p.leverage).collect();
            if levs.is_empty() {
                0.0
            } else {
                levs.iter().sum::<f64>() / levs.len() as f64
            }
        };

        let events = state.db.events_feed(Some(symbol), None, 200)?;
        let mut ordered: Vec<_> = events.iter().collect();
        ordered.sort_by_key(|e| e.event_time.unwrap_or(e.fetched_at));
        let directions: Vec<Direction> = ordered
            .iter()
            .filter(|e| e.kind.is_open())
            .map(|e| e.kind.direction())
            .collect();
        let stability = compute_stability(&directions);
        stability_map.insert(symbol.clone(), stability);

        let snapshot = SymbolSnapshot {
            symbol: symbol.clone(),
            total_traders: consensus.total_traders,
            confidence_score: consensus.confidence_score as f64,
            sentiment_score: consensus.sentiment_score,
            avg_leverage,
            flip_count: stability.flips,
        };
        anomalies.extend(detect_anomalies(&snapshot, &preset));
    }

    let anomalies = merge_anomalies(anomalies);

    let crowded = anomalies.iter().filter(|a| matches!(a.anomaly_type, crate::insights::AnomalyType::CrowdedConsensus)).count() as u32;
    let high_leverage = anomalies.iter().filter(|a| matches!(a.anomaly_type, crate::insights::AnomalyType::HighLeverage | crate::insights::AnomalyType::ExtremeLeverage)).count() as u32;
    let unstable = anomalies.iter().filter(|a| matches!(a.anomaly_type, crate::insights::AnomalyType::UnstableDirection | crate::insights::AnomalyType::DirectionFlipCluster)).count() as u32;
    let low_confidence = anomalies.iter().filter(|a| matches!(a.anomaly_type, crate::insights::AnomalyType::FragileConsensus)).count() as u32;
    let high_anomalies = anomalies.len() as u32;

    let risk_overview: RiskOverview = compute_risk_overview(
        crowded,
        high_leverage,
        unstable,
        low_confidence,
        high_anomalies,
        preset.score_multiplier,
    );

    let segment_filter = query.segment.as_deref();
    let leaderboard_inputs: Vec<LeaderboardInput> = scores
        .iter()
        .filter(|s| match segment_filter {
            Some("visible") => s.segment == Segment::Visible,
            Some("hidden") => s.segment == Segment::Hidden,
            _ => true,
        })
        .map(|s| {
            let own_positions: Vec<&crate::models::PositionState> = positions
                .iter()
                .filter(|p| p.trader_id == s.trader_id)
                .collect();
            let avg_leverage = if own_positions.is_empty() {
                0.0
            } else {
                own_positions.iter().filter_map(|p| p.leverage).sum::<f64>()
                    / own_positions.len() as f64
            };
            LeaderboardInput {
                trader_id: s.trader_id.clone(),
                trader_weight: s.trader_weight,
                quality_norm: (s.quality_score / 100.0).clamp(0.0, 1.0),
                win_rate_norm: s.win_rate.unwrap_or(0.0).clamp(0.0, 1.0),
                activity_norm: (s.sample_size as f64 / 50.0).min(1.0),
                avg_leverage,
            }
        })
        .collect();
    let leaderboard = build_leaderboard(&leaderboard_inputs, top);

    Ok(Json(InsightsBundle {
        generated_at: now,
        risk_overview,
        anomalies,
        stability: stability_map,
        leaderboard,
    }))
}

pub async fn get_insights_rule(State(state): State<AppState>) -> AppResult<Json<InsightsRule>> {
    Ok(Json(load_rule(&state)?))
}

pub async fn put_insights_rule(
    State(state): State<AppState>,
    Json(rule): Json<InsightsRule>,
) -> AppResult<Json<InsightsRule>> {
    let lock = state.rule_lock("insights:default");
    let _guard = lock.lock().await;
    state.db.upsert_insights_rule(&rule)?;
    Ok(Json(rule))
}
