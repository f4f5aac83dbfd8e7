//! Heatmap, symbol, feed, and diagnostic read endpoints (§4.9-§4.10, §6).

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::state::AppState;
use crate::consensus::heatmap::{
    classify_momentum, compute_pnl_percent, compute_roe, entry_price_spread,
    hold_duration_seconds, parse_recently_opened, segment_matches, sizing_fraction,
    LeverageBucket, Momentum, SegmentQueryFilter, TimeRange,
};
use crate::consensus::{compute_consensus, sort_for_listing, ConsensusResult, OpenContribution};
use crate::error::{AppError, AppResult};
use crate::models::{Direction, PositionState, Segment, TraderScore};
use crate::storage::raw_ingest::RawIngestRecord;

fn trader_lookup(scores: &[TraderScore]) -> HashMap<String, &TraderScore> {
    scores.iter().map(|s| (s.trader_id.clone(), s)).collect()
}

struct Filters {
    time_range: TimeRange,
    side: Option<Direction>,
    leverage: LeverageBucket,
    min_traders: usize,
    segment: SegmentQueryFilter,
    recently_opened: Option<chrono::Duration>,
}

fn parse_direction(raw: &str) -> Option<Direction> {
    match raw.to_ascii_lowercase().as_str() {
        "long" => Some(Direction::Long),
        "short" => Some(Direction::Short),
        _ => None,
    }
}

pub(crate) fn parse_time_range(raw: &str) -> TimeRange {
    match raw {
        "1h" => TimeRange::H1,
        "4h" => TimeRange::H4,
        "7d" => TimeRange::D7,
        "all" => TimeRange::All,
        _ => TimeRange::H24,
    }
}

fn parse_leverage_bucket(raw: &str) -> LeverageBucket {
    match raw {
        "under20" => LeverageBucket::Under20,
        "20to50" => LeverageBucket::Between20And50,
        "50to100" => LeverageBucket::Between50And100,
        "over100" => LeverageBucket::Over100,
        _ => LeverageBucket::All,
    }
}

fn parse_segment_filter(raw: &str) -> SegmentQueryFilter {
    match raw {
        "visible" => SegmentQueryFilter::VisibleOnly,
        "hidden" => SegmentQueryFilter::HiddenOnly,
        _ => SegmentQueryFilter::Both,
    }
}

/// Filters one symbol's active positions into consensus contributions,
/// applying every heatmap-level filter except `min_traders` (applied by
/// the caller against the computed result, §4.10).
fn contributions_for_symbol(
    positions: &[PositionState],
    scores: &HashMap<String, &TraderScore>,
    filters: &Filters,
    now: chrono::DateTime<Utc>,
) -> (Vec<OpenContribution>, Vec<f64>) {
    let mut contributions = Vec::new();
    let mut entry_prices = Vec::new();
    let time_range_cutoff = filters
        .time_range
        .millis()
        .map(|ms| now - chrono::Duration::milliseconds(ms));

    for position in positions {
        if let Some(cutoff) = time_range_cutoff {
            if position.estimated_open_time < cutoff && position.last_seen_at < cutoff {
                continue;
            }
        }
        if let Some(side) = filters.side {
            if position.direction != side {
                continue;
            }
        }
        if !filters.leverage.contains(position.leverage.unwrap_or(0.0)) {
            continue;
        }
        if let Some(window) = filters.recently_opened {
            if now.signed_duration_since(position.estimated_open_time) > window {
                continue;
            }
        }
        let score = scores.get(&position.trader_id);
        let segment = score.map(|s| s.segment).unwrap_or(Segment::Unknown);
        if !segment_matches(filters.segment, segment) {
            continue;
        }

        let weight = score.map(|s| s.trader_weight).unwrap_or(1.0);
        contributions.push(OpenContribution {
            direction: position.direction,
            weight,
        });
        entry_prices.push(position.entry_price);
    }

    (contributions, entry_prices)
}

#[derive(Debug, Deserialize)]
pub struct HeatmapQuery {
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
    pub side: Option<String>,
    pub leverage: Option<String>,
    #[serde(rename = "minTraders")]
    pub min_traders: Option<usize>,
    pub segment: Option<String>,
    #[serde(rename = "recentlyOpened")]
    pub recently_opened: Option<String>,
}

impl HeatmapQuery {
    fn into_filters(self) -> Filters {
        Filters {
            time_range: self.time_range.as_deref().map(parse_time_range).unwrap_or_default(),
            side: self.side.as_deref().and_then(parse_direction),
            leverage: self.leverage.as_deref().map(parse_leverage_bucket).unwrap_or(LeverageBucket::All),
            min_traders: self.min_traders.unwrap_or(0),
            segment: self.segment.as_deref().map(parse_segment_filter).unwrap_or(SegmentQueryFilter::Both),
            recently_opened: self.recently_opened.as_deref().and_then(parse_recently_opened),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeatmapEntry {
    #[serde(flatten)]
    pub consensus: ConsensusResult,
    pub entry_price_spread: f64,
    pub momentum: Momentum,
    pub sizing_fraction: f64,
}

fn momentum_for_symbol(
    state: &AppState,
    symbol: &str,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<Momentum> {
    let events = state.db.events_feed(Some(symbol), Some(now - chrono::Duration::hours(4)), 500)?;
    let mut opens_last_1h = 0u32;
    let mut opens_prior = 0u32;
    for event in &events {
        if !event.kind.is_open() {
            continue;
        }
        let at = event.event_time.unwrap_or(event.fetched_at);
        let age = now.signed_duration_since(at);
        if age <= chrono::Duration::hours(1) {
            opens_last_1h += 1;
        } else if age <= chrono::Duration::hours(4) {
            opens_prior += 1;
        }
    }
    Ok(classify_momentum(opens_last_1h, opens_prior))
}

pub async fn heatmap(
    State(state): State<AppState>,
    Query(query): Query<HeatmapQuery>,
) -> AppResult<Json<Vec<HeatmapEntry>>> {
    let filters = query.into_filters();
    let now = Utc::now();

    let scores = state.db.list_trader_scores()?;
    let score_map = trader_lookup(&scores);
    let all_positions = state.db.all_active_positions()?;

    let mut by_symbol: HashMap<String, Vec<PositionState>> = HashMap::new();
    for position in all_positions {
        by_symbol.entry(position.symbol.clone()).or_default().push(position);
    }

    let mut entries = Vec::new();
    for (symbol, positions) in by_symbol {
        let (contributions, entry_prices) =
            contributions_for_symbol(&positions, &score_map, &filters, now);
        if contributions.is_empty() {
            continue;
        }
        let consensus = compute_consensus(&symbol, &contributions);
        if consensus.total_traders < filters.min_traders {
            continue;
        }
        let momentum = momentum_for_symbol(&state, &symbol, now)?;
        entries.push(HeatmapEntry {
            entry_price_spread: entry_price_spread(&entry_prices),
            momentum,
            sizing_fraction: sizing_fraction(consensus.confidence_score as f64),
            consensus,
        });
    }

    let mut consensus_only: Vec<ConsensusResult> = entries.iter().map(|e| e.consensus.clone()).collect();
    sort_for_listing(&mut consensus_only);
    let order: HashMap<String, usize> = consensus_only
        .iter()
        .enumerate()
        .map(|(i, c)| (c.symbol.clone(), i))
        .collect();
    entries.sort_by_key(|e| order.get(&e.consensus.symbol).copied().unwrap_or(usize::MAX));

    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct SymbolQuery {
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
    pub segment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SymbolPositionView {
    pub trader_id: String,
    pub direction: Direction,
    pub roe: f64,
    pub pnl_percent: f64,
    pub hold_duration_seconds: i64,
    pub leverage: f64,
}

#[derive(Debug, Serialize)]
pub struct SymbolDetail {
    pub consensus: ConsensusResult,
    pub positions: Vec<SymbolPositionView>,
    pub entry_price_spread: f64,
}

pub async fn symbol_detail(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<SymbolQuery>,
) -> AppResult<Json<SymbolDetail>> {
    let segment_filter = query.segment.as_deref().map(parse_segment_filter).unwrap_or(SegmentQueryFilter::Both);
    let now = Utc::now();

    let scores = state.db.list_trader_scores()?;
    let score_map = trader_lookup(&scores);
    let positions = state.db.active_positions_for_symbol(&symbol)?;

    let filters = Filters {
        time_range: query.time_range.as_deref().map(parse_time_range).unwrap_or_default(),
        side: None,
        leverage: LeverageBucket::All,
        min_traders: 0,
        segment: segment_filter,
        recently_opened: None,
    };
    let (contributions, entry_prices) = contributions_for_symbol(&positions, &score_map, &filters, now);
    let consensus = compute_consensus(&symbol, &contributions);

    let mut views = Vec::new();
    for position in &positions {
        let score = score_map.get(&position.trader_id);
        let segment = score.map(|s| s.segment).unwrap_or(Segment::Unknown);
        if !segment_matches(segment_filter, segment) {
            continue;
        }
        let leverage = position.leverage.unwrap_or(1.0);
        let notional = position.amount * position.entry_price;
        let unrealized_pnl = position.unrealized_pnl.unwrap_or(0.0);
        views.push(SymbolPositionView {
            trader_id: position.trader_id.clone(),
            direction: position.direction,
            roe: compute_roe(unrealized_pnl, notional, leverage),
            pnl_percent: compute_pnl_percent(unrealized_pnl, position.amount, position.entry_price),
            hold_duration_seconds: hold_duration_seconds(position.estimated_open_time, now),
            leverage,
        });
    }

    Ok(Json(SymbolDetail {
        consensus,
        positions: views,
        entry_price_spread: entry_price_spread(&entry_prices),
    }))
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    #[serde(default = "default_source")]
    pub source: String,
    pub symbol: Option<String>,
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
    pub segment: Option<String>,
    pub limit: Option<i64>,
}

fn default_source() -> String {
    "all".to_string()
}

#[derive(Debug, Serialize, Default)]
pub struct FeedResponse {
    pub positions: Vec<PositionState>,
    pub derived: Vec<TraderScore>,
}

pub async fn feed(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> AppResult<Json<FeedResponse>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000) as usize;
    let segment_filter = query.segment.as_deref().map(parse_segment_filter).unwrap_or(SegmentQueryFilter::Both);
    let now = Utc::now();
    let cutoff = query
        .time_range
        .as_deref()
        .map(parse_time_range)
        .unwrap_or_default()
        .millis()
        .map(|ms| now - chrono::Duration::milliseconds(ms));

    let mut response = FeedResponse::default();

    if query.source == "all" || query.source == "positions" {
        let mut positions = match &query.symbol {
            Some(symbol) => state.db.active_positions_for_symbol(symbol)?,
            None => state.db.all_active_positions()?,
        };
        if let Some(cutoff) = cutoff {
            positions.retain(|p| p.estimated_open_time >= cutoff || p.last_seen_at >= cutoff);
        }
        positions.truncate(limit);
        response.positions = positions;
    }

    if query.source == "all" || query.source == "derived" {
        let mut scores = state.db.list_trader_scores()?;
        scores.retain(|s| segment_matches(segment_filter, s.segment));
        scores.truncate(limit);
        response.derived = scores;
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct EventsFeedQuery {
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
    pub segment: Option<String>,
    pub symbol: Option<String>,
    pub limit: Option<i64>,
}

pub async fn events_feed(
    State(state): State<AppState>,
    Query(query): Query<EventsFeedQuery>,
) -> AppResult<Json<Vec<crate::models::Event>>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let since = query
        .time_range
        .as_deref()
        .map(parse_time_range)
        .and_then(|range| range.millis())
        .map(|ms| Utc::now() - chrono::Duration::milliseconds(ms));

    let segment_filter = query.segment.as_deref().map(parse_segment_filter);
    // Over-fetch at the storage cap so the segment filter below doesn't
    // starve the response of rows the caller's limit still has room for.
    let fetch_limit = if segment_filter.is_some() { 500 } else { limit };
    let mut events = state.db.events_feed(query.symbol.as_deref(), since, fetch_limit)?;

    if let Some(segment_filter) = segment_filter {
        let scores = state.db.list_trader_scores()?;
        let score_map = trader_lookup(&scores);
        events.retain(|event| {
            let segment = score_map.get(&event.trader_id).map(|s| s.segment).unwrap_or(Segment::Unknown);
            segment_matches(segment_filter, segment)
        });
        events.truncate(limit as usize);
    }

    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct LatestRecordsQuery {
    pub limit: Option<i64>,
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
}

pub async fn latest_records_feed(
    State(state): State<AppState>,
    Query(query): Query<LatestRecordsQuery>,
) -> AppResult<Json<Vec<RawIngestRecord>>> {
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let since = query
        .time_range
        .as_deref()
        .map(parse_time_range)
        .and_then(|range| range.millis())
        .map(|ms| Utc::now() - chrono::Duration::milliseconds(ms));

    let records = state.db.latest_records_feed(limit, since)?;
    Ok(Json(records))
}

pub async fn trader_metrics(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
) -> AppResult<Json<TraderScore>> {
    state
        .db
        .get_trader_score(&lead_id)?
        .ok_or_else(|| AppError::not_found(format!("no score on file for {lead_id}")))
        .map(Json)
}

#[derive(Debug, Serialize)]
pub struct FleetDiagnostic {
    pub traders_ingested: usize,
    pub traders_scored: usize,
    pub symbols_tracked: usize,
    pub active_positions: usize,
    pub generated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TraderDiagnostic {
    pub trader_id: String,
    pub latest_ingest: Option<RawIngestRecord>,
    pub score: Option<TraderScore>,
    pub active_position_count: usize,
}

pub async fn diagnostic_fleet(State(state): State<AppState>) -> AppResult<Json<FleetDiagnostic>> {
    Ok(Json(FleetDiagnostic {
        traders_ingested: state.db.list_trader_ids()?.len(),
        traders_scored: state.db.list_trader_scores()?.len(),
        symbols_tracked: state.db.distinct_symbols()?.len(),
        active_positions: state.db.all_active_positions()?.len(),
        generated_at: Utc::now(),
    }))
}

pub async fn diagnostic_trader(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
) -> AppResult<Json<TraderDiagnostic>> {
    let latest_ingest = state.db.latest_raw_ingest(&lead_id)?;
    let score = state.db.get_trader_score(&lead_id)?;
    let active_position_count = state
        .db
        .all_active_positions()?
        .into_iter()
        .filter(|p| p.trader_id == lead_id)
        .count();
    Ok(Json(TraderDiagnostic {
        trader_id: lead_id,
        latest_ingest,
        score,
        active_position_count,
    }))
}
