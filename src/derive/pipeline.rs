//! Derivation pass orchestration (§4.3-§4.6, §7 "idempotent and safe to
//! re-run").
//!
//! Wires the pieces in `derive::*` together against one trader's latest
//! raw ingest: parse the payload, turn orders into events, append only
//! the events not already logged, replay the event stream into position
//! state, and fold the result into an updated `TraderScore`. Every step
//! here is safe to call again on the same ingest — `event_exists` is the
//! guard that keeps a re-run from duplicating history.

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use crate::derive::events::order_to_event;
use crate::derive::leverage::{estimate_leverage, PEER_QUALITY_DELTA};
use crate::derive::metrics::{compute_trader_metrics, TraderMetricsInput};
use crate::derive::payload::{parse_live_positions, parse_orders, parse_roi_series};
use crate::derive::reconstruct::reconstruct_from_events;
use crate::derive::weight::compute_trader_weight;
use crate::models::{Direction, LivePosition, PositionSide, PositionState, Segment, TraderScore};
use crate::storage::Db;

const LEVERAGE_HISTORY_WINDOW: chrono::Duration = chrono::Duration::days(7);

/// Attaches the live mark price/unrealized PnL from a directly-observed
/// `activePositions` row onto the matching reconstructed state, keyed by
/// `(symbol, direction)`. Positions reported with `PositionSide::Both`
/// carry no unambiguous direction and are left unmatched.
fn apply_live_marks(states: &mut [PositionState], live_positions: &[LivePosition]) {
    let mut by_key: std::collections::HashMap<(&str, Direction), &LivePosition> =
        std::collections::HashMap::new();
    for live in live_positions {
        let direction = match live.side {
            PositionSide::Long => Direction::Long,
            PositionSide::Short => Direction::Short,
            PositionSide::Both => continue,
        };
        by_key.insert((live.symbol.as_str(), direction), live);
    }

    for state in states {
        if let Some(live) = by_key.get(&(state.symbol.as_str(), state.direction)) {
            state.mark_price = Some(live.mark_price);
            state.unrealized_pnl = Some(live.unrealized_pnl);
            state.leverage = Some(live.leverage);
        }
    }
}

fn position_show_flag(payload: &serde_json::Value) -> Option<bool> {
    payload
        .get("positionShow")
        .or_else(|| payload.get("leadCommon").and_then(|v| v.get("positionShow")))
        .and_then(|v| v.as_bool())
}

/// Runs one derivation pass for `trader_id` against its latest ingested
/// payload, persisting the resulting events, position states, and
/// trader score. Returns `None` if the trader has no raw ingest on file.
pub fn run_derivation_pass(db: &Db, trader_id: &str) -> anyhow::Result<Option<TraderScore>> {
    let Some(latest) = db
        .latest_raw_ingest(trader_id)
        .context("loading latest raw ingest")?
    else {
        return Ok(None);
    };

    let payload = &latest.payload;
    let fetched_at = latest.fetched_at;

    let active_positions_raw = payload
        .get("activePositions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let active_positions = parse_live_positions(&active_positions_raw);

    let orders_raw = payload
        .get("orderHistory")
        .and_then(|oh| oh.get("allOrders"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let orders = parse_orders(&orders_raw);

    let roi_series = payload
        .get("roiSeries")
        .map(parse_roi_series)
        .unwrap_or_default();

    let mut appended = 0u32;
    for order in &orders {
        let Some(event) = order_to_event(trader_id, &order.symbol, fetched_at, order) else {
            continue;
        };
        let event_time = event.event_time.unwrap_or(event.fetched_at);
        let already_logged = db
            .event_exists(trader_id, &event.symbol, event.kind, event_time)
            .context("checking event dedup")?;
        if already_logged {
            continue;
        }
        db.append_event(&event).context("appending derived event")?;
        appended += 1;
    }
    info!(trader_id, appended, orders = orders.len(), "derivation pass appended events");

    let now = Utc::now();
    let metrics = compute_trader_metrics(&TraderMetricsInput {
        orders: &orders,
        active_positions: &active_positions,
        roi_series: &roi_series,
        now,
    });

    let events = db
        .events_for_trader(trader_id)
        .context("loading trader event history")?;
    let mut states = reconstruct_from_events(trader_id, &events);
    apply_live_marks(&mut states, &active_positions);

    let leverage_since = now - LEVERAGE_HISTORY_WINDOW;
    let own_leverages = db
        .known_leverages_for_trader(trader_id, leverage_since)
        .context("loading own leverage history")?;
    let mut peer_leverages: Vec<f64> = Vec::new();
    if own_leverages.is_empty() && states.iter().any(|s| s.leverage.is_none()) {
        let peers = db
            .peer_scores_near(trader_id, metrics.quality_score, PEER_QUALITY_DELTA)
            .context("loading peer scores for leverage fallback")?;
        for peer in peers {
            peer_leverages.extend(
                db.known_leverages_for_trader(&peer.trader_id, leverage_since)
                    .context("loading peer leverage history")?,
            );
        }
    }
    for state in &mut states {
        if state.leverage.is_none() {
            let estimate = estimate_leverage(&own_leverages, &peer_leverages);
            state.leverage = Some(estimate.leverage);
        }
    }

    for state in &states {
        db.upsert_position_state(state)
            .context("upserting reconstructed position state")?;
    }

    let position_show = position_show_flag(payload);
    let segment = Segment::from_position_show(position_show);
    if segment == Segment::Unknown {
        warn!(trader_id, "derivation pass saw no positionShow flag on latest ingest");
    }

    let trader_weight = compute_trader_weight(
        metrics.quality_score,
        metrics.confidence,
        metrics.win_rate,
        position_show.unwrap_or(false),
    );

    let score = TraderScore {
        trader_id: trader_id.to_string(),
        quality_score: metrics.quality_score,
        confidence: metrics.confidence,
        win_rate: metrics.win_rate,
        sample_size: (metrics.wins + metrics.losses + metrics.breakeven) as usize,
        trader_weight,
        updated_at: now,
        segment,
    };
    db.upsert_trader_score(&score)
        .context("upserting trader score")?;

    Ok(Some(score))
}

/// Runs a derivation pass for every trader with a raw ingest on file,
/// logging but not aborting on a per-trader failure.
pub fn run_derivation_sweep(db: &Db) -> anyhow::Result<Vec<TraderScore>> {
    let trader_ids = db.list_trader_ids().context("listing ingested traders")?;
    let mut scores = Vec::with_capacity(trader_ids.len());
    for trader_id in trader_ids {
        match run_derivation_pass(db, &trader_id) {
            Ok(Some(score)) => scores.push(score),
            Ok(None) => {}
            Err(err) => warn!(trader_id, error = %err, "derivation pass failed"),
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionStatus;
    use serde_json::json;

    #[test]
    fn derives_score_from_raw_ingest_and_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let payload = json!({
            "fetchedAt": Utc::now().to_rfc3339(),
            "positionShow": true,
            "activePositions": [{
                "symbol": "BTCUSDT",
                "positionSide": "LONG",
                "amount": "1.0",
                "entryPrice": "60000.0",
                "markPrice": "61000.0",
                "leverage": "10",
                "unrealizedPnL": "1000.0",
            }],
            "orderHistory": {"allOrders": [{
                "symbol": "BTCUSDT",
                "side": "BUY",
                "positionSide": "LONG",
                "executedQty": "1.0",
                "avgPrice": "60000.0",
                "time": Utc::now().timestamp_millis(),
            }]},
        });
        db.insert_raw_ingest("trader-1", &payload).unwrap();

        let first = run_derivation_pass(&db, "trader-1").unwrap().unwrap();
        assert_eq!(first.trader_id, "trader-1");
        let events_after_first = db.events_for_trader("trader-1").unwrap();
        assert_eq!(events_after_first.len(), 1);

        let second = run_derivation_pass(&db, "trader-1").unwrap().unwrap();
        let events_after_second = db.events_for_trader("trader-1").unwrap();
        assert_eq!(events_after_second.len(), 1);
        assert_eq!(second.trader_id, first.trader_id);
    }

    #[test]
    fn missing_trader_returns_none() {
        let db = Db::open_in_memory().unwrap();
        assert!(run_derivation_pass(&db, "nobody").unwrap().is_none());
    }

    #[test]
    fn hidden_trader_gets_estimated_leverage_from_own_history() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();

        // Seed an existing position_state row with a directly-observed
        // leverage for this trader so `known_leverages_for_trader` has an
        // "own history" sample to draw from.
        let seed = PositionState {
            id: None,
            trader_id: "trader-2".into(),
            symbol: "ETHUSDT".into(),
            direction: Direction::Long,
            status: PositionStatus::Closed,
            entry_price: 2000.0,
            amount: 1.0,
            first_seen_at: now,
            last_seen_at: now,
            estimated_open_time: now,
            estimated_close_time: Some(now),
            disappeared_at: None,
            leverage: Some(25.0),
            opening_event_id: None,
            confidence: None,
            mark_price: None,
            unrealized_pnl: None,
        };
        db.upsert_position_state(&seed).unwrap();

        // This payload has no `activePositions`, so the trader is hidden
        // and the reconstructed BTCUSDT row can only get a leverage value
        // through the estimator's own-history fallback.
        let payload = json!({
            "fetchedAt": now.to_rfc3339(),
            "positionShow": false,
            "orderHistory": {"allOrders": [{
                "symbol": "BTCUSDT",
                "side": "BUY",
                "positionSide": "LONG",
                "executedQty": "1.0",
                "avgPrice": "60000.0",
                "time": now.timestamp_millis(),
            }]},
        });
        db.insert_raw_ingest("trader-2", &payload).unwrap();

        run_derivation_pass(&db, "trader-2").unwrap().unwrap();
        let state = db
            .get_position_state("trader-2", "BTCUSDT", Direction::Long)
            .unwrap()
            .unwrap();
        assert_eq!(state.leverage, Some(25.0));
    }
}
