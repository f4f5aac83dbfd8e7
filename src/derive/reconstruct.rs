//! Position-state reconstructor (§4.7, C8).
//!
//! Two entry points share one state machine: `reconstruct_from_events`
//! replays the normalized Event stream (used when the trader's positions
//! are directly observable), and `reconstruct_from_orders` replays
//! classified order-history events as a fallback for traders whose
//! positions are never visible, attaching a heuristic confidence.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::derive::events::classify_order;
use crate::models::{Direction, Event, Order, PositionState, PositionStatus};

type StateKey = (String, Direction);

/// Replays a trader's time-ordered Event stream into position states.
/// Events must already be sorted `(event_time, fetched_at)` ascending.
///
/// Uncertainty bounds collapse to the triggering event's own timestamp
/// here — the caller has no separate "snapshot seen/not-seen" stream to
/// widen them with, so `estimated_open_time == first_seen_at` and
/// `estimated_close_time == disappeared_at` until a later snapshot
/// observation calls `observe_snapshot` to refresh `last_seen_at`.
pub fn reconstruct_from_events(trader_id: &str, events: &[Event]) -> Vec<PositionState> {
    let mut active: HashMap<StateKey, PositionState> = HashMap::new();
    let mut closed: Vec<PositionState> = Vec::new();

    for event in events {
        let direction = event.kind.direction();
        let key = (event.symbol.clone(), direction);
        let event_time = event.event_time.unwrap_or(event.fetched_at);

        if event.kind.is_open() {
            active
                .entry(key)
                .and_modify(|state| {
                    state.last_seen_at = event_time;
                })
                .or_insert_with(|| PositionState {
                    id: None,
                    trader_id: trader_id.to_string(),
                    symbol: event.symbol.clone(),
                    direction,
                    status: PositionStatus::Active,
                    entry_price: event.price.unwrap_or(0.0),
                    amount: event.amount,
                    first_seen_at: event_time,
                    last_seen_at: event_time,
                    estimated_open_time: event_time,
                    estimated_close_time: None,
                    disappeared_at: None,
                    leverage: None,
                    opening_event_id: event.id,
                    confidence: None,
                    mark_price: None,
                    unrealized_pnl: None,
                });
        } else if let Some(mut state) = active.remove(&key) {
            state.status = PositionStatus::Closed;
            state.disappeared_at = Some(event_time);
            state.estimated_close_time = Some(event_time);
            closed.push(state);
        } else {
            // A close without a matching active row: logged, and must
            // never revive an already-closed row for this key.
            warn!(trader_id, symbol = %event.symbol, ?direction, "close event with no active position");
        }
    }

    closed.into_iter().chain(active.into_values()).collect()
}

/// Refreshes `last_seen_at` for every currently-active row observed in a
/// later snapshot, widening the open-time uncertainty bound to the
/// midpoint between the last snapshot without the position and the
/// first snapshot with it when that information is available.
pub fn observe_snapshot(
    active: &mut HashMap<StateKey, PositionState>,
    present: &[(String, Direction)],
    observed_at: DateTime<Utc>,
) {
    for key in present {
        if let Some(state) = active.get_mut(key) {
            state.last_seen_at = observed_at;
        }
    }
}

const SUPPORT_BONUS: f64 = 0.08;
const CONTRADICT_PENALTY: f64 = -0.12;
const UNMATCHED_CLOSE_PENALTY: f64 = -0.10;
const LAST_ACTION_OPEN_BIAS: f64 = 0.08;
const RECENCY_BONUS_1H: f64 = 0.12;
const RECENCY_BONUS_24H: f64 = 0.06;
const RECENCY_PENALTY_7D: f64 = -0.10;
const BASE_CONFIDENCE: f64 = 0.55;

/// Derivation-from-orders fallback (§4.7): replays classified orders into
/// the same open/close state machine, then assigns a heuristic
/// confidence per closed/active row based on how consistent the replay
/// was.
pub fn reconstruct_from_orders(
    trader_id: &str,
    orders: &[Order],
    now: DateTime<Utc>,
) -> Vec<PositionState> {
    let mut ordered: Vec<&Order> = orders.iter().collect();
    ordered.sort_by_key(|o| o.order_time);

    let mut active: HashMap<StateKey, PositionState> = HashMap::new();
    let mut closed: Vec<PositionState> = Vec::new();
    let mut supporting_opens: HashMap<StateKey, u32> = HashMap::new();
    let mut contradicting_opens: HashMap<StateKey, u32> = HashMap::new();
    let mut unmatched_closes: HashMap<StateKey, u32> = HashMap::new();
    let mut last_action_open: HashMap<StateKey, bool> = HashMap::new();
    let mut last_event_time: HashMap<StateKey, DateTime<Utc>> = HashMap::new();

    for order in &ordered {
        let Some(kind) = classify_order(order) else {
            continue;
        };
        let direction = kind.direction();
        let key = (order.symbol.clone(), direction);
        last_event_time.insert(key.clone(), order.order_time);

        if kind.is_open() {
            if active.contains_key(&key) {
                *supporting_opens.entry(key.clone()).or_insert(0) += 1;
            } else {
                let opposite_key = (order.symbol.clone(), direction.opposite());
                if active.contains_key(&opposite_key) {
                    *contradicting_opens.entry(key.clone()).or_insert(0) += 1;
                }
                active.insert(
                    key.clone(),
                    PositionState {
                        id: None,
                        trader_id: trader_id.to_string(),
                        symbol: order.symbol.clone(),
                        direction,
                        status: PositionStatus::Active,
                        entry_price: order.avg_price,
                        amount: order.executed_qty,
                        first_seen_at: order.order_time,
                        last_seen_at: order.order_time,
                        estimated_open_time: order.order_time,
                        estimated_close_time: None,
                        disappeared_at: None,
                        leverage: None,
                        opening_event_id: None,
                        confidence: None,
                        mark_price: None,
                        unrealized_pnl: None,
                    },
                );
            }
            last_action_open.insert(key, true);
        } else {
            if let Some(mut state) = active.remove(&key) {
                state.status = PositionStatus::Closed;
                state.disappeared_at = Some(order.order_time);
                state.estimated_close_time = Some(order.order_time);
                closed.push(state);
            } else {
                *unmatched_closes.entry(key.clone()).or_insert(0) += 1;
            }
            last_action_open.insert(key, false);
        }
    }

    let mut rows: Vec<PositionState> = closed.into_iter().chain(active.into_values()).collect();
    for state in &mut rows {
        let key = (state.symbol.clone(), state.direction);
        let mut confidence = BASE_CONFIDENCE;

        let support = (*supporting_opens.get(&key).unwrap_or(&0)).min(3) as f64;
        confidence += support * SUPPORT_BONUS;

        let contradict = (*contradicting_opens.get(&key).unwrap_or(&0)).min(2) as f64;
        confidence += contradict * CONTRADICT_PENALTY;

        let unmatched = (*unmatched_closes.get(&key).unwrap_or(&0)).min(2) as f64;
        confidence += unmatched * UNMATCHED_CLOSE_PENALTY;

        if *last_action_open.get(&key).unwrap_or(&false) {
            confidence += LAST_ACTION_OPEN_BIAS;
        }

        if let Some(last_time) = last_event_time.get(&key) {
            let age = now.signed_duration_since(*last_time);
            if age <= chrono::Duration::hours(1) {
                confidence += RECENCY_BONUS_1H;
            } else if age <= chrono::Duration::hours(24) {
                confidence += RECENCY_BONUS_24H;
            } else if age > chrono::Duration::days(7) {
                confidence += RECENCY_PENALTY_7D;
            }
        }

        state.confidence = Some(confidence.clamp(0.2, 0.95));
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;

    fn event(symbol: &str, kind: EventKind, time: DateTime<Utc>, price: f64) -> Event {
        Event {
            id: None,
            trader_id: "trader-1".into(),
            symbol: symbol.into(),
            kind,
            event_time: Some(time),
            fetched_at: time,
            price: Some(price),
            amount: 1.0,
            realized_pnl: None,
        }
    }

    #[test]
    fn open_then_close_produces_one_closed_row() {
        let now = Utc::now();
        let events = vec![
            event("BTCUSDT", EventKind::OpenLong, now, 100.0),
            event("BTCUSDT", EventKind::CloseLong, now + chrono::Duration::hours(1), 110.0),
        ];
        let states = reconstruct_from_events("trader-1", &events);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, PositionStatus::Closed);
        assert_eq!(states[0].entry_price, 100.0);
    }

    #[test]
    fn close_without_active_row_is_dropped_not_revived() {
        let now = Utc::now();
        let events = vec![event("ETHUSDT", EventKind::CloseLong, now, 50.0)];
        let states = reconstruct_from_events("trader-1", &events);
        assert!(states.is_empty());
    }

    #[test]
    fn no_two_active_rows_for_same_key() {
        let now = Utc::now();
        let events = vec![
            event("BTCUSDT", EventKind::OpenLong, now, 100.0),
            event("BTCUSDT", EventKind::OpenLong, now + chrono::Duration::minutes(5), 101.0),
        ];
        let states = reconstruct_from_events("trader-1", &events);
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn order_fallback_confidence_within_bounds() {
        use crate::models::{OrderSide, PositionSide};
        let now = Utc::now();
        let orders = vec![Order {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            position_side: PositionSide::Long,
            executed_qty: 1.0,
            avg_price: 100.0,
            total_pnl: None,
            order_time: now,
            order_update_time: None,
        }];
        let states = reconstruct_from_orders("trader-1", &orders, now);
        assert_eq!(states.len(), 1);
        let confidence = states[0].confidence.unwrap();
        assert!((0.2..=0.95).contains(&confidence));
    }

    #[test]
    fn contradicting_open_on_opposite_side_lowers_confidence() {
        use crate::models::{OrderSide, PositionSide};
        let now = Utc::now();
        let long_open = Order {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            position_side: PositionSide::Long,
            executed_qty: 1.0,
            avg_price: 100.0,
            total_pnl: None,
            order_time: now,
            order_update_time: None,
        };
        let short_open = Order {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            position_side: PositionSide::Short,
            executed_qty: 1.0,
            avg_price: 101.0,
            total_pnl: None,
            order_time: now + chrono::Duration::minutes(1),
            order_update_time: None,
        };

        let states = reconstruct_from_orders("trader-1", &[long_open.clone()], now);
        let baseline_confidence = states[0].confidence.unwrap();

        let states = reconstruct_from_orders("trader-1", &[long_open, short_open], now);
        assert_eq!(states.len(), 2);
        let short_state = states
            .iter()
            .find(|s| s.direction == Direction::Short)
            .expect("short row present");
        assert!(short_state.confidence.unwrap() < baseline_confidence);
    }
}
