//! Order-to-event mapping (§4.8/§4.9, C9).
//!
//! `buy+long -> open_long`, `sell+long -> close_long`, `sell+short ->
//! open_short`, `buy+short -> close_short`. `position_side = both` is
//! ambiguous on its own — resolved by the sign of `total_pnl` (a realized
//! close has a PnL figure attached; an open does not). See DESIGN.md for
//! the open-question writeup.

use crate::models::{Event, EventKind, Order, OrderSide, PositionSide};

/// Maps one order to its event kind, or `None` if the combination can't
/// be classified (e.g. `both` with no PnL to disambiguate).
pub fn classify_order(order: &Order) -> Option<EventKind> {
    match (order.side, order.position_side) {
        (OrderSide::Buy, PositionSide::Long) => Some(EventKind::OpenLong),
        (OrderSide::Sell, PositionSide::Long) => Some(EventKind::CloseLong),
        (OrderSide::Sell, PositionSide::Short) => Some(EventKind::OpenShort),
        (OrderSide::Buy, PositionSide::Short) => Some(EventKind::CloseShort),
        (side, PositionSide::Both) => classify_both(side, order.total_pnl),
    }
}

/// `position_side = both` orders are one-way-mode fills; treat a nonzero
/// `total_pnl` as evidence of a realized close (direction inferred from
/// side: a sell realizing PnL closes a long, a buy realizing PnL closes
/// a short), and a zero/missing PnL as an opening fill.
fn classify_both(side: OrderSide, total_pnl: Option<f64>) -> Option<EventKind> {
    let realized = total_pnl.map(|pnl| pnl != 0.0).unwrap_or(false);
    match (side, realized) {
        (OrderSide::Sell, true) => Some(EventKind::CloseLong),
        (OrderSide::Buy, true) => Some(EventKind::CloseShort),
        (OrderSide::Buy, false) => Some(EventKind::OpenLong),
        (OrderSide::Sell, false) => Some(EventKind::OpenShort),
    }
}

pub fn order_to_event(trader_id: &str, symbol: &str, fetched_at: chrono::DateTime<chrono::Utc>, order: &Order) -> Option<Event> {
    let kind = classify_order(order)?;
    Some(Event {
        id: None,
        trader_id: trader_id.to_string(),
        symbol: symbol.to_string(),
        kind,
        event_time: Some(order.order_time),
        fetched_at,
        price: Some(order.avg_price),
        amount: order.executed_qty,
        realized_pnl: order.total_pnl,
    })
}

/// Stable string label for an event kind, matching the one `event_log`
/// persists — used where a kind needs to travel outside the DB layer
/// (e.g. recording a close trigger on a simulated position).
pub fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::OpenLong => "open_long",
        EventKind::CloseLong => "close_long",
        EventKind::OpenShort => "open_short",
        EventKind::CloseShort => "close_short",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(side: OrderSide, position_side: PositionSide, total_pnl: Option<f64>) -> Order {
        Order {
            symbol: "BTCUSDT".into(),
            side,
            position_side,
            executed_qty: 1.0,
            avg_price: 100.0,
            total_pnl,
            order_time: Utc::now(),
            order_update_time: None,
        }
    }

    #[test]
    fn maps_standard_combinations() {
        assert_eq!(
            classify_order(&order(OrderSide::Buy, PositionSide::Long, None)),
            Some(EventKind::OpenLong)
        );
        assert_eq!(
            classify_order(&order(OrderSide::Sell, PositionSide::Long, Some(5.0))),
            Some(EventKind::CloseLong)
        );
        assert_eq!(
            classify_order(&order(OrderSide::Sell, PositionSide::Short, None)),
            Some(EventKind::OpenShort)
        );
        assert_eq!(
            classify_order(&order(OrderSide::Buy, PositionSide::Short, Some(-2.0))),
            Some(EventKind::CloseShort)
        );
    }

    #[test]
    fn both_uses_pnl_sign_to_disambiguate() {
        assert_eq!(
            classify_order(&order(OrderSide::Sell, PositionSide::Both, Some(10.0))),
            Some(EventKind::CloseLong)
        );
        assert_eq!(
            classify_order(&order(OrderSide::Buy, PositionSide::Both, None)),
            Some(EventKind::OpenLong)
        );
        assert_eq!(
            classify_order(&order(OrderSide::Sell, PositionSide::Both, None)),
            Some(EventKind::OpenShort)
        );
    }
}
