//! Raw-payload parsing (§3, §9 "Dynamic payload shapes").
//!
//! Everything upstream hands back is `serde_json::Value` — field names
//! in camelCase, numbers as either JSON numbers or strings. This module
//! is the one place that crosses from that dynamic shape into the typed
//! `LivePosition`/`Order` vocabulary the rest of `derive::*` operates on.
//! A row that's missing a required field is dropped rather than defaulted;
//! callers see fewer rows, never fabricated ones.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::{LivePosition, Order, OrderSide, PositionSide};
use crate::numeric::safe_number_field;

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn position_side_from_str(s: &str) -> Option<PositionSide> {
    match s.to_ascii_uppercase().as_str() {
        "LONG" => Some(PositionSide::Long),
        "SHORT" => Some(PositionSide::Short),
        "BOTH" => Some(PositionSide::Both),
        _ => None,
    }
}

fn order_side_from_str(s: &str) -> Option<OrderSide> {
    match s.to_ascii_uppercase().as_str() {
        "BUY" => Some(OrderSide::Buy),
        "SELL" => Some(OrderSide::Sell),
        _ => None,
    }
}

/// Parses one row of `activePositions` into a `LivePosition`. Requires
/// `symbol`, `positionSide`, and `entryPrice` at minimum; everything else
/// defaults to zero/absent rather than failing the whole row, since the
/// active-position filter (§4.1) has already screened for non-zero
/// amount/notional/pnl before this runs.
pub fn parse_live_position(row: &Value) -> Option<LivePosition> {
    let symbol = row.get("symbol")?.as_str()?.to_string();
    let side = row
        .get("positionSide")
        .and_then(|v| v.as_str())
        .and_then(position_side_from_str)?;
    let entry_price = safe_number_field(row, "entryPrice")?;

    Some(LivePosition {
        symbol,
        side,
        amount: safe_number_field(row, "amount").unwrap_or(0.0),
        entry_price,
        mark_price: safe_number_field(row, "markPrice").unwrap_or(entry_price),
        break_even_price: safe_number_field(row, "breakEvenPrice"),
        notional: safe_number_field(row, "notional").unwrap_or(0.0),
        leverage: safe_number_field(row, "leverage").unwrap_or(1.0),
        isolated: row.get("isolated").and_then(|v| v.as_bool()).unwrap_or(false),
        unrealized_pnl: safe_number_field(row, "unrealizedPnL").unwrap_or(0.0),
        cumulative_realized: safe_number_field(row, "cumRealized").unwrap_or(0.0),
        adl_bucket: row
            .get("adl")
            .and_then(|v| v.as_u64())
            .map(|v| v.min(5) as u8),
    })
}

/// Parses one row of `orderHistory.allOrders` into an `Order`. Requires
/// `symbol`, `side`, `positionSide`, and a parseable `time`/`orderTime`
/// field — rows missing any of these can't be classified by
/// `derive::events::classify_order` and are dropped upstream of that call.
pub fn parse_order(row: &Value) -> Option<Order> {
    let symbol = row.get("symbol")?.as_str()?.to_string();
    let side = row
        .get("side")
        .and_then(|v| v.as_str())
        .and_then(order_side_from_str)?;
    let position_side = row
        .get("positionSide")
        .and_then(|v| v.as_str())
        .and_then(position_side_from_str)?;

    let order_time_millis = row
        .get("time")
        .or_else(|| row.get("orderTime"))
        .and_then(|v| v.as_i64())?;
    let order_time = millis_to_datetime(order_time_millis)?;

    let order_update_time = row
        .get("updateTime")
        .and_then(|v| v.as_i64())
        .and_then(millis_to_datetime);

    Some(Order {
        symbol,
        side,
        position_side,
        executed_qty: safe_number_field(row, "executedQty").unwrap_or(0.0),
        avg_price: safe_number_field(row, "avgPrice").unwrap_or(0.0),
        total_pnl: safe_number_field(row, "totalPnl").or_else(|| safe_number_field(row, "realizedPnl")),
        order_time,
        order_update_time,
    })
}

/// Parses an ROI chart series (`{"dataList": [{"time": ms, "value": roi}]}`
/// or a bare array of the same row shape) into ascending `(time, roi_pct)`
/// pairs consumed by `derive::metrics::TraderMetricsInput`.
pub fn parse_roi_series(value: &Value) -> Vec<(DateTime<Utc>, f64)> {
    let rows = value
        .get("dataList")
        .and_then(|v| v.as_array())
        .or_else(|| value.as_array());

    let Some(rows) = rows else {
        return Vec::new();
    };

    let mut series: Vec<(DateTime<Utc>, f64)> = rows
        .iter()
        .filter_map(|row| {
            let time_millis = row.get("time").and_then(|v| v.as_i64())?;
            let time = millis_to_datetime(time_millis)?;
            let roi = safe_number_field(row, "value").or_else(|| safe_number_field(row, "roi"))?;
            Some((time, roi))
        })
        .collect();
    series.sort_by_key(|(time, _)| *time);
    series
}

/// Parses every row of `activePositions`, silently dropping unparseable
/// rows rather than failing the batch.
pub fn parse_live_positions(rows: &[Value]) -> Vec<LivePosition> {
    rows.iter().filter_map(parse_live_position).collect()
}

/// Parses every row of `orderHistory.allOrders`, silently dropping
/// unparseable rows rather than failing the batch.
pub fn parse_orders(rows: &[Value]) -> Vec<Order> {
    rows.iter().filter_map(parse_order).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_well_formed_position() {
        let row = json!({
            "symbol": "BTCUSDT",
            "positionSide": "LONG",
            "amount": "1.5",
            "entryPrice": "60000.0",
            "markPrice": "61000.0",
            "leverage": "10",
            "unrealizedPnL": "1500.0",
        });
        let position = parse_live_position(&row).unwrap();
        assert_eq!(position.symbol, "BTCUSDT");
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.mark_price, 61000.0);
    }

    #[test]
    fn missing_entry_price_drops_the_row() {
        let row = json!({"symbol": "BTCUSDT", "positionSide": "LONG"});
        assert!(parse_live_position(&row).is_none());
    }

    #[test]
    fn parses_an_order_and_classifies_side() {
        let row = json!({
            "symbol": "ETHUSDT",
            "side": "BUY",
            "positionSide": "LONG",
            "executedQty": "2.0",
            "avgPrice": "3000.0",
            "time": 1_700_000_000_000i64,
        });
        let order = parse_order(&row).unwrap();
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.position_side, PositionSide::Long);
    }

    #[test]
    fn roi_series_sorted_ascending() {
        let value = json!({"dataList": [
            {"time": 2000, "value": 5.0},
            {"time": 1000, "value": 1.0},
        ]});
        let series = parse_roi_series(&value);
        assert_eq!(series.len(), 2);
        assert!(series[0].0 < series[1].0);
    }
}
