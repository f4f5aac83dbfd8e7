//! Simulated position store (§4.12, C13).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::models::{
    CloseReason, Direction, EventKind, PositionSource, SimulatedPosition, SimulatedStatus,
};
use crate::storage::Db;

fn direction_to_str(d: Direction) -> &'static str {
    match d {
        Direction::Long => "long",
        Direction::Short => "short",
    }
}

fn direction_from_str(s: &str) -> Direction {
    if s == "short" {
        Direction::Short
    } else {
        Direction::Long
    }
}

fn status_to_str(s: SimulatedStatus) -> &'static str {
    match s {
        SimulatedStatus::Open => "open",
        SimulatedStatus::Closed => "closed",
    }
}

fn status_from_str(s: &str) -> SimulatedStatus {
    if s == "closed" {
        SimulatedStatus::Closed
    } else {
        SimulatedStatus::Open
    }
}

fn reason_to_str(r: CloseReason) -> &'static str {
    match r {
        CloseReason::FirstTraderClose => "first_trader_close",
        CloseReason::AutoReverseSignal => "auto_reverse_signal",
        CloseReason::ManualClose => "manual_close",
        CloseReason::StopLoss => "stop_loss",
        CloseReason::TakeProfit => "take_profit",
        CloseReason::TrailingStop => "trailing_stop",
    }
}

fn reason_from_str(s: &str) -> Option<CloseReason> {
    match s {
        "first_trader_close" => Some(CloseReason::FirstTraderClose),
        "auto_reverse_signal" => Some(CloseReason::AutoReverseSignal),
        "manual_close" => Some(CloseReason::ManualClose),
        "stop_loss" => Some(CloseReason::StopLoss),
        "take_profit" => Some(CloseReason::TakeProfit),
        "trailing_stop" => Some(CloseReason::TrailingStop),
        _ => None,
    }
}

fn event_kind_to_str(k: EventKind) -> &'static str {
    match k {
        EventKind::OpenLong => "open_long",
        EventKind::CloseLong => "close_long",
        EventKind::OpenShort => "open_short",
        EventKind::CloseShort => "close_short",
    }
}

fn event_kind_from_str(s: &str) -> Option<EventKind> {
    match s {
        "open_long" => Some(EventKind::OpenLong),
        "close_long" => Some(EventKind::CloseLong),
        "open_short" => Some(EventKind::OpenShort),
        "close_short" => Some(EventKind::CloseShort),
        _ => None,
    }
}

fn source_to_str(s: PositionSource) -> &'static str {
    match s {
        PositionSource::Manual => "manual",
        PositionSource::Auto => "auto",
    }
}

fn source_from_str(s: &str) -> PositionSource {
    if s == "auto" {
        PositionSource::Auto
    } else {
        PositionSource::Manual
    }
}

impl Db {
    pub fn insert_simulated_position(&self, pos: &SimulatedPosition) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO simulated_position
                (platform, symbol, direction, status, leverage, margin_notional, position_notional,
                 entry_price, effective_entry_price, exit_price, opened_at, closed_at, close_reason,
                 close_trigger_trader_id, close_trigger_event_kind, pnl_usdt, roi_pct,
                 stop_loss_price, take_profit_price, trailing_stop_pct, peak_favorable_price,
                 slippage_bps, commission_bps, portfolio_id, source)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)",
            params![
                pos.platform,
                pos.symbol,
                direction_to_str(pos.direction),
                status_to_str(pos.status),
                pos.leverage,
                pos.margin_notional,
                pos.position_notional,
                pos.entry_price,
                pos.effective_entry_price,
                pos.exit_price,
                pos.opened_at.to_rfc3339(),
                pos.closed_at.map(|t| t.to_rfc3339()),
                pos.close_reason.map(reason_to_str),
                pos.close_trigger_trader_id,
                pos.close_trigger_event_kind.map(event_kind_to_str),
                pos.pnl_usdt,
                pos.roi_pct,
                pos.stop_loss_price,
                pos.take_profit_price,
                pos.trailing_stop_pct,
                pos.peak_favorable_price,
                pos.slippage_bps,
                pos.commission_bps,
                pos.portfolio_id,
                source_to_str(pos.source),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Updates the risk-management parameters on an open position (§4.12,
    /// "Adjust stop-loss/take-profit/trailing-stop after open").
    pub fn update_position_risk_params(
        &self,
        id: i64,
        stop_loss_price: Option<f64>,
        take_profit_price: Option<f64>,
        trailing_stop_pct: Option<f64>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE simulated_position
             SET stop_loss_price = ?1, take_profit_price = ?2, trailing_stop_pct = ?3
             WHERE id = ?4",
            params![stop_loss_price, take_profit_price, trailing_stop_pct, id],
        )?;
        Ok(())
    }

    /// Advances the trailing-stop anchor if `current_price` is a new
    /// favorable extreme for the position's direction (§4.12).
    pub fn update_peak_favorable_price(&self, id: i64, current_price: f64) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE simulated_position
             SET peak_favorable_price = CASE
                WHEN direction = 'long' THEN MAX(COALESCE(peak_favorable_price, ?1), ?1)
                ELSE MIN(COALESCE(peak_favorable_price, ?1), ?1)
             END
             WHERE id = ?2 AND status = 'open'",
            params![current_price, id],
        )?;
        Ok(())
    }

    pub fn all_open_simulated_positions(&self) -> anyhow::Result<Vec<SimulatedPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, platform, symbol, direction, status, leverage, margin_notional,
                    position_notional, entry_price, effective_entry_price, exit_price, opened_at,
                    closed_at, close_reason, close_trigger_trader_id, close_trigger_event_kind,
                    pnl_usdt, roi_pct, stop_loss_price, take_profit_price, trailing_stop_pct,
                    peak_favorable_price, slippage_bps, commission_bps, portfolio_id, source
             FROM simulated_position WHERE status = 'open'",
        )?;
        let rows = stmt
            .query_map(params![], row_to_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn close_simulated_position(
        &self,
        id: i64,
        exit_price: f64,
        closed_at: DateTime<Utc>,
        close_reason: CloseReason,
        pnl_usdt: f64,
        roi_pct: f64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE simulated_position SET status = 'closed', exit_price = ?1, closed_at = ?2,
                close_reason = ?3, pnl_usdt = ?4, roi_pct = ?5 WHERE id = ?6",
            params![
                exit_price,
                closed_at.to_rfc3339(),
                reason_to_str(close_reason),
                pnl_usdt,
                roi_pct,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn set_close_trigger(
        &self,
        id: i64,
        trigger_trader_id: &str,
        trigger_event_kind: EventKind,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE simulated_position SET close_trigger_trader_id = ?1, close_trigger_event_kind = ?2 WHERE id = ?3",
            params![trigger_trader_id, event_kind_to_str(trigger_event_kind), id],
        )?;
        Ok(())
    }

    pub fn get_simulated_position(&self, id: i64) -> anyhow::Result<Option<SimulatedPosition>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, platform, symbol, direction, status, leverage, margin_notional,
                        position_notional, entry_price, effective_entry_price, exit_price, opened_at,
                        closed_at, close_reason, close_trigger_trader_id, close_trigger_event_kind,
                        pnl_usdt, roi_pct, stop_loss_price, take_profit_price, trailing_stop_pct,
                        peak_favorable_price, slippage_bps, commission_bps, portfolio_id, source
                 FROM simulated_position WHERE id = ?1",
                params![id],
                row_to_position,
            )
            .optional()?;
        Ok(row)
    }

    pub fn open_positions_for_portfolio(
        &self,
        portfolio_id: &str,
    ) -> anyhow::Result<Vec<SimulatedPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, platform, symbol, direction, status, leverage, margin_notional,
                    position_notional, entry_price, effective_entry_price, exit_price, opened_at,
                    closed_at, close_reason, close_trigger_trader_id, close_trigger_event_kind,
                    pnl_usdt, roi_pct, stop_loss_price, take_profit_price, trailing_stop_pct,
                    peak_favorable_price, slippage_bps, commission_bps, portfolio_id, source
             FROM simulated_position WHERE portfolio_id = ?1 AND status = 'open'",
        )?;
        let rows = stmt
            .query_map(params![portfolio_id], row_to_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn positions_for_portfolio(
        &self,
        portfolio_id: &str,
    ) -> anyhow::Result<Vec<SimulatedPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, platform, symbol, direction, status, leverage, margin_notional,
                    position_notional, entry_price, effective_entry_price, exit_price, opened_at,
                    closed_at, close_reason, close_trigger_trader_id, close_trigger_event_kind,
                    pnl_usdt, roi_pct, stop_loss_price, take_profit_price, trailing_stop_pct,
                    peak_favorable_price, slippage_bps, commission_bps, portfolio_id, source
             FROM simulated_position WHERE portfolio_id = ?1 ORDER BY opened_at DESC",
        )?;
        let rows = stmt
            .query_map(params![portfolio_id], row_to_position)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<SimulatedPosition> {
    let direction_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let opened_at_str: String = row.get(11)?;
    let closed_at: Option<String> = row.get(12)?;
    let close_reason: Option<String> = row.get(13)?;
    let close_event_kind: Option<String> = row.get(15)?;
    let source_str: String = row.get(25)?;

    Ok(SimulatedPosition {
        id: row.get(0)?,
        platform: row.get(1)?,
        symbol: row.get(2)?,
        direction: direction_from_str(&direction_str),
        status: status_from_str(&status_str),
        leverage: row.get(5)?,
        margin_notional: row.get(6)?,
        position_notional: row.get(7)?,
        entry_price: row.get(8)?,
        effective_entry_price: row.get(9)?,
        exit_price: row.get(10)?,
        opened_at: DateTime::parse_from_rfc3339(&opened_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        closed_at: closed_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        close_reason: close_reason.and_then(|s| reason_from_str(&s)),
        close_trigger_trader_id: row.get(14)?,
        close_trigger_event_kind: close_event_kind.and_then(|s| event_kind_from_str(&s)),
        pnl_usdt: row.get(16)?,
        roi_pct: row.get(17)?,
        stop_loss_price: row.get(18)?,
        take_profit_price: row.get(19)?,
        trailing_stop_pct: row.get(20)?,
        peak_favorable_price: row.get(21)?,
        slippage_bps: row.get(22)?,
        commission_bps: row.get(23)?,
        portfolio_id: row.get(24)?,
        source: source_from_str(&source_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(portfolio_id: &str) -> SimulatedPosition {
        SimulatedPosition {
            id: 0,
            platform: "binance".into(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            status: SimulatedStatus::Open,
            leverage: 10.0,
            margin_notional: 100.0,
            position_notional: 1_000.0,
            entry_price: 50_000.0,
            effective_entry_price: 50_050.0,
            exit_price: None,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
            close_trigger_trader_id: None,
            close_trigger_event_kind: None,
            pnl_usdt: None,
            roi_pct: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_pct: None,
            peak_favorable_price: None,
            slippage_bps: 5.0,
            commission_bps: 4.0,
            portfolio_id: portfolio_id.into(),
            source: PositionSource::Auto,
        }
    }

    #[test]
    fn insert_then_get_round_trips_all_fields() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_simulated_position(&sample("default")).unwrap();
        let fetched = db.get_simulated_position(id).unwrap().unwrap();
        assert_eq!(fetched.symbol, "BTCUSDT");
        assert_eq!(fetched.portfolio_id, "default");
        assert_eq!(fetched.source, PositionSource::Auto);
        assert_eq!(fetched.status, SimulatedStatus::Open);
    }

    #[test]
    fn close_updates_status_and_pnl_fields() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_simulated_position(&sample("default")).unwrap();
        db.close_simulated_position(id, 51_000.0, Utc::now(), CloseReason::ManualClose, 95.5, 95.5)
            .unwrap();
        let fetched = db.get_simulated_position(id).unwrap().unwrap();
        assert_eq!(fetched.status, SimulatedStatus::Closed);
        assert_eq!(fetched.exit_price, Some(51_000.0));
        assert_eq!(fetched.close_reason, Some(CloseReason::ManualClose));
        assert_eq!(fetched.pnl_usdt, Some(95.5));
    }

    #[test]
    fn open_positions_for_portfolio_excludes_closed() {
        let db = Db::open_in_memory().unwrap();
        let open_id = db.insert_simulated_position(&sample("default")).unwrap();
        let closed_id = db.insert_simulated_position(&sample("default")).unwrap();
        db.close_simulated_position(
            closed_id,
            51_000.0,
            Utc::now(),
            CloseReason::ManualClose,
            10.0,
            10.0,
        )
        .unwrap();
        let open = db.open_positions_for_portfolio("default").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, open_id);
    }
}
