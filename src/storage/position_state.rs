//! Position-state store (§4.7, C8) — singleton row per
//! `(trader_id, symbol, direction)`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::models::{Direction, PositionState, PositionStatus};
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

fn status_to_str(s: PositionStatus) -> &'static str {
    match s {
        PositionStatus::Active => "active",
        PositionStatus::Closed => "closed",
    }
}

fn status_from_str(s: &str) -> PositionStatus {
    if s == "closed" {
        PositionStatus::Closed
    } else {
        PositionStatus::Active
    }
}

fn opt_rfc3339(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl Db {
    pub fn upsert_position_state(&self, state: &PositionState) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO position_state
                (trader_id, symbol, direction, status, entry_price, amount, first_seen_at,
                 last_seen_at, estimated_open_time, estimated_close_time, disappeared_at,
                 leverage, opening_event_id, confidence, mark_price, unrealized_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(trader_id, symbol, direction) DO UPDATE SET
                status = excluded.status,
                entry_price = excluded.entry_price,
                amount = excluded.amount,
                last_seen_at = excluded.last_seen_at,
                estimated_open_time = excluded.estimated_open_time,
                estimated_close_time = excluded.estimated_close_time,
                disappeared_at = excluded.disappeared_at,
                leverage = excluded.leverage,
                opening_event_id = excluded.opening_event_id,
                confidence = excluded.confidence,
                mark_price = excluded.mark_price,
                unrealized_pnl = excluded.unrealized_pnl",
            params![
                state.trader_id,
                state.symbol,
                direction_to_str(state.direction),
                status_to_str(state.status),
                state.entry_price,
                state.amount,
                state.first_seen_at.to_rfc3339(),
                state.last_seen_at.to_rfc3339(),
                state.estimated_open_time.to_rfc3339(),
                state.estimated_close_time.map(|t| t.to_rfc3339()),
                state.disappeared_at.map(|t| t.to_rfc3339()),
                state.leverage,
                state.opening_event_id,
                state.confidence,
                state.mark_price,
                state.unrealized_pnl,
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM position_state WHERE trader_id = ?1 AND symbol = ?2 AND direction = ?3",
            params![state.trader_id, state.symbol, direction_to_str(state.direction)],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_position_state(
        &self,
        trader_id: &str,
        symbol: &str,
        direction: Direction,
    ) -> anyhow::Result<Option<PositionState>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, trader_id, symbol, direction, status, entry_price, amount, first_seen_at,
                        last_seen_at, estimated_open_time, estimated_close_time, disappeared_at,
                        leverage, opening_event_id, confidence, mark_price, unrealized_pnl
                 FROM position_state WHERE trader_id = ?1 AND symbol = ?2 AND direction = ?3",
                params![trader_id, symbol, direction_to_str(direction)],
                row_to_state,
            )
            .optional()?;
        Ok(row)
    }

    pub fn active_positions_for_symbol(&self, symbol: &str) -> anyhow::Result<Vec<PositionState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, trader_id, symbol, direction, status, entry_price, amount, first_seen_at,
                    last_seen_at, estimated_open_time, estimated_close_time, disappeared_at,
                    leverage, opening_event_id, confidence, mark_price, unrealized_pnl
             FROM position_state WHERE symbol = ?1 AND status = 'active'",
        )?;
        let rows = stmt
            .query_map(params![symbol], row_to_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_active_positions(&self) -> anyhow::Result<Vec<PositionState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, trader_id, symbol, direction, status, entry_price, amount, first_seen_at,
                    last_seen_at, estimated_open_time, estimated_close_time, disappeared_at,
                    leverage, opening_event_id, confidence, mark_price, unrealized_pnl
             FROM position_state WHERE status = 'active'",
        )?;
        let rows = stmt
            .query_map(params![], row_to_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Directly-observed leverages on file for a trader since `since`,
    /// used as the "own history" sample for the leverage estimator (§4.6).
    pub fn known_leverages_for_trader(
        &self,
        trader_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT leverage FROM position_state
             WHERE trader_id = ?1 AND leverage IS NOT NULL AND last_seen_at >= ?2",
        )?;
        let rows = stmt
            .query_map(params![trader_id, since.to_rfc3339()], |row| row.get::<_, f64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<PositionState> {
    let direction_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let first_seen_str: String = row.get(7)?;
    let last_seen_str: String = row.get(8)?;
    let est_open_str: String = row.get(9)?;
    let est_close: Option<String> = row.get(10)?;
    let disappeared: Option<String> = row.get(11)?;

    Ok(PositionState {
        id: row.get(0)?,
        trader_id: row.get(1)?,
        symbol: row.get(2)?,
        direction: direction_from_str(&direction_str),
        status: status_from_str(&status_str),
        entry_price: row.get(5)?,
        amount: row.get(6)?,
        first_seen_at: DateTime::parse_from_rfc3339(&first_seen_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        last_seen_at: DateTime::parse_from_rfc3339(&last_seen_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        estimated_open_time: DateTime::parse_from_rfc3339(&est_open_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        estimated_close_time: opt_rfc3339(est_close),
        disappeared_at: opt_rfc3339(disappeared),
        leverage: row.get(12)?,
        opening_event_id: row.get(13)?,
        confidence: row.get(14)?,
        mark_price: row.get(15)?,
        unrealized_pnl: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        let state = PositionState {
            id: None,
            trader_id: "trader-1".into(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            status: PositionStatus::Active,
            entry_price: 100.0,
            amount: 1.0,
            first_seen_at: now,
            last_seen_at: now,
            estimated_open_time: now,
            estimated_close_time: None,
            disappeared_at: None,
            leverage: Some(10.0),
            opening_event_id: None,
            confidence: None,
            mark_price: Some(101.0),
            unrealized_pnl: Some(1.0),
        };
        db.upsert_position_state(&state).unwrap();
        let fetched = db
            .get_position_state("trader-1", "BTCUSDT", Direction::Long)
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, PositionStatus::Active);
        assert_eq!(fetched.mark_price, Some(101.0));
        assert_eq!(fetched.unrealized_pnl, Some(1.0));
    }
}
