//! Event log store (§4.8, C9).

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::models::{Event, EventKind};
use crate::storage::Db;

fn kind_to_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::OpenLong => "open_long",
        EventKind::CloseLong => "close_long",
        EventKind::OpenShort => "open_short",
        EventKind::CloseShort => "close_short",
    }
}

fn kind_from_str(s: &str) -> Option<EventKind> {
    match s {
        "open_long" => Some(EventKind::OpenLong),
        "close_long" => Some(EventKind::CloseLong),
        "open_short" => Some(EventKind::OpenShort),
        "close_short" => Some(EventKind::CloseShort),
        _ => None,
    }
}

fn opt_rfc3339(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl Db {
    pub fn append_event(&self, event: &Event) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_log (trader_id, symbol, kind, event_time, fetched_at, price, amount, realized_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.trader_id,
                event.symbol,
                kind_to_str(event.kind),
                event.event_time.map(|t| t.to_rfc3339()),
                event.fetched_at.to_rfc3339(),
                event.price,
                event.amount,
                event.realized_pnl,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// True if an event with this exact `(trader_id, symbol, kind,
    /// event_time)` is already logged. The derivation pipeline re-scans
    /// overlapping order-history windows on every ingest, so appends must
    /// dedup on the order's own identity rather than relying on a
    /// database constraint (§4.8 gives events no natural key besides this
    /// tuple once `event_time` is known).
    pub fn event_exists(
        &self,
        trader_id: &str,
        symbol: &str,
        kind: EventKind,
        event_time: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM event_log
             WHERE trader_id = ?1 AND symbol = ?2 AND kind = ?3 AND event_time = ?4",
            params![trader_id, symbol, kind_to_str(kind), event_time.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Distinct symbols with any logged event — the universe the heatmap
    /// and consensus sweeps iterate over.
    pub fn distinct_symbols(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT symbol FROM event_log ORDER BY symbol")?;
        let rows = stmt
            .query_map(params![], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All of one trader's events ordered `(event_time, fetched_at)`
    /// ascending — feeds `derive::reconstruct_from_events` during the
    /// derivation pass.
    pub fn events_for_trader(&self, trader_id: &str) -> anyhow::Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, trader_id, symbol, kind, event_time, fetched_at, price, amount, realized_pnl
             FROM event_log WHERE trader_id = ?1
             ORDER BY COALESCE(event_time, fetched_at) ASC, fetched_at ASC",
        )?;
        let rows = stmt
            .query_map(params![trader_id], row_to_event)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn events_feed(
        &self,
        symbol: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> anyhow::Result<Vec<Event>> {
        let conn = self.conn.lock();
        let limit = limit.clamp(1, 500);
        let mut stmt = conn.prepare(
            "SELECT id, trader_id, symbol, kind, event_time, fetched_at, price, amount, realized_pnl
             FROM event_log
             WHERE (?1 IS NULL OR symbol = ?1)
               AND (?2 IS NULL OR fetched_at >= ?2)
             ORDER BY fetched_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![symbol, since.map(|t| t.to_rfc3339()), limit],
                row_to_event,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Events for one symbol ordered `(event_time, fetched_at)` ascending
    /// — the deterministic replay ordering backtest-lite depends on
    /// (§4.15).
    pub fn events_for_replay(&self, symbol: &str) -> anyhow::Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, trader_id, symbol, kind, event_time, fetched_at, price, amount, realized_pnl
             FROM event_log WHERE symbol = ?1
             ORDER BY COALESCE(event_time, fetched_at) ASC, fetched_at ASC",
        )?;
        let rows = stmt
            .query_map(params![symbol], row_to_event)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let kind_str: String = row.get(3)?;
    let event_time: Option<String> = row.get(4)?;
    let fetched_at_str: String = row.get(5)?;
    Ok(Event {
        id: row.get(0)?,
        trader_id: row.get(1)?,
        symbol: row.get(2)?,
        kind: kind_from_str(&kind_str).unwrap_or(EventKind::OpenLong),
        event_time: opt_rfc3339(event_time),
        fetched_at: DateTime::parse_from_rfc3339(&fetched_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        price: row.get(6)?,
        amount: row.get(7)?,
        realized_pnl: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(symbol: &str, kind: EventKind) -> Event {
        Event {
            id: None,
            trader_id: "trader-1".into(),
            symbol: symbol.into(),
            kind,
            event_time: Some(Utc::now()),
            fetched_at: Utc::now(),
            price: Some(100.0),
            amount: 1.0,
            realized_pnl: None,
        }
    }

    #[test]
    fn append_and_feed_round_trips() {
        let db = Db::open_in_memory().unwrap();
        db.append_event(&sample_event("BTCUSDT", EventKind::OpenLong))
            .unwrap();
        let feed = db.events_feed(Some("BTCUSDT"), None, 10).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, EventKind::OpenLong);
    }
}
