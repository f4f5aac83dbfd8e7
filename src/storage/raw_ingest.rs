//! Raw ingest store (§4.3, C4).
//!
//! Append-only, keyed by `(trader_id, fetched_at)`. Accepts arbitrary
//! payload schema — only `positions_count`, `orders_count`, and
//! `time_range` are derived and stored out-of-band; everything else rides
//! along as opaque JSON.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::storage::Db;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIngestRecord {
    pub trader_id: String,
    pub fetched_at: DateTime<Utc>,
    pub positions_count: i64,
    pub orders_count: i64,
    pub time_range: Option<String>,
    pub payload: Value,
    pub parity_ok: Option<bool>,
}

/// Derives the stored counters from an arbitrary payload and computes the
/// parity signal against `positionAudit.filteredActivePositionsCount`
/// when present (§4.3).
fn derive_counts(payload: &Value) -> (i64, i64, Option<String>, Option<bool>) {
    let positions_count = payload
        .get("activePositions")
        .and_then(|v| v.as_array())
        .map(|a| a.len() as i64)
        .unwrap_or(0);

    let orders_count = payload
        .get("orderHistory")
        .and_then(|oh| oh.get("allOrders"))
        .and_then(|v| v.as_array())
        .map(|a| a.len() as i64)
        .unwrap_or(0);

    let time_range = payload
        .get("timeRange")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let parity_ok = payload
        .get("positionAudit")
        .and_then(|audit| audit.get("filteredActivePositionsCount"))
        .and_then(|v| v.as_i64())
        .map(|audited| audited == positions_count);

    (positions_count, orders_count, time_range, parity_ok)
}

impl Db {
    pub fn insert_raw_ingest(&self, trader_id: &str, payload: &Value) -> anyhow::Result<()> {
        let fetched_at = payload
            .get("fetchedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let (positions_count, orders_count, time_range, parity_ok) = derive_counts(payload);

        if let Some(ok) = parity_ok {
            if ok {
                info!(trader_id, positions_count, "raw ingest parity ok");
            } else {
                warn!(trader_id, positions_count, "raw ingest parity mismatch");
            }
        }

        let payload_json = serde_json::to_string(payload)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO raw_ingest
                (trader_id, fetched_at, positions_count, orders_count, time_range, payload_json, parity_ok)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(trader_id, fetched_at) DO UPDATE SET
                positions_count = excluded.positions_count,
                orders_count = excluded.orders_count,
                time_range = excluded.time_range,
                payload_json = excluded.payload_json,
                parity_ok = excluded.parity_ok",
            params![
                trader_id,
                fetched_at.to_rfc3339(),
                positions_count,
                orders_count,
                time_range,
                payload_json,
                parity_ok.map(|b| b as i64),
            ],
        )?;
        Ok(())
    }

    /// Latest record for a trader — greatest `fetched_at` (§4.3).
    pub fn latest_raw_ingest(&self, trader_id: &str) -> anyhow::Result<Option<RawIngestRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT trader_id, fetched_at, positions_count, orders_count, time_range, payload_json, parity_ok
                 FROM raw_ingest WHERE trader_id = ?1 ORDER BY fetched_at DESC LIMIT 1",
                params![trader_id],
                row_to_record,
            )
            .optional()?;
        Ok(row)
    }

    /// Distinct traders ever ingested — the universe diagnostics and
    /// derivation sweeps iterate over.
    pub fn list_trader_ids(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT trader_id FROM raw_ingest ORDER BY trader_id")?;
        let rows = stmt
            .query_map(params![], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_raw_ingest(
        &self,
        trader_id: &str,
        limit: i64,
        include_payload: bool,
    ) -> anyhow::Result<Vec<RawIngestRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trader_id, fetched_at, positions_count, orders_count, time_range, payload_json, parity_ok
             FROM raw_ingest WHERE trader_id = ?1 ORDER BY fetched_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![trader_id, limit], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|mut r| {
                if !include_payload {
                    r.payload = Value::Null;
                }
                r
            })
            .collect())
    }

    /// Most recent ingest records across every trader, newest first —
    /// the cross-trader activity feed (§4, "latest-records feed").
    /// Payloads are never included; this is an activity stream, not a
    /// payload dump.
    pub fn latest_records_feed(
        &self,
        limit: i64,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<RawIngestRecord>> {
        let conn = self.conn.lock();
        let limit = limit.clamp(1, 1000);
        let mut stmt = conn.prepare(
            "SELECT trader_id, fetched_at, positions_count, orders_count, time_range, payload_json, parity_ok
             FROM raw_ingest
             WHERE (?1 IS NULL OR fetched_at >= ?1)
             ORDER BY fetched_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since.map(|t| t.to_rfc3339()), limit], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|mut r| {
                r.payload = Value::Null;
                r
            })
            .collect())
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<RawIngestRecord> {
    let fetched_at_str: String = row.get(1)?;
    let payload_json: String = row.get(5)?;
    let parity_ok: Option<i64> = row.get(6)?;
    Ok(RawIngestRecord {
        trader_id: row.get(0)?,
        fetched_at: DateTime::parse_from_rfc3339(&fetched_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        positions_count: row.get(2)?,
        orders_count: row.get(3)?,
        time_range: row.get(4)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        parity_ok: parity_ok.map(|v| v != 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derives_counts_and_parity() {
        let payload = json!({
            "fetchedAt": Utc::now().to_rfc3339(),
            "timeRange": "30D",
            "activePositions": [{}, {}],
            "positionAudit": {"filteredActivePositionsCount": 2},
            "orderHistory": {"allOrders": [{}, {}, {}]},
        });
        let (positions, orders, time_range, parity) = derive_counts(&payload);
        assert_eq!(positions, 2);
        assert_eq!(orders, 3);
        assert_eq!(time_range.as_deref(), Some("30D"));
        assert_eq!(parity, Some(true));
    }

    #[test]
    fn insert_and_fetch_latest_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let payload = json!({"fetchedAt": Utc::now().to_rfc3339(), "activePositions": []});
        db.insert_raw_ingest("trader-1", &payload).unwrap();
        let latest = db.latest_raw_ingest("trader-1").unwrap().unwrap();
        assert_eq!(latest.trader_id, "trader-1");
        assert_eq!(latest.positions_count, 0);
    }
}
