//! Backtest-lite persistence (§4.15, C15).
//!
//! Only written when a run is requested with `persist=true` **and**
//! advanced metrics were actually computed for it — no partial rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::storage::Db;

#[derive(Debug, Clone)]
pub struct BacktestRunRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub config: Value,
    pub result: Value,
}

impl Db {
    pub fn insert_backtest_run(&self, record: &BacktestRunRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backtest_run (id, created_at, config_json, result_json, persisted)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![
                record.id,
                record.created_at.to_rfc3339(),
                serde_json::to_string(&record.config)?,
                serde_json::to_string(&record.result)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_backtest_run(&self, id: &str) -> anyhow::Result<Option<BacktestRunRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, created_at, config_json, result_json FROM backtest_run WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_backtest_runs(&self) -> anyhow::Result<Vec<BacktestRunRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, config_json, result_json FROM backtest_run ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_backtest_run(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM backtest_run WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<BacktestRunRecord> {
    let created_at_str: String = row.get(1)?;
    let config_json: String = row.get(2)?;
    let result_json: String = row.get(3)?;
    Ok(BacktestRunRecord {
        id: row.get(0)?,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        config: serde_json::from_str(&config_json).unwrap_or(Value::Null),
        result: serde_json::from_str(&result_json).unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_then_get_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let record = BacktestRunRecord {
            id: "bt-1".into(),
            created_at: Utc::now(),
            config: json!({"leverage": 10.0}),
            result: json!({"trades": 3}),
        };
        db.insert_backtest_run(&record).unwrap();
        let fetched = db.get_backtest_run("bt-1").unwrap().unwrap();
        assert_eq!(fetched.result["trades"], 3);
    }

    #[test]
    fn delete_removes_the_row() {
        let db = Db::open_in_memory().unwrap();
        let record = BacktestRunRecord {
            id: "bt-2".into(),
            created_at: Utc::now(),
            config: json!({}),
            result: json!({}),
        };
        db.insert_backtest_run(&record).unwrap();
        db.delete_backtest_run("bt-2").unwrap();
        assert!(db.get_backtest_run("bt-2").unwrap().is_none());
    }
}
