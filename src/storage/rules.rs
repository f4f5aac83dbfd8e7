//! Auto-trigger rule and insights rule stores (§4.11, §4.14) — both are
//! singletons addressed by a fixed id (§9, "Singletons by id").

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::models::{AutoTriggerRule, InsightsRule, SegmentFilter};
use crate::storage::Db;

fn segment_filter_to_str(s: SegmentFilter) -> &'static str {
    match s {
        SegmentFilter::Visible => "visible",
        SegmentFilter::Hidden => "hidden",
        SegmentFilter::Both => "both",
    }
}

fn segment_filter_from_str(s: &str) -> SegmentFilter {
    match s {
        "visible" => SegmentFilter::Visible,
        "hidden" => SegmentFilter::Hidden,
        _ => SegmentFilter::Both,
    }
}

impl Db {
    pub fn upsert_auto_trigger_rule(&self, rule: &AutoTriggerRule) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO auto_trigger_rule
                (id, enabled, segment_filter, time_range_ms, min_traders, min_confidence,
                 min_sentiment_abs, leverage, margin_notional, cooldown_minutes, last_run_at,
                 portfolio_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                segment_filter = excluded.segment_filter,
                time_range_ms = excluded.time_range_ms,
                min_traders = excluded.min_traders,
                min_confidence = excluded.min_confidence,
                min_sentiment_abs = excluded.min_sentiment_abs,
                leverage = excluded.leverage,
                margin_notional = excluded.margin_notional,
                cooldown_minutes = excluded.cooldown_minutes,
                last_run_at = excluded.last_run_at,
                portfolio_id = excluded.portfolio_id",
            params![
                rule.id,
                rule.enabled as i64,
                segment_filter_to_str(rule.segment_filter),
                rule.time_range_ms,
                rule.min_traders as i64,
                rule.min_confidence,
                rule.min_sentiment_abs,
                rule.leverage,
                rule.margin_notional,
                rule.cooldown_minutes,
                rule.last_run_at.map(|t| t.to_rfc3339()),
                rule.portfolio_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_auto_trigger_rule(&self, id: &str) -> anyhow::Result<Option<AutoTriggerRule>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, enabled, segment_filter, time_range_ms, min_traders, min_confidence,
                        min_sentiment_abs, leverage, margin_notional, cooldown_minutes, last_run_at,
                        portfolio_id
                 FROM auto_trigger_rule WHERE id = ?1",
                params![id],
                row_to_rule,
            )
            .optional()?;
        Ok(row)
    }

    /// Marks the rule's cooldown clock, scoped to this rule id only — the
    /// auto-trigger engine serializes runs per rule id (§4.14, §5).
    pub fn mark_rule_run(&self, id: &str, ran_at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE auto_trigger_rule SET last_run_at = ?1 WHERE id = ?2",
            params![ran_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn upsert_insights_rule(&self, rule: &InsightsRule) -> anyhow::Result<()> {
        let payload_json = serde_json::to_string(rule)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO insights_rule (id, payload_json) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET payload_json = excluded.payload_json",
            params![rule.id, payload_json],
        )?;
        Ok(())
    }

    pub fn get_insights_rule(&self, id: &str) -> anyhow::Result<Option<InsightsRule>> {
        let conn = self.conn.lock();
        let payload_json: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM insights_rule WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload_json.and_then(|s| serde_json::from_str(&s).ok()))
    }
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<AutoTriggerRule> {
    let enabled: i64 = row.get(1)?;
    let segment_filter_str: String = row.get(2)?;
    let min_traders: i64 = row.get(4)?;
    let last_run_at: Option<String> = row.get(10)?;
    Ok(AutoTriggerRule {
        id: row.get(0)?,
        enabled: enabled != 0,
        segment_filter: segment_filter_from_str(&segment_filter_str),
        time_range_ms: row.get(3)?,
        min_traders: min_traders.max(0) as usize,
        min_confidence: row.get(5)?,
        min_sentiment_abs: row.get(6)?,
        leverage: row.get(7)?,
        margin_notional: row.get(8)?,
        cooldown_minutes: row.get(9)?,
        last_run_at: last_run_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        portfolio_id: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_trigger_rule_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let rule = AutoTriggerRule::default_rule("default");
        db.upsert_auto_trigger_rule(&rule).unwrap();
        let fetched = db.get_auto_trigger_rule(&rule.id).unwrap().unwrap();
        assert_eq!(fetched.min_traders, 3);
        assert!(!fetched.enabled);
    }

    #[test]
    fn insights_rule_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let rule = InsightsRule::default_rule();
        db.upsert_insights_rule(&rule).unwrap();
        let fetched = db.get_insights_rule(&rule.id).unwrap().unwrap();
        assert_eq!(fetched.balanced.crowded_min_traders, 3);
    }
}
