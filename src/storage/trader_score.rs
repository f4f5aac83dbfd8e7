//! Trader score store (§4.4/§4.5, C5/C6) — one row per trader, upserted.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::models::{Confidence, Segment, TraderScore};
use crate::storage::Db;

fn confidence_to_str(c: Confidence) -> &'static str {
    match c {
        Confidence::Low => "low",
        Confidence::Medium => "medium",
        Confidence::High => "high",
    }
}

fn confidence_from_str(s: &str) -> Confidence {
    match s {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        _ => Confidence::Low,
    }
}

fn segment_to_str(s: Segment) -> &'static str {
    match s {
        Segment::Visible => "visible",
        Segment::Hidden => "hidden",
        Segment::Unknown => "unknown",
    }
}

fn segment_from_str(s: &str) -> Segment {
    match s {
        "visible" => Segment::Visible,
        "hidden" => Segment::Hidden,
        _ => Segment::Unknown,
    }
}

impl Db {
    pub fn upsert_trader_score(&self, score: &TraderScore) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trader_score
                (trader_id, quality_score, confidence, win_rate, sample_size, trader_weight, updated_at, segment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(trader_id) DO UPDATE SET
                quality_score = excluded.quality_score,
                confidence = excluded.confidence,
                win_rate = excluded.win_rate,
                sample_size = excluded.sample_size,
                trader_weight = excluded.trader_weight,
                updated_at = excluded.updated_at,
                segment = excluded.segment",
            params![
                score.trader_id,
                score.quality_score,
                confidence_to_str(score.confidence),
                score.win_rate,
                score.sample_size as i64,
                score.trader_weight,
                score.updated_at.to_rfc3339(),
                segment_to_str(score.segment),
            ],
        )?;
        Ok(())
    }

    pub fn get_trader_score(&self, trader_id: &str) -> anyhow::Result<Option<TraderScore>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT trader_id, quality_score, confidence, win_rate, sample_size, trader_weight, updated_at, segment
                 FROM trader_score WHERE trader_id = ?1",
                params![trader_id],
                row_to_score,
            )
            .optional()?;
        Ok(row)
    }

    /// Every scored trader — heatmap/consensus/leaderboard queries pull
    /// weights from this rather than re-deriving per request.
    pub fn list_trader_scores(&self) -> anyhow::Result<Vec<TraderScore>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trader_id, quality_score, confidence, win_rate, sample_size, trader_weight, updated_at, segment
             FROM trader_score",
        )?;
        let rows = stmt
            .query_map(params![], row_to_score)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All scores within `quality_delta` of `quality_score`, excluding
    /// `trader_id` itself — used by the leverage-estimator peer fallback
    /// (§4.6).
    pub fn peer_scores_near(
        &self,
        trader_id: &str,
        quality_score: f64,
        quality_delta: f64,
    ) -> anyhow::Result<Vec<TraderScore>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trader_id, quality_score, confidence, win_rate, sample_size, trader_weight, updated_at, segment
             FROM trader_score
             WHERE trader_id != ?1 AND ABS(quality_score - ?2) <= ?3",
        )?;
        let rows = stmt
            .query_map(params![trader_id, quality_score, quality_delta], row_to_score)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_score(row: &rusqlite::Row) -> rusqlite::Result<TraderScore> {
    let confidence_str: String = row.get(2)?;
    let sample_size: i64 = row.get(4)?;
    let updated_at_str: String = row.get(6)?;
    let segment_str: String = row.get(7)?;
    Ok(TraderScore {
        trader_id: row.get(0)?,
        quality_score: row.get(1)?,
        confidence: confidence_from_str(&confidence_str),
        win_rate: row.get(3)?,
        sample_size: sample_size.max(0) as usize,
        trader_weight: row.get(5)?,
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        segment: segment_from_str(&segment_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let score = TraderScore {
            trader_id: "trader-1".into(),
            quality_score: 72.0,
            confidence: Confidence::Medium,
            win_rate: Some(0.6),
            sample_size: 30,
            trader_weight: 0.5,
            updated_at: Utc::now(),
            segment: Segment::Visible,
        };
        db.upsert_trader_score(&score).unwrap();
        let fetched = db.get_trader_score("trader-1").unwrap().unwrap();
        assert_eq!(fetched.quality_score, 72.0);
        assert_eq!(fetched.confidence, Confidence::Medium);
    }
}
