//! Portfolio store (§3, §4.12).

use rusqlite::{params, OptionalExtension};

use crate::models::Portfolio;
use crate::storage::Db;

impl Db {
    pub fn upsert_portfolio(&self, portfolio: &Portfolio) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO portfolio
                (id, name, initial_balance, current_balance, kelly_fraction, min_sample_size,
                 max_risk_per_trade, max_portfolio_risk, max_open_positions, default_slippage_bps,
                 default_commission_bps)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                current_balance = excluded.current_balance,
                kelly_fraction = excluded.kelly_fraction,
                min_sample_size = excluded.min_sample_size,
                max_risk_per_trade = excluded.max_risk_per_trade,
                max_portfolio_risk = excluded.max_portfolio_risk,
                max_open_positions = excluded.max_open_positions,
                default_slippage_bps = excluded.default_slippage_bps,
                default_commission_bps = excluded.default_commission_bps",
            params![
                portfolio.id,
                portfolio.name,
                portfolio.initial_balance,
                portfolio.current_balance,
                portfolio.kelly_fraction,
                portfolio.min_sample_size as i64,
                portfolio.max_risk_per_trade,
                portfolio.max_portfolio_risk,
                portfolio.max_open_positions as i64,
                portfolio.default_slippage_bps,
                portfolio.default_commission_bps,
            ],
        )?;
        Ok(())
    }

    pub fn get_portfolio(&self, id: &str) -> anyhow::Result<Option<Portfolio>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, initial_balance, current_balance, kelly_fraction, min_sample_size,
                        max_risk_per_trade, max_portfolio_risk, max_open_positions,
                        default_slippage_bps, default_commission_bps
                 FROM portfolio WHERE id = ?1",
                params![id],
                row_to_portfolio,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_portfolios(&self) -> anyhow::Result<Vec<Portfolio>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, initial_balance, current_balance, kelly_fraction, min_sample_size,
                    max_risk_per_trade, max_portfolio_risk, max_open_positions,
                    default_slippage_bps, default_commission_bps
             FROM portfolio",
        )?;
        let rows = stmt
            .query_map(params![], row_to_portfolio)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_portfolio_balance(&self, id: &str, new_balance: f64) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE portfolio SET current_balance = ?1 WHERE id = ?2",
            params![new_balance, id],
        )?;
        Ok(())
    }

    pub fn delete_portfolio(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM portfolio WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_portfolio(row: &rusqlite::Row) -> rusqlite::Result<Portfolio> {
    let min_sample_size: i64 = row.get(5)?;
    let max_open_positions: i64 = row.get(8)?;
    Ok(Portfolio {
        id: row.get(0)?,
        name: row.get(1)?,
        initial_balance: row.get(2)?,
        current_balance: row.get(3)?,
        kelly_fraction: row.get(4)?,
        min_sample_size: min_sample_size.max(0) as usize,
        max_risk_per_trade: row.get(6)?,
        max_portfolio_risk: row.get(7)?,
        max_open_positions: max_open_positions.max(0) as usize,
        default_slippage_bps: row.get(9)?,
        default_commission_bps: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let portfolio = Portfolio::default_with_id("default", 10_000.0);
        db.upsert_portfolio(&portfolio).unwrap();
        let fetched = db.get_portfolio("default").unwrap().unwrap();
        assert_eq!(fetched.initial_balance, 10_000.0);
    }
}
