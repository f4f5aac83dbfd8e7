//! Simulated position store (§4.12, C13).

use chrono::Utc;

use crate::error::AppError;
use crate::models::{
    CloseReason, Direction, PositionSource, SimulatedPosition, SimulatedStatus,
};
use crate::numeric::round4;
use crate::storage::Db;

pub struct OpenRequest {
    pub platform: String,
    pub symbol: String,
    pub direction: Direction,
    pub leverage: f64,
    pub margin_notional: f64,
    pub entry_price: f64,
    pub slippage_bps: f64,
    pub commission_bps: f64,
    pub portfolio_id: String,
    pub source: PositionSource,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
}

/// Applies slippage against the trade direction: a worse fill on entry,
/// the opposite sense on exit (§4.12). `is_entry` and `direction`
/// together determine which side of the spread applies.
fn effective_price(base_price: f64, slippage_bps: f64, direction: Direction, is_entry: bool) -> f64 {
    let buying = match (direction, is_entry) {
        (Direction::Long, true) => true,
        (Direction::Long, false) => false,
        (Direction::Short, true) => false,
        (Direction::Short, false) => true,
    };
    let factor = slippage_bps / 10_000.0;
    if buying {
        base_price * (1.0 + factor)
    } else {
        base_price * (1.0 - factor)
    }
}

fn commission(position_notional: f64, commission_bps: f64) -> f64 {
    position_notional * commission_bps / 10_000.0
}

/// Portfolio-risk precheck: aggregate margin of open positions + the new
/// margin against `max_portfolio_risk * current_balance`, and open count
/// against `max_open_positions` (§4.12).
pub fn precheck_portfolio_risk(
    open_margin_total: f64,
    new_margin: f64,
    current_balance: f64,
    max_portfolio_risk: f64,
    open_count: usize,
    max_open_positions: usize,
) -> Result<(), AppError> {
    if open_count >= max_open_positions {
        return Err(AppError::portfolio_risk(
            "max open positions reached",
            serde_json::json!({"openCount": open_count, "maxOpenPositions": max_open_positions}),
        ));
    }
    let projected = open_margin_total + new_margin;
    let cap = max_portfolio_risk * current_balance;
    if projected > cap {
        return Err(AppError::portfolio_risk(
            "portfolio risk cap exceeded",
            serde_json::json!({"projectedMargin": projected, "cap": cap}),
        ));
    }
    Ok(())
}

pub fn open_simulated_position(db: &Db, req: OpenRequest) -> anyhow::Result<SimulatedPosition> {
    if req.margin_notional <= 0.0 {
        anyhow::bail!("margin_notional must be > 0");
    }
    if req.leverage < 1.0 {
        anyhow::bail!("leverage must be >= 1");
    }

    let position_notional = req.margin_notional * req.leverage;
    let effective_entry_price =
        effective_price(req.entry_price, req.slippage_bps, req.direction, true);
    let entry_commission = commission(position_notional, req.commission_bps);

    let now = Utc::now();
    let id = db.insert_simulated_position(&SimulatedPosition {
        id: 0,
        platform: req.platform,
        symbol: req.symbol,
        direction: req.direction,
        status: SimulatedStatus::Open,
        leverage: req.leverage,
        margin_notional: round4(req.margin_notional),
        position_notional: round4(position_notional),
        entry_price: round4(req.entry_price),
        effective_entry_price: round4(effective_entry_price),
        exit_price: None,
        opened_at: now,
        closed_at: None,
        close_reason: None,
        close_trigger_trader_id: None,
        close_trigger_event_kind: None,
        pnl_usdt: None,
        roi_pct: None,
        stop_loss_price: req.stop_loss_price,
        take_profit_price: req.take_profit_price,
        trailing_stop_pct: req.trailing_stop_pct,
        peak_favorable_price: Some(effective_entry_price),
        slippage_bps: req.slippage_bps,
        commission_bps: req.commission_bps,
        portfolio_id: req.portfolio_id.clone(),
        source: req.source,
    })?;

    if let Some(portfolio) = db.get_portfolio(&req.portfolio_id)? {
        db.update_portfolio_balance(
            &req.portfolio_id,
            portfolio.current_balance - req.margin_notional - entry_commission,
        )?;
    }

    db.get_simulated_position(id)?
        .ok_or_else(|| anyhow::anyhow!("simulated position vanished after insert"))
}

/// Closes a position, computing PnL/ROI and crediting the portfolio
/// (§4.12). `exit_price` is the raw market price before slippage.
pub fn close_simulated_position(
    db: &Db,
    id: i64,
    exit_price: f64,
    reason: CloseReason,
) -> anyhow::Result<SimulatedPosition> {
    let position = db
        .get_simulated_position(id)?
        .ok_or_else(|| anyhow::anyhow!("simulated position {id} not found"))?;

    let effective_exit_price =
        effective_price(exit_price, position.slippage_bps, position.direction, false);

    let move_pct = match position.direction {
        Direction::Long => {
            (effective_exit_price - position.effective_entry_price) / position.effective_entry_price
        }
        Direction::Short => {
            (position.effective_entry_price - effective_exit_price) / position.effective_entry_price
        }
    };

    let gross_pnl = position.position_notional * move_pct;
    let exit_commission = commission(position.position_notional, position.commission_bps);
    let net_pnl = gross_pnl - exit_commission;
    let roi_pct = net_pnl / position.margin_notional * 100.0;

    let closed_at = Utc::now();
    db.close_simulated_position(
        id,
        round4(effective_exit_price),
        closed_at,
        reason,
        round4(net_pnl),
        round4(roi_pct),
    )?;

    if let Some(portfolio) = db.get_portfolio(&position.portfolio_id)? {
        db.update_portfolio_balance(
            &position.portfolio_id,
            portfolio.current_balance + position.margin_notional + net_pnl,
        )?;
    }

    db.get_simulated_position(id)?
        .ok_or_else(|| anyhow::anyhow!("simulated position {id} vanished after close"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slippage_worsens_entry_and_exit_in_trade_direction() {
        let long_entry = effective_price(100.0, 10.0, Direction::Long, true);
        let long_exit = effective_price(100.0, 10.0, Direction::Long, false);
        assert!(long_entry > 100.0);
        assert!(long_exit < 100.0);

        let short_entry = effective_price(100.0, 10.0, Direction::Short, true);
        let short_exit = effective_price(100.0, 10.0, Direction::Short, false);
        assert!(short_entry < 100.0);
        assert!(short_exit > 100.0);
    }

    #[test]
    fn precheck_blocks_when_open_count_reached() {
        let result = precheck_portfolio_risk(0.0, 100.0, 10_000.0, 0.3, 10, 10);
        assert!(result.is_err());
    }

    #[test]
    fn precheck_blocks_when_risk_cap_exceeded() {
        let result = precheck_portfolio_risk(2_900.0, 200.0, 10_000.0, 0.3, 1, 10);
        assert!(result.is_err());
    }

    #[test]
    fn precheck_allows_within_caps() {
        let result = precheck_portfolio_risk(100.0, 100.0, 10_000.0, 0.3, 1, 10);
        assert!(result.is_ok());
    }
}
