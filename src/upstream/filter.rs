//! Active-position filter (§4.1, C2).
//!
//! A position is active iff `amount != 0 || notional != 0 ||
//! unrealized_pnl != 0`. The audit counts each contributor independently —
//! the three `non_zero_*_count` fields are not mutually exclusive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::numeric::safe_number_field;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PositionAudit {
    pub total_count: usize,
    pub non_zero_amount_count: usize,
    pub non_zero_notional_count: usize,
    pub non_zero_unrealized_pnl_count: usize,
    pub dropped_because_all_zero_count: usize,
    pub filtered_active_positions_count: usize,
}

fn is_non_zero(value: Option<f64>) -> bool {
    value.map(|v| v != 0.0).unwrap_or(false)
}

/// Filters raw position rows down to the active set, returning the
/// filtered rows alongside the audit counts.
pub fn filter_active_positions(raw_positions: &[Value]) -> (Vec<Value>, PositionAudit) {
    let mut audit = PositionAudit {
        total_count: raw_positions.len(),
        ..Default::default()
    };

    let mut kept = Vec::new();
    for row in raw_positions {
        let amount = safe_number_field(row, "amount");
        let notional = safe_number_field(row, "notional");
        let unrealized_pnl = safe_number_field(row, "unrealizedPnL");

        let has_amount = is_non_zero(amount);
        let has_notional = is_non_zero(notional);
        let has_pnl = is_non_zero(unrealized_pnl);

        if has_amount {
            audit.non_zero_amount_count += 1;
        }
        if has_notional {
            audit.non_zero_notional_count += 1;
        }
        if has_pnl {
            audit.non_zero_unrealized_pnl_count += 1;
        }

        if has_amount || has_notional || has_pnl {
            kept.push(row.clone());
        } else {
            audit.dropped_because_all_zero_count += 1;
        }
    }

    audit.filtered_active_positions_count = kept.len();
    (kept, audit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_rows_with_all_zero_fields() {
        let rows = vec![
            json!({"amount": "0", "notional": "0", "unrealizedPnL": "0"}),
            json!({"amount": "1.5", "notional": "0", "unrealizedPnL": "0"}),
            json!({"amount": "0", "notional": "0", "unrealizedPnL": "-3.2"}),
        ];
        let (kept, audit) = filter_active_positions(&rows);
        assert_eq!(kept.len(), 2);
        assert_eq!(audit.total_count, 3);
        assert_eq!(audit.dropped_because_all_zero_count, 1);
        assert_eq!(audit.non_zero_amount_count, 1);
        assert_eq!(audit.non_zero_unrealized_pnl_count, 1);
        assert_eq!(audit.filtered_active_positions_count, 2);
    }

    #[test]
    fn counts_are_not_mutually_exclusive() {
        let rows = vec![json!({"amount": "1", "notional": "2", "unrealizedPnL": "3"})];
        let (_kept, audit) = filter_active_positions(&rows);
        assert_eq!(audit.non_zero_amount_count, 1);
        assert_eq!(audit.non_zero_notional_count, 1);
        assert_eq!(audit.non_zero_unrealized_pnl_count, 1);
    }
}
