//! Trader weight (§4.5, C6).

use crate::models::Confidence;
use crate::numeric::round4;

/// `trader_weight = base_weight * (0.7 + 0.3*win_adj) * availability_penalty`,
/// rounded to 4 decimals.
pub fn compute_trader_weight(
    quality_score: f64,
    confidence: Confidence,
    win_rate: Option<f64>,
    position_show: bool,
) -> f64 {
    let base_weight = (quality_score / 100.0) * confidence.factor();
    let win_adj = win_rate.unwrap_or(0.0).clamp(0.0, 1.0);
    let availability_penalty = if position_show { 1.0 } else { 0.6 };
    round4(base_weight * (0.7 + 0.3 * win_adj) * availability_penalty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_worked_example() {
        // quality 80, medium confidence, win_rate 0.5, visible.
        let weight = compute_trader_weight(80.0, Confidence::Medium, Some(0.5), true);
        let base_weight = 0.8 * 0.7;
        let expected = round4(base_weight * (0.7 + 0.3 * 0.5) * 1.0);
        assert_eq!(weight, expected);
    }

    #[test]
    fn hidden_trader_gets_availability_penalty() {
        let visible = compute_trader_weight(80.0, Confidence::High, Some(0.6), true);
        let hidden = compute_trader_weight(80.0, Confidence::High, Some(0.6), false);
        assert!(hidden < visible);
    }

    #[test]
    fn missing_win_rate_treated_as_zero() {
        let weight = compute_trader_weight(50.0, Confidence::Low, None, true);
        let base_weight = 0.5 * 0.4;
        assert_eq!(weight, round4(base_weight * 0.7));
    }
}
