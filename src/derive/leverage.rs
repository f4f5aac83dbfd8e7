//! Leverage estimator (§4.6, C7).
//!
//! Priority chain for a hidden trader: (a) own 7d mean, (b) peer mean
//! within ±10 quality score over the same window, (c) a conservative
//! default. Always returns a value and a method label — never `None`.

use serde::Serialize;

use crate::models::Confidence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeverageMethod {
    OwnHistory,
    PeerAverage,
    Default,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LeverageEstimate {
    pub leverage: f64,
    pub method: LeverageMethod,
    pub confidence: Confidence,
}

const DEFAULT_LEVERAGE: f64 = 10.0;
/// Quality-score window used to find peers for the peer-average fallback.
pub const PEER_QUALITY_DELTA: f64 = 10.0;

/// `own_leverages_7d` are the trader's own snapshot leverages (>0) from
/// the last 7 days. `peer_leverages_7d` are leverages from traders whose
/// quality score is within `PEER_QUALITY_DELTA` of this trader's.
pub fn estimate_leverage(
    own_leverages_7d: &[f64],
    peer_leverages_7d: &[f64],
) -> LeverageEstimate {
    if !own_leverages_7d.is_empty() {
        let mean = own_leverages_7d.iter().sum::<f64>() / own_leverages_7d.len() as f64;
        let confidence = if own_leverages_7d.len() >= 20 {
            Confidence::High
        } else if own_leverages_7d.len() >= 10 {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        return LeverageEstimate {
            leverage: mean,
            method: LeverageMethod::OwnHistory,
            confidence,
        };
    }

    if !peer_leverages_7d.is_empty() {
        let mean = peer_leverages_7d.iter().sum::<f64>() / peer_leverages_7d.len() as f64;
        let confidence = if peer_leverages_7d.len() >= 50 {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        return LeverageEstimate {
            leverage: mean,
            method: LeverageMethod::PeerAverage,
            confidence,
        };
    }

    LeverageEstimate {
        leverage: DEFAULT_LEVERAGE,
        method: LeverageMethod::Default,
        confidence: Confidence::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_own_history_when_available() {
        let estimate = estimate_leverage(&[10.0, 20.0, 30.0], &[5.0]);
        assert_eq!(estimate.method, LeverageMethod::OwnHistory);
        assert_eq!(estimate.leverage, 20.0);
        assert_eq!(estimate.confidence, Confidence::Low);
    }

    #[test]
    fn falls_back_to_peer_average() {
        let estimate = estimate_leverage(&[], &vec![15.0; 60]);
        assert_eq!(estimate.method, LeverageMethod::PeerAverage);
        assert_eq!(estimate.confidence, Confidence::Medium);
    }

    #[test]
    fn falls_back_to_conservative_default() {
        let estimate = estimate_leverage(&[], &[]);
        assert_eq!(estimate.method, LeverageMethod::Default);
        assert_eq!(estimate.leverage, DEFAULT_LEVERAGE);
        assert_eq!(estimate.confidence, Confidence::Low);
    }
}
