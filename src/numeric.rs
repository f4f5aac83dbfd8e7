//! Numeric parsing helpers (§9).
//!
//! Upstream payloads carry numbers as strings, bare JSON numbers, or
//! sometimes nothing at all. Every read-through accessor in the derivation
//! layer goes through `safe_number`, which returns `None` on NaN/Infinity
//! rather than silently coercing. Callers decide per-contract whether
//! `None` becomes zero (weighted sums, the active-position filter) or stays
//! `None` (confidence thresholds, cooldowns) — never the other way around.

use serde_json::Value;

/// Parses a JSON value that may be a string or a number into a finite f64.
/// Returns `None` for null, non-numeric strings, NaN, or +/-infinity.
pub fn safe_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    if parsed.is_finite() {
        Some(parsed)
    } else {
        None
    }
}

/// Reads a field out of an object-shaped `Value` and applies `safe_number`.
pub fn safe_number_field(obj: &Value, field: &str) -> Option<f64> {
    obj.get(field).and_then(safe_number)
}

/// `None` is treated as zero — only use where the contract says so
/// explicitly (active-position filter §4.1, weighted sums §4.9).
pub fn or_zero(value: Option<f64>) -> f64 {
    value.unwrap_or(0.0)
}

/// Rounds to 4 decimal places (monetary fields, §4.12).
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Rounds to the given number of decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Clamps a value into `[lo, hi]`, returning `0.0` rather than propagating
/// NaN (§9: heatmap numeric edge cases must never reach clients as NaN).
pub fn clamp_or_zero(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        0.0
    }
}

/// Divides `numerator / denominator`, returning `0.0` on a zero or
/// non-finite denominator instead of propagating NaN/Infinity to clients.
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() > f64::EPSILON && denominator.is_finite() && numerator.is_finite() {
        numerator / denominator
    } else {
        0.0
    }
}

/// Formats a price at the precision boundaries described in §8:
/// sub-cent values get 6 decimals, single-digit values get 4, larger
/// values get 2 (`0.00999` -> 6dp, `1.0` -> 4dp, `1000.0` -> 2dp).
pub fn format_price(value: f64) -> String {
    if value.abs() < 0.01 {
        format!("{:.6}", value)
    } else if value.abs() < 10.0 {
        format!("{:.4}", value)
    } else {
        format!("{:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_strings_and_numbers() {
        assert_eq!(safe_number(&json!("1.5")), Some(1.5));
        assert_eq!(safe_number(&json!(2.25)), Some(2.25));
        assert_eq!(safe_number(&json!(" 3 ")), Some(3.0));
    }

    #[test]
    fn rejects_non_finite_and_garbage() {
        assert_eq!(safe_number(&json!("not-a-number")), None);
        assert_eq!(safe_number(&Value::Null), None);
        assert_eq!(safe_number(&json!("NaN")), None);
    }

    #[test]
    fn price_formatting_boundaries() {
        assert_eq!(format_price(0.00999), "0.009990");
        assert_eq!(format_price(1.0), "1.0000");
        assert_eq!(format_price(1000.0), "1000.00");
    }

    #[test]
    fn safe_div_avoids_nan() {
        assert_eq!(safe_div(10.0, 0.0), 0.0);
        assert_eq!(safe_div(f64::NAN, 2.0), 0.0);
        assert_eq!(safe_div(10.0, 2.0), 5.0);
    }
}
