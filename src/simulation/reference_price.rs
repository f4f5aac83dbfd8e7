//! Reference-price resolver (§4.13).

/// Averages up to the 60 most recent snapshots for a symbol, preferring
/// `mark_price` when positive, else `entry_price` (both must be >0). A
/// snapshot contributes `None` if neither is usable.
pub fn resolve_from_snapshots(snapshots: &[(f64, f64)]) -> Option<f64> {
    let usable: Vec<f64> = snapshots
        .iter()
        .rev()
        .take(60)
        .filter_map(|&(mark_price, entry_price)| {
            if mark_price > 0.0 {
                Some(mark_price)
            } else if entry_price > 0.0 {
                Some(entry_price)
            } else {
                None
            }
        })
        .collect();

    if usable.is_empty() {
        return None;
    }
    Some(usable.iter().sum::<f64>() / usable.len() as f64)
}

/// Full resolution: snapshot average first, falling back to the latest
/// Event's positive price (§4.13). Returns `None` when neither exists.
pub fn resolve_reference_price(
    snapshots: &[(f64, f64)],
    latest_event_price: Option<f64>,
) -> Option<f64> {
    if let Some(price) = resolve_from_snapshots(snapshots) {
        return Some(price);
    }
    latest_event_price.filter(|p| *p > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_mark_price_over_entry_price() {
        let snapshots = vec![(100.0, 90.0), (0.0, 95.0)];
        let avg = resolve_from_snapshots(&snapshots).unwrap();
        assert_eq!(avg, (100.0 + 95.0) / 2.0);
    }

    #[test]
    fn falls_back_to_event_price_when_no_snapshots() {
        assert_eq!(resolve_reference_price(&[], Some(42.0)), Some(42.0));
        assert_eq!(resolve_reference_price(&[], None), None);
    }

    #[test]
    fn caps_at_sixty_most_recent_snapshots() {
        let snapshots: Vec<(f64, f64)> = (0..100).map(|i| (i as f64 + 1.0, 0.0)).collect();
        let avg = resolve_from_snapshots(&snapshots).unwrap();
        let expected: f64 = (40..100).map(|i| i as f64 + 1.0).sum::<f64>() / 60.0;
        assert_eq!(avg, expected);
    }
}
