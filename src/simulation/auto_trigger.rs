//! Auto-trigger engine (§4.14, C14).
//!
//! One pass, strictly ordered: reconcile, compute consensus (supplied by
//! the caller), select candidates, reverse disagreeing positions, apply
//! cooldown, open new positions. Single-writer per rule id is enforced by
//! the caller serializing passes per `rule.id` (§5) — this module itself
//! assumes exclusive access to the rule's AUTO positions for the duration
//! of the call.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::consensus::ConsensusResult;
use crate::models::{AutoTriggerRule, CloseReason, ConsensusDirection, Direction, PositionSource};
use crate::numeric::round4;
use crate::storage::Db;

use super::store::{close_simulated_position, open_simulated_position, OpenRequest};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AutoTriggerDecision {
    ReconcileClose {
        position_id: i64,
        symbol: String,
        trigger_trader_id: String,
    },
    Reverse {
        closed_position_id: i64,
        opened_position_id: Option<i64>,
        symbol: String,
        new_direction: Direction,
    },
    Open {
        position_id: Option<i64>,
        symbol: String,
        direction: Direction,
    },
    CooldownSkip {
        symbol: String,
    },
}

fn consensus_direction_matches(direction: Direction, consensus: ConsensusDirection) -> bool {
    matches!(
        (direction, consensus),
        (Direction::Long, ConsensusDirection::Long) | (Direction::Short, ConsensusDirection::Short)
    )
}

fn candidate_filter(rule: &AutoTriggerRule, result: &ConsensusResult) -> bool {
    result.direction != ConsensusDirection::Neutral
        && result.total_traders >= rule.min_traders
        && (result.confidence_score as f64) >= rule.min_confidence
        && result.sentiment_score.abs() * 100.0 >= rule.min_sentiment_abs
}

/// Runs one auto-trigger pass. `consensus` holds the rule's live consensus
/// results (already computed by the caller against `{time_range,
/// segment_filter}`); `reference_prices` is a per-symbol mark-price map.
/// When `commit` is `false` nothing is written and `last_run_at` is left
/// untouched.
pub fn run_auto_trigger_pass(
    db: &Db,
    rule: &AutoTriggerRule,
    consensus: &[ConsensusResult],
    reference_prices: &HashMap<String, f64>,
    now: DateTime<Utc>,
    commit: bool,
) -> anyhow::Result<Vec<AutoTriggerDecision>> {
    let mut decisions = Vec::new();
    let mut open_auto = db
        .open_positions_for_portfolio(&rule.portfolio_id)?
        .into_iter()
        .filter(|p| p.source == PositionSource::Auto)
        .collect::<Vec<_>>();

    // 1. Reconcile: close any AUTO position against the first matching
    // close event after it opened.
    let mut still_open = Vec::new();
    for position in open_auto.drain(..) {
        let events = db.events_for_replay(&position.symbol)?;
        let matching = events.into_iter().find(|event| {
            event.kind.direction() == position.direction
                && !event.kind.is_open()
                && event
                    .event_time
                    .unwrap_or(event.fetched_at)
                    > position.opened_at
        });

        if let Some(event) = matching {
            let exit_price = event.price.filter(|p| *p > 0.0).unwrap_or(position.entry_price);
            decisions.push(AutoTriggerDecision::ReconcileClose {
                position_id: position.id,
                symbol: position.symbol.clone(),
                trigger_trader_id: event.trader_id.clone(),
            });
            if commit {
                close_simulated_position(db, position.id, exit_price, CloseReason::FirstTraderClose)?;
                db.set_close_trigger(position.id, &event.trader_id, event.kind)?;
            }
        } else {
            still_open.push(position);
        }
    }

    // 2 & 3. Candidates from the supplied consensus snapshot.
    let candidates: HashMap<&str, &ConsensusResult> = consensus
        .iter()
        .filter(|r| candidate_filter(rule, r))
        .map(|r| (r.symbol.as_str(), r))
        .collect::<HashMap<&str, &ConsensusResult>>();

    // 4. Reverse any still-open AUTO position disagreeing with its
    // symbol's candidate, strictly before any opens.
    let mut reversed_symbols = std::collections::HashSet::new();
    let mut remaining = Vec::new();
    for position in still_open {
        let candidate = candidates.get(position.symbol.as_str());
        let disagrees = match candidate {
            Some(result) => !consensus_direction_matches(position.direction, result.direction),
            None => false,
        };
        if disagrees {
            let candidate = candidates[position.symbol.as_str()];
            let new_direction = if candidate.direction == ConsensusDirection::Long {
                Direction::Long
            } else {
                Direction::Short
            };
            let reference_price = reference_prices.get(&position.symbol).copied();
            let mut opened_id = None;
            if commit {
                close_simulated_position(
                    db,
                    position.id,
                    reference_price.unwrap_or(position.entry_price),
                    CloseReason::AutoReverseSignal,
                )?;
                if let Some(price) = reference_price {
                    let reopened = open_simulated_position(
                        db,
                        OpenRequest {
                            platform: position.platform.clone(),
                            symbol: position.symbol.clone(),
                            direction: new_direction,
                            leverage: rule.leverage,
                            margin_notional: rule.margin_notional,
                            entry_price: price,
                            slippage_bps: position.slippage_bps,
                            commission_bps: position.commission_bps,
                            portfolio_id: rule.portfolio_id.clone(),
                            source: PositionSource::Auto,
                            stop_loss_price: None,
                            take_profit_price: None,
                            trailing_stop_pct: None,
                        },
                    )?;
                    opened_id = Some(reopened.id);
                }
            }
            decisions.push(AutoTriggerDecision::Reverse {
                closed_position_id: position.id,
                opened_position_id: opened_id,
                symbol: position.symbol.clone(),
                new_direction,
            });
            reversed_symbols.insert(position.symbol.clone());
        } else {
            remaining.push(position);
        }
    }

    // 5. Cooldown: skip symbols whose latest AUTO position opened within
    // `cooldown_minutes`, including ones still open from before this pass.
    let cooldown = chrono::Duration::minutes(rule.cooldown_minutes);
    let mut symbols_on_cooldown = std::collections::HashSet::new();
    for position in &remaining {
        if now.signed_duration_since(position.opened_at) < cooldown {
            symbols_on_cooldown.insert(position.symbol.clone());
        }
    }

    // 6. Open new positions for candidates without an open AUTO position
    // and not on cooldown (a symbol just reversed already has a fresh
    // open and is excluded here too).
    let already_covered: std::collections::HashSet<&str> = remaining
        .iter()
        .map(|p| p.symbol.as_str())
        .chain(reversed_symbols.iter().map(|s| s.as_str()))
        .collect();

    for (symbol, result) in &candidates {
        if already_covered.contains(*symbol) {
            continue;
        }
        if symbols_on_cooldown.contains(*symbol) {
            decisions.push(AutoTriggerDecision::CooldownSkip {
                symbol: symbol.to_string(),
            });
            continue;
        }
        let Some(price) = reference_prices.get(*symbol).copied() else {
            continue;
        };
        let direction = if result.direction == ConsensusDirection::Long {
            Direction::Long
        } else {
            Direction::Short
        };
        let mut position_id = None;
        if commit {
            let opened = open_simulated_position(
                db,
                OpenRequest {
                    platform: "binance".to_string(),
                    symbol: symbol.to_string(),
                    direction,
                    leverage: rule.leverage,
                    margin_notional: round4(rule.margin_notional),
                    entry_price: price,
                    slippage_bps: 5.0,
                    commission_bps: 4.0,
                    portfolio_id: rule.portfolio_id.clone(),
                    source: PositionSource::Auto,
                    stop_loss_price: None,
                    take_profit_price: None,
                    trailing_stop_pct: None,
                },
            )?;
            position_id = Some(opened.id);
        }
        decisions.push(AutoTriggerDecision::Open {
            position_id,
            symbol: symbol.to_string(),
            direction,
        });
    }

    if commit {
        db.mark_rule_run(&rule.id, now)?;
    }

    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_filter_requires_all_thresholds() {
        let rule = AutoTriggerRule::default_rule("default");
        let passing = ConsensusResult {
            symbol: "BTCUSDT".into(),
            long_weight: 1.0,
            short_weight: 0.0,
            sum_weights: 1.0,
            sentiment_score: 0.9,
            trader_coverage: 1.0,
            weight_coverage: 1.0,
            confidence_score: 90,
            direction: ConsensusDirection::Long,
            total_traders: rule.min_traders.max(3),
        };
        assert!(candidate_filter(&rule, &passing));

        let neutral = ConsensusResult {
            direction: ConsensusDirection::Neutral,
            ..passing.clone()
        };
        assert!(!candidate_filter(&rule, &neutral));
    }
}
