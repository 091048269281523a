// =============================================================================
// Exit State Machine — pure transitions, no I/O
// =============================================================================
//
// One function per observation:
//
//   on_fill(record, observed_price)   entry filled (stream or poll)
//   on_price(record, current_price)   quote observed while waiting for trigger
//   on_terminated(record)             entry canceled / expired
//
// Each returns a `Step` describing what the engine must do. The engine owns
// locking, broker calls, persistence and notification; this module only
// decides.
//
//   waiting_fill ──fill──► profit-target / bracket:  Place → delete
//                └──────► confirmation / trailing:  Arm (waiting_trigger)
//   waiting_trigger ──price reached──► Place → delete
//   any ──canceled/expired──► Remove
// =============================================================================

use super::pricing::{adverse_price, favourable_price, stop_limit_price, trigger_reached};
use super::strategy::{ExitStrategy, StrategyKind, StrategyStatus};
use crate::types::{Offset, Side};

/// What an observation means for the broker's order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Filled,
    Terminated,
    Other,
}

impl Observation {
    /// Classify a `trade_updates` event name.
    pub fn from_event(event: &str) -> Self {
        match event {
            "fill" | "partial_fill" => Self::Filled,
            "canceled" | "expired" | "rejected" => Self::Terminated,
            _ => Self::Other,
        }
    }

    /// Classify an order status returned by a REST lookup. Partial fills are
    /// only acted on when they arrive as stream events.
    pub fn from_order_status(status: &str) -> Self {
        match status {
            "filled" => Self::Filled,
            "canceled" | "expired" | "rejected" => Self::Terminated,
            _ => Self::Other,
        }
    }
}

/// A close order (or pair of orders) the engine must place.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitPlan {
    ProfitTarget {
        side: Side,
        limit_price: f64,
        fill_price: f64,
    },
    Bracket {
        side: Side,
        fill_price: f64,
        take_profit_price: f64,
        stop_price: f64,
        stop_limit_price: f64,
        /// Legs already accepted by the broker on an earlier attempt.
        stop_loss_order_id: Option<String>,
        take_profit_order_id: Option<String>,
    },
    ConfirmationStop {
        side: Side,
        current_price: f64,
        trigger_price: f64,
        stop_price: f64,
        limit_price: f64,
    },
    TrailingStop {
        side: Side,
        current_price: f64,
        trigger_price: f64,
        trail: Offset,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Nothing to do. The reason is for logs and poll responses.
    Ignore(&'static str),
    /// Persist the updated record (now `waiting_trigger`) and notify.
    Arm(ExitStrategy),
    /// Place the close order(s); delete the record once all succeed.
    Place(ExitPlan),
    /// Trigger not reached yet.
    Wait { current_price: f64, trigger_price: f64 },
    /// Delete the record without placing anything.
    Remove,
}

// =============================================================================
// Transitions
// =============================================================================

/// Entry order filled. A fill price already on the record wins over the
/// observed one so retries price identically.
pub fn on_fill(record: &ExitStrategy, observed_price: Option<f64>) -> Step {
    if record.status != StrategyStatus::WaitingFill {
        return Step::Ignore("not waiting for fill");
    }

    let Some(fill) = record
        .fill_price
        .or(observed_price)
        .filter(|p| p.is_finite() && *p > 0.0)
    else {
        return Step::Ignore("no fill price available");
    };

    let side = record.close_side();
    match &record.kind {
        StrategyKind::ProfitTarget { profit_offset } => Step::Place(ExitPlan::ProfitTarget {
            side,
            limit_price: favourable_price(fill, *profit_offset, record.side),
            fill_price: fill,
        }),

        StrategyKind::Bracket {
            take_profit,
            stop_loss,
            legs,
        } => {
            let stop_price = adverse_price(fill, *stop_loss, record.side);
            Step::Place(ExitPlan::Bracket {
                side,
                fill_price: fill,
                take_profit_price: favourable_price(fill, *take_profit, record.side),
                stop_price,
                stop_limit_price: stop_limit_price(stop_price, record.side),
                stop_loss_order_id: legs.stop_loss_order_id.clone(),
                take_profit_order_id: legs.take_profit_order_id.clone(),
            })
        }

        StrategyKind::ConfirmationStop { trigger, .. } | StrategyKind::TrailingStop { trigger, .. } => {
            let mut armed = record.clone();
            armed.status = StrategyStatus::WaitingTrigger;
            armed.fill_price = Some(fill);
            armed.trigger_price = Some(favourable_price(fill, *trigger, record.side));
            Step::Arm(armed)
        }
    }
}

/// Current price observed while waiting for the trigger.
pub fn on_price(record: &ExitStrategy, current_price: f64) -> Step {
    if record.status != StrategyStatus::WaitingTrigger {
        return Step::Ignore("not waiting for trigger");
    }
    let Some(trigger_price) = record.trigger_price else {
        return Step::Ignore("no trigger price recorded");
    };
    if !current_price.is_finite() || current_price <= 0.0 {
        return Step::Ignore("no usable price");
    }

    if !trigger_reached(record.side, current_price, trigger_price) {
        return Step::Wait {
            current_price,
            trigger_price,
        };
    }

    let side = record.close_side();
    match &record.kind {
        StrategyKind::ConfirmationStop { stop, .. } => {
            let stop_price = adverse_price(current_price, *stop, record.side);
            Step::Place(ExitPlan::ConfirmationStop {
                side,
                current_price,
                trigger_price,
                stop_price,
                limit_price: stop_limit_price(stop_price, record.side),
            })
        }
        StrategyKind::TrailingStop { trail, .. } => Step::Place(ExitPlan::TrailingStop {
            side,
            current_price,
            trigger_price,
            trail: *trail,
        }),
        _ => Step::Ignore("strategy has no trigger"),
    }
}

/// Entry order will never fill. Any pending record is dropped.
pub fn on_terminated(record: Option<&ExitStrategy>) -> Step {
    match record {
        Some(_) => Step::Remove,
        None => Step::Ignore("no pending strategy"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::strategy::{BracketLegs, StrategySpec};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn record(side: Side, kind: StrategyKind) -> ExitStrategy {
        ExitStrategy::new(
            "ord-1",
            StrategySpec {
                symbol: "AAPL".into(),
                quantity: 10,
                side,
                kind,
                fill_timeout_secs: 15,
                trigger_timeout_secs: 300,
            },
        )
    }

    fn armed(side: Side, kind: StrategyKind, fill: f64) -> ExitStrategy {
        match on_fill(&record(side, kind), Some(fill)) {
            Step::Arm(r) => r,
            other => panic!("expected Arm, got {other:?}"),
        }
    }

    #[test]
    fn profit_target_long_sells_above_fill() {
        let r = record(
            Side::Buy,
            StrategyKind::ProfitTarget {
                profit_offset: Offset::dollar(0.5),
            },
        );
        match on_fill(&r, Some(100.0)) {
            Step::Place(ExitPlan::ProfitTarget {
                side, limit_price, ..
            }) => {
                assert_eq!(side, Side::Sell);
                assert!(approx(limit_price, 100.50));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn profit_target_short_buys_below_fill() {
        let r = record(
            Side::Sell,
            StrategyKind::ProfitTarget {
                profit_offset: Offset::dollar(0.5),
            },
        );
        match on_fill(&r, Some(100.0)) {
            Step::Place(ExitPlan::ProfitTarget {
                side, limit_price, ..
            }) => {
                assert_eq!(side, Side::Buy);
                assert!(approx(limit_price, 99.50));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bracket_percent_prices() {
        let r = record(
            Side::Buy,
            StrategyKind::Bracket {
                take_profit: Offset::percent(2.0),
                stop_loss: Offset::percent(1.0),
                legs: BracketLegs::default(),
            },
        );
        match on_fill(&r, Some(100.0)) {
            Step::Place(ExitPlan::Bracket {
                take_profit_price,
                stop_price,
                stop_limit_price,
                stop_loss_order_id,
                ..
            }) => {
                assert!(approx(take_profit_price, 102.00));
                assert!(approx(stop_price, 99.00));
                assert!(approx(stop_limit_price, 98.99));
                assert!(stop_loss_order_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stored_fill_price_wins_over_observation() {
        let mut r = record(
            Side::Buy,
            StrategyKind::ProfitTarget {
                profit_offset: Offset::dollar(1.0),
            },
        );
        r.fill_price = Some(50.0);
        match on_fill(&r, Some(51.0)) {
            Step::Place(ExitPlan::ProfitTarget { limit_price, .. }) => {
                assert!(approx(limit_price, 51.0))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_fill_price_is_a_no_op() {
        let r = record(
            Side::Buy,
            StrategyKind::ProfitTarget {
                profit_offset: Offset::dollar(1.0),
            },
        );
        assert!(matches!(on_fill(&r, None), Step::Ignore(_)));
        assert!(matches!(on_fill(&r, Some(0.0)), Step::Ignore(_)));
    }

    #[test]
    fn deferred_strategies_arm_on_fill() {
        let r = armed(
            Side::Buy,
            StrategyKind::ConfirmationStop {
                trigger: Offset::dollar(5.0),
                stop: Offset::dollar(1.0),
            },
            100.0,
        );
        assert_eq!(r.status, StrategyStatus::WaitingTrigger);
        assert_eq!(r.fill_price, Some(100.0));
        assert!(r.trigger_price.is_some_and(|t| approx(t, 105.0)));

        // A second fill for the same record is ignored.
        assert!(matches!(on_fill(&r, Some(100.0)), Step::Ignore(_)));
    }

    #[test]
    fn long_trigger_fires_at_or_above() {
        let r = armed(
            Side::Buy,
            StrategyKind::ConfirmationStop {
                trigger: Offset::dollar(5.0),
                stop: Offset::dollar(1.0),
            },
            100.0,
        );
        assert!(matches!(on_price(&r, 104.99), Step::Wait { .. }));
        match on_price(&r, 105.0) {
            Step::Place(ExitPlan::ConfirmationStop {
                side,
                stop_price,
                limit_price,
                ..
            }) => {
                assert_eq!(side, Side::Sell);
                assert!(approx(stop_price, 104.0));
                assert!(approx(limit_price, 103.99));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_trigger_fires_at_or_below() {
        let r = armed(
            Side::Sell,
            StrategyKind::ConfirmationStop {
                trigger: Offset::dollar(5.0),
                stop: Offset::dollar(1.0),
            },
            100.0,
        );
        assert!(r.trigger_price.is_some_and(|t| approx(t, 95.0)));
        assert!(matches!(on_price(&r, 95.01), Step::Wait { .. }));
        match on_price(&r, 95.0) {
            Step::Place(ExitPlan::ConfirmationStop {
                side,
                stop_price,
                limit_price,
                ..
            }) => {
                assert_eq!(side, Side::Buy);
                assert!(approx(stop_price, 96.0));
                assert!(approx(limit_price, 96.01));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trailing_stop_hands_off_trail() {
        let r = armed(
            Side::Buy,
            StrategyKind::TrailingStop {
                trigger: Offset::percent(1.0),
                trail: Offset::dollar(0.25),
            },
            200.0,
        );
        match on_price(&r, 202.5) {
            Step::Place(ExitPlan::TrailingStop {
                trail,
                trigger_price,
                ..
            }) => {
                assert_eq!(trail, Offset::dollar(0.25));
                assert!(approx(trigger_price, 202.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn price_before_fill_is_ignored() {
        let r = record(
            Side::Buy,
            StrategyKind::TrailingStop {
                trigger: Offset::dollar(1.0),
                trail: Offset::dollar(0.25),
            },
        );
        assert!(matches!(on_price(&r, 1_000.0), Step::Ignore(_)));
    }

    #[test]
    fn termination_removes_only_known_records() {
        let r = record(
            Side::Buy,
            StrategyKind::ProfitTarget {
                profit_offset: Offset::dollar(1.0),
            },
        );
        assert_eq!(on_terminated(Some(&r)), Step::Remove);
        assert!(matches!(on_terminated(None), Step::Ignore(_)));
    }

    #[test]
    fn event_classification() {
        assert_eq!(Observation::from_event("partial_fill"), Observation::Filled);
        assert_eq!(Observation::from_event("expired"), Observation::Terminated);
        assert_eq!(Observation::from_event("new"), Observation::Other);
        assert_eq!(Observation::from_order_status("partially_filled"), Observation::Other);
        assert_eq!(Observation::from_order_status("filled"), Observation::Filled);
    }
}
