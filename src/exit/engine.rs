// =============================================================================
// Exit Engine — applies state-machine steps against broker, store and notifier
// =============================================================================
//
// Two producers drive the engine concurrently: the trade-update listener and
// the HTTP / poll / sweep paths. Every read-modify-write for one order id runs
// under that id's async mutex, held from the status guard through the broker
// round trip and the final persist. Different ids never contend.
//
// Failure policy:
//   - Broker errors leave the record as it was (apart from bracket legs that
//     were accepted) and are reported through the notifier / return value.
//   - A transition whose store write fails is not applied: registration and
//     arming report the error and the record stays as it was. Once a close
//     order is live at the broker the record is dropped from memory even if
//     the disk delete fails, so it can never place a second order.
//
// Lock entries live only while some task holds or waits on them.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::machine::{self, ExitPlan, Observation, Step};
use super::store::{StoreError, StrategyStore};
use super::strategy::{BracketLegs, ExitStrategy, StrategyKind, StrategySpec, StrategyStatus};
use crate::broker::{BrokerError, OrderService};
use crate::notify::{Notification, Notifier};
use crate::stream::TradeUpdate;
use crate::types::{OffsetType, Side};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Invalid(String),
    #[error("exit strategy already registered for order {0}")]
    Duplicate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result of applying a fill observation to one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FillOutcome {
    NoStrategy,
    Ignored {
        reason: String,
    },
    Armed {
        fill_price: f64,
        trigger_price: f64,
    },
    ProfitPlaced {
        fill_price: f64,
        profit_order_id: String,
        profit_price: f64,
        profit_side: Side,
    },
    BracketPlaced {
        fill_price: f64,
        take_profit_order_id: String,
        take_profit_price: f64,
        stop_loss_order_id: String,
        stop_price: f64,
        stop_limit_price: f64,
    },
    Failed {
        error: String,
    },
}

/// Response of the trigger poller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerCheck {
    pub found: bool,
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StrategyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_type: Option<OffsetType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_amount: Option<f64>,
    /// Set when this check observed the entry fill and applied it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<FillOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TriggerCheck {
    fn not_found() -> Self {
        Self {
            error: Some("No exit strategy found".into()),
            ..Self::default()
        }
    }

    fn found(record: &ExitStrategy) -> Self {
        Self {
            found: true,
            status: Some(record.status),
            trigger_price: record.trigger_price,
            ..Self::default()
        }
    }
}

type OrderLock = Arc<tokio::sync::Mutex<()>>;
type LockMap = parking_lot::Mutex<HashMap<String, OrderLock>>;

/// One task's claim on an order lock. Dropping the last claim removes the
/// map entry, so ids that never had (or no longer have) a record leave
/// nothing behind.
struct OrderLease<'a> {
    locks: &'a LockMap,
    order_id: String,
    lock: OrderLock,
}

impl OrderLease<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for OrderLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The map holds one reference and this lease another; anything more
        // is a task still holding or waiting on the lock.
        let idle = locks
            .get(&self.order_id)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2);
        if idle {
            locks.remove(&self.order_id);
        }
    }
}

pub struct ExitEngine {
    broker: Arc<dyn OrderService>,
    store: Arc<dyn StrategyStore>,
    notifier: Notifier,
    locks: LockMap,
}

impl ExitEngine {
    pub fn new(
        broker: Arc<dyn OrderService>,
        store: Arc<dyn StrategyStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            broker,
            store,
            notifier,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn OrderService> {
        &self.broker
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn get(&self, order_id: &str) -> Option<ExitStrategy> {
        self.store.get(order_id)
    }

    pub fn list(&self) -> Vec<ExitStrategy> {
        self.store.list()
    }

    pub fn list_by_status(&self, status: StrategyStatus) -> Vec<ExitStrategy> {
        self.store.list_by_status(status)
    }

    pub fn pending_count(&self) -> usize {
        self.store.len()
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    fn lease(&self, order_id: &str) -> OrderLease<'_> {
        let lock = self
            .locks
            .lock()
            .entry(order_id.to_string())
            .or_default()
            .clone();
        OrderLease {
            locks: &self.locks,
            order_id: order_id.to_string(),
            lock,
        }
    }

    fn persist(&self, record: ExitStrategy) -> Result<(), StoreError> {
        let order_id = record.order_id.clone();
        self.store.put(record).inspect_err(|e| {
            error!(order_id = %order_id, error = %e, "failed to persist exit strategy");
        })
    }

    /// Drop the record once its close order is live at the broker.
    fn finish(&self, order_id: &str) {
        if let Err(e) = self.store.delete(order_id) {
            error!(order_id, error = %e, "failed to delete completed exit strategy, evicting from memory");
            self.store.evict(order_id);
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register an exit strategy for an entry order that has just been
    /// accepted by the broker.
    pub async fn register(
        &self,
        order_id: &str,
        spec: StrategySpec,
    ) -> Result<ExitStrategy, EngineError> {
        spec.validate()
            .map_err(|e| EngineError::Invalid(e.to_string()))?;

        let lease = self.lease(order_id);
        let _guard = lease.lock().await;

        if self.store.get(order_id).is_some() {
            return Err(EngineError::Duplicate(order_id.to_string()));
        }

        let record = ExitStrategy::new(order_id, spec);
        self.persist(record.clone())?;

        info!(
            order_id,
            symbol = %record.symbol,
            side = %record.side,
            quantity = record.quantity,
            strategy = record.strategy_type(),
            "exit strategy registered"
        );
        Ok(record)
    }

    // -------------------------------------------------------------------------
    // Stream path
    // -------------------------------------------------------------------------

    /// Handle one event from the trade-update stream.
    pub async fn handle_trade_update(&self, update: &TradeUpdate) {
        debug!(
            event = %update.event,
            order_id = %update.order_id,
            symbol = %update.symbol,
            "trade update"
        );

        match Observation::from_event(&update.event) {
            Observation::Filled => {
                let outcome = self
                    .apply_fill(&update.order_id, update.filled_avg_price)
                    .await;
                if outcome == FillOutcome::NoStrategy && update.event == "fill" {
                    debug!(order_id = %update.order_id, "fill for order without exit strategy");
                }
            }
            Observation::Terminated => {
                self.remove(&update.order_id, &update.event).await;
            }
            Observation::Other => {}
        }

        self.notifier.publish(Notification::TradeUpdate {
            event: update.event.clone(),
            order_id: update.order_id.clone(),
            symbol: update.symbol.clone(),
            status: update.status.clone(),
            filled_qty: update.filled_qty,
            filled_avg_price: update.filled_avg_price,
        });
    }

    /// Apply a fill observation (stream, poll, or reconciliation) to the
    /// record for `order_id`.
    pub async fn apply_fill(&self, order_id: &str, observed_price: Option<f64>) -> FillOutcome {
        let lease = self.lease(order_id);
        let _guard = lease.lock().await;

        match self.store.get(order_id) {
            Some(record) => self.fill_locked(record, observed_price).await,
            None => FillOutcome::NoStrategy,
        }
    }

    /// Drop the record for an entry that can no longer fill. Returns whether
    /// a record was removed.
    pub async fn remove(&self, order_id: &str, reason: &str) -> bool {
        let lease = self.lease(order_id);
        let _guard = lease.lock().await;

        match machine::on_terminated(self.store.get(order_id).as_ref()) {
            Step::Remove => {
                self.finish(order_id);
                info!(order_id, reason, "exit strategy removed");
                self.notifier.publish(Notification::StrategyRemoved {
                    order_id: order_id.to_string(),
                    reason: reason.to_string(),
                });
                true
            }
            _ => false,
        }
    }

    /// Caller must hold the order lock.
    async fn fill_locked(&self, record: ExitStrategy, observed_price: Option<f64>) -> FillOutcome {
        match machine::on_fill(&record, observed_price) {
            Step::Ignore(reason) => {
                if record.status == StrategyStatus::WaitingFill {
                    warn!(order_id = %record.order_id, reason, "fill not applied");
                } else {
                    debug!(order_id = %record.order_id, status = %record.status, "duplicate fill ignored");
                }
                FillOutcome::Ignored {
                    reason: reason.to_string(),
                }
            }
            Step::Arm(armed) => {
                let fill_price = armed.fill_price.unwrap_or_default();
                let trigger_price = armed.trigger_price.unwrap_or_default();
                info!(
                    order_id = %armed.order_id,
                    symbol = %armed.symbol,
                    fill_price,
                    trigger_price,
                    "entry filled, waiting for trigger"
                );
                let notification = Notification::Fill {
                    order_id: armed.order_id.clone(),
                    symbol: armed.symbol.clone(),
                    fill_price,
                    trigger_price: armed.trigger_price,
                    status: armed.status,
                };
                if let Err(e) = self.persist(armed) {
                    return FillOutcome::Failed {
                        error: e.to_string(),
                    };
                }
                self.notifier.publish(notification);
                FillOutcome::Armed {
                    fill_price,
                    trigger_price,
                }
            }
            Step::Place(plan) => self.place_on_fill(record, plan).await,
            Step::Wait { .. } | Step::Remove => FillOutcome::Ignored {
                reason: "unexpected step".into(),
            },
        }
    }

    async fn place_on_fill(&self, record: ExitStrategy, plan: ExitPlan) -> FillOutcome {
        match plan {
            ExitPlan::ProfitTarget {
                side,
                limit_price,
                fill_price,
            } => {
                let result = self
                    .broker
                    .place_limit_order(&record.symbol, record.quantity, side, limit_price)
                    .await;
                match result {
                    Ok(order) => {
                        self.finish(&record.order_id);
                        info!(
                            order_id = %record.order_id,
                            symbol = %record.symbol,
                            profit_order_id = %order.id,
                            limit_price,
                            side = %side,
                            "profit target placed"
                        );
                        self.notifier.publish(Notification::ProfitPlaced {
                            order_id: record.order_id.clone(),
                            symbol: record.symbol.clone(),
                            fill_price,
                            profit_order_id: order.id.clone(),
                            profit_price: limit_price,
                            side,
                        });
                        FillOutcome::ProfitPlaced {
                            fill_price,
                            profit_order_id: order.id,
                            profit_price: limit_price,
                            profit_side: side,
                        }
                    }
                    Err(e) => {
                        error!(order_id = %record.order_id, error = %e, "failed to place profit target");
                        self.notifier.publish(Notification::ProfitFailed {
                            order_id: record.order_id.clone(),
                            symbol: record.symbol.clone(),
                            error: e.to_string(),
                        });
                        FillOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            }

            ExitPlan::Bracket {
                side,
                fill_price,
                take_profit_price,
                stop_price,
                stop_limit_price,
                stop_loss_order_id,
                take_profit_order_id,
            } => {
                // Stop-loss first so the position is protected even if the
                // take-profit leg is rejected.
                let (sl_id, sl_err) = match stop_loss_order_id {
                    Some(id) => (Some(id), None),
                    None => match self
                        .broker
                        .place_stop_limit_order(
                            &record.symbol,
                            record.quantity,
                            side,
                            stop_price,
                            stop_limit_price,
                        )
                        .await
                    {
                        Ok(o) => (Some(o.id), None),
                        Err(e) => (None, Some(e)),
                    },
                };

                let (tp_id, tp_err) = match take_profit_order_id {
                    Some(id) => (Some(id), None),
                    None => match self
                        .broker
                        .place_limit_order(&record.symbol, record.quantity, side, take_profit_price)
                        .await
                    {
                        Ok(o) => (Some(o.id), None),
                        Err(e) => (None, Some(e)),
                    },
                };

                // The legs are independent orders. Nothing cancels the
                // survivor when one of them fills.
                if let (Some(sl), Some(tp)) = (&sl_id, &tp_id) {
                    self.finish(&record.order_id);
                    info!(
                        order_id = %record.order_id,
                        symbol = %record.symbol,
                        take_profit_price,
                        stop_price,
                        stop_limit_price,
                        "bracket legs placed"
                    );
                    self.notifier.publish(Notification::BracketPlaced {
                        order_id: record.order_id.clone(),
                        symbol: record.symbol.clone(),
                        fill_price,
                        take_profit_order_id: tp.clone(),
                        take_profit_price,
                        stop_loss_order_id: sl.clone(),
                        stop_price,
                        stop_limit_price,
                    });
                    return FillOutcome::BracketPlaced {
                        fill_price,
                        take_profit_order_id: tp.clone(),
                        take_profit_price,
                        stop_loss_order_id: sl.clone(),
                        stop_price,
                        stop_limit_price,
                    };
                }

                let mut errors = Vec::new();
                if let Some(e) = tp_err {
                    errors.push(format!("TP: {e}"));
                }
                if let Some(e) = sl_err {
                    errors.push(format!("SL: {e}"));
                }
                let error = errors.join("; ");
                error!(order_id = %record.order_id, error = %error, "failed to place bracket orders");

                // Remember the fill price and any accepted leg so a retry
                // prices identically and only places what is missing.
                let mut updated = record.clone();
                updated.fill_price = Some(fill_price);
                if let StrategyKind::Bracket { legs, .. } = &mut updated.kind {
                    *legs = BracketLegs {
                        stop_loss_order_id: sl_id,
                        take_profit_order_id: tp_id,
                    };
                }
                if updated != record {
                    let _ = self.persist(updated);
                }

                self.notifier.publish(Notification::BracketFailed {
                    order_id: record.order_id.clone(),
                    symbol: record.symbol.clone(),
                    error: error.clone(),
                });
                FillOutcome::Failed { error }
            }

            ExitPlan::ConfirmationStop { .. } | ExitPlan::TrailingStop { .. } => {
                FillOutcome::Ignored {
                    reason: "trigger plan on fill".into(),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Poll path
    // -------------------------------------------------------------------------

    /// Evaluate the trigger for `order_id`, placing the protective order when
    /// it fires. Records still waiting for their fill are first checked
    /// against the broker and advanced through the shared fill transition.
    pub async fn check_trigger(&self, order_id: &str) -> TriggerCheck {
        let lease = self.lease(order_id);
        let _guard = lease.lock().await;

        let Some(mut record) = self.store.get(order_id) else {
            debug!(order_id, "check-trigger: no exit strategy");
            return TriggerCheck::not_found();
        };

        let mut fill = None;
        if record.status == StrategyStatus::WaitingFill {
            let order = match self.broker.get_order(order_id).await {
                Ok(o) => o,
                Err(e) => {
                    return TriggerCheck {
                        error: Some(e.to_string()),
                        ..TriggerCheck::found(&record)
                    }
                }
            };

            match Observation::from_order_status(&order.status) {
                Observation::Filled => {
                    let outcome = self.fill_locked(record.clone(), order.filled_avg_price).await;
                    match self.store.get(order_id) {
                        Some(r) => record = r,
                        None => {
                            return TriggerCheck {
                                found: true,
                                status: Some(placed_status(&outcome)),
                                fill: Some(outcome),
                                ..TriggerCheck::default()
                            }
                        }
                    }
                    fill = Some(outcome);
                }
                Observation::Terminated => {
                    self.finish(order_id);
                    self.notifier.publish(Notification::StrategyRemoved {
                        order_id: order_id.to_string(),
                        reason: order.status.clone(),
                    });
                    return TriggerCheck {
                        found: true,
                        error: Some(format!("Entry order {}", order.status)),
                        ..TriggerCheck::default()
                    };
                }
                Observation::Other => {}
            }
        }

        if record.status != StrategyStatus::WaitingTrigger {
            return TriggerCheck {
                fill,
                error: Some(format!("Not waiting for trigger (status: {})", record.status)),
                ..TriggerCheck::found(&record)
            };
        }

        let quote = match self.broker.get_quote(&record.symbol).await {
            Ok(q) => q,
            Err(e) => {
                return TriggerCheck {
                    fill,
                    error: Some(e.to_string()),
                    ..TriggerCheck::found(&record)
                }
            }
        };
        let Some(current_price) = quote.last() else {
            return TriggerCheck {
                fill,
                error: Some(format!("No usable quote for {}", record.symbol)),
                ..TriggerCheck::found(&record)
            };
        };

        let mut check = TriggerCheck {
            fill,
            current_price: Some(current_price),
            ..TriggerCheck::found(&record)
        };

        match machine::on_price(&record, current_price) {
            Step::Wait { .. } => check,
            Step::Place(plan) => {
                check.triggered = true;
                self.place_on_trigger(&record, plan, check).await
            }
            Step::Ignore(reason) => {
                check.error = Some(reason.to_string());
                check
            }
            Step::Arm(_) | Step::Remove => check,
        }
    }

    async fn place_on_trigger(
        &self,
        record: &ExitStrategy,
        plan: ExitPlan,
        mut check: TriggerCheck,
    ) -> TriggerCheck {
        let (result, current_price, trigger_price) = match &plan {
            ExitPlan::ConfirmationStop {
                side,
                current_price,
                trigger_price,
                stop_price,
                limit_price,
            } => {
                check.stop_price = Some(*stop_price);
                check.limit_price = Some(*limit_price);
                let r = self
                    .broker
                    .place_stop_limit_order(
                        &record.symbol,
                        record.quantity,
                        *side,
                        *stop_price,
                        *limit_price,
                    )
                    .await;
                (r, *current_price, *trigger_price)
            }
            ExitPlan::TrailingStop {
                side,
                current_price,
                trigger_price,
                trail,
            } => {
                check.trail_type = Some(trail.offset_type);
                check.trail_amount = Some(trail.amount);
                let r = self
                    .broker
                    .place_trailing_stop_order(&record.symbol, record.quantity, *side, *trail)
                    .await;
                (r, *current_price, *trigger_price)
            }
            ExitPlan::ProfitTarget { .. } | ExitPlan::Bracket { .. } => {
                check.error = Some("fill plan on trigger".into());
                return check;
            }
        };

        match result {
            Ok(order) => {
                self.finish(&record.order_id);
                info!(
                    order_id = %record.order_id,
                    symbol = %record.symbol,
                    strategy = record.strategy_type(),
                    current_price,
                    trigger_price,
                    stop_order_id = %order.id,
                    "trigger hit, protective order placed"
                );
                self.notifier.publish(Notification::TriggerHit {
                    order_id: record.order_id.clone(),
                    symbol: record.symbol.clone(),
                    strategy_type: record.strategy_type().to_string(),
                    current_price,
                    trigger_price,
                    stop_order_id: order.id.clone(),
                    stop_price: check.stop_price,
                    limit_price: check.limit_price,
                    trail_type: check.trail_type,
                    trail_amount: check.trail_amount,
                });
                check.status = Some(StrategyStatus::StopPlaced);
                check.stop_order_id = Some(order.id);
            }
            Err(e) => {
                error!(order_id = %record.order_id, error = %e, "failed to place protective order");
                check.error = Some(e.to_string());
            }
        }
        check
    }

    /// Run the trigger poller over every armed record. Returns how many fired.
    pub async fn sweep_triggers(&self) -> usize {
        let armed = self.store.list_by_status(StrategyStatus::WaitingTrigger);
        let mut fired = 0;
        for record in armed {
            let check = self.check_trigger(&record.order_id).await;
            if check.stop_order_id.is_some() {
                fired += 1;
            } else if let Some(e) = &check.error {
                debug!(order_id = %record.order_id, error = %e, "trigger sweep: check failed");
            }
        }
        fired
    }
}

fn placed_status(outcome: &FillOutcome) -> StrategyStatus {
    match outcome {
        FillOutcome::ProfitPlaced { .. } => StrategyStatus::ProfitPlaced,
        FillOutcome::BracketPlaced { .. } => StrategyStatus::BracketPlaced,
        FillOutcome::Armed { .. } => StrategyStatus::WaitingTrigger,
        _ => StrategyStatus::WaitingFill,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::{
        Account, BracketOrderRequest, BrokerOrder, OrderStatusFilter, Position, Quote,
    };
    use crate::exit::store::JsonFileStore;
    use crate::types::Offset;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Market { side: Side },
        Limit { side: Side, price: f64 },
        StopLimit { side: Side, stop: f64, limit: f64 },
        Trailing { side: Side, trail: Offset },
        Bracket(BracketOrderRequest),
        Cancel(String),
        GetOrder(String),
        GetQuote(String),
    }

    /// Scripted broker. Placement calls succeed unless a failure message is
    /// queued for that order type.
    #[derive(Default)]
    pub struct FakeBroker {
        pub calls: Mutex<Vec<Call>>,
        pub fail_limit: Mutex<Vec<String>>,
        pub fail_stop_limit: Mutex<Vec<String>>,
        pub price: Mutex<Option<f64>>,
        pub orders: Mutex<HashMap<String, BrokerOrder>>,
        next_id: Mutex<u32>,
    }

    impl FakeBroker {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn set_price(&self, p: f64) {
            *self.price.lock() = Some(p);
        }

        pub fn set_order(&self, id: &str, status: &str, avg: Option<f64>) {
            self.orders.lock().insert(
                id.to_string(),
                BrokerOrder {
                    id: id.to_string(),
                    symbol: "AAPL".into(),
                    status: status.into(),
                    side: Some(Side::Buy),
                    filled_qty: avg.map(|_| 10.0),
                    filled_avg_price: avg,
                    ..BrokerOrder::default()
                },
            );
        }

        fn placed(&self, call: Call) -> BrokerOrder {
            self.calls.lock().push(call);
            let mut n = self.next_id.lock();
            *n += 1;
            BrokerOrder {
                id: format!("x-{n}"),
                symbol: "AAPL".into(),
                status: "new".into(),
                ..BrokerOrder::default()
            }
        }
    }

    #[async_trait]
    impl OrderService for FakeBroker {
        async fn place_market_order(
            &self,
            _symbol: &str,
            _quantity: u32,
            side: Side,
        ) -> Result<BrokerOrder, BrokerError> {
            Ok(self.placed(Call::Market { side }))
        }

        async fn place_limit_order(
            &self,
            _symbol: &str,
            _quantity: u32,
            side: Side,
            limit_price: f64,
        ) -> Result<BrokerOrder, BrokerError> {
            if let Some(msg) = self.fail_limit.lock().pop() {
                self.calls.lock().push(Call::Limit { side, price: limit_price });
                return Err(BrokerError(msg));
            }
            Ok(self.placed(Call::Limit { side, price: limit_price }))
        }

        async fn place_stop_limit_order(
            &self,
            _symbol: &str,
            _quantity: u32,
            side: Side,
            stop_price: f64,
            limit_price: f64,
        ) -> Result<BrokerOrder, BrokerError> {
            let call = Call::StopLimit {
                side,
                stop: stop_price,
                limit: limit_price,
            };
            if let Some(msg) = self.fail_stop_limit.lock().pop() {
                self.calls.lock().push(call);
                return Err(BrokerError(msg));
            }
            Ok(self.placed(call))
        }

        async fn place_trailing_stop_order(
            &self,
            _symbol: &str,
            _quantity: u32,
            side: Side,
            trail: Offset,
        ) -> Result<BrokerOrder, BrokerError> {
            Ok(self.placed(Call::Trailing { side, trail }))
        }

        async fn place_bracket_order(
            &self,
            request: &BracketOrderRequest,
        ) -> Result<BrokerOrder, BrokerError> {
            Ok(self.placed(Call::Bracket(request.clone())))
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
            self.calls.lock().push(Call::Cancel(order_id.to_string()));
            Ok(())
        }

        async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
            self.calls.lock().push(Call::GetOrder(order_id.to_string()));
            self.orders
                .lock()
                .get(order_id)
                .cloned()
                .ok_or_else(|| BrokerError("order not found".into()))
        }

        async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
            self.calls.lock().push(Call::GetQuote(symbol.to_string()));
            let p = (*self.price.lock()).ok_or_else(|| BrokerError("no quote".into()))?;
            Ok(Quote {
                symbol: symbol.to_string(),
                bid: Some(p),
                ask: Some(p),
                bid_size: None,
                ask_size: None,
                timestamp: None,
            })
        }

        async fn get_account(&self) -> Result<Account, BrokerError> {
            Ok(Account {
                id: "acc-test".into(),
                status: "ACTIVE".into(),
                cash: 10_000.0,
                buying_power: 20_000.0,
                portfolio_value: 10_000.0,
                equity: 10_000.0,
                trading_blocked: false,
                transfers_blocked: false,
            })
        }

        async fn list_positions(&self) -> Result<Vec<Position>, BrokerError> {
            Ok(Vec::new())
        }

        async fn list_orders(
            &self,
            status: OrderStatusFilter,
        ) -> Result<Vec<BrokerOrder>, BrokerError> {
            let mut orders: Vec<BrokerOrder> = self
                .orders
                .lock()
                .values()
                .filter(|o| match status {
                    OrderStatusFilter::All => true,
                    OrderStatusFilter::Open => !o.is_filled() && !o.is_dead(),
                    OrderStatusFilter::Closed => o.is_filled() || o.is_dead(),
                })
                .cloned()
                .collect();
            orders.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(orders)
        }
    }

    pub struct Harness {
        pub engine: Arc<ExitEngine>,
        pub broker: Arc<FakeBroker>,
        pub dir: tempfile::TempDir,
    }

    impl Harness {
        pub fn store_path(&self) -> std::path::PathBuf {
            self.dir.path().join("strategies.json")
        }
    }

    pub fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(FakeBroker::default());
        let store = Arc::new(JsonFileStore::open(dir.path().join("strategies.json")));
        let engine = Arc::new(ExitEngine::new(broker.clone(), store, Notifier::new(64)));
        Harness {
            engine,
            broker,
            dir,
        }
    }

    pub fn spec(side: Side, kind: StrategyKind) -> StrategySpec {
        StrategySpec {
            symbol: "AAPL".into(),
            quantity: 10,
            side,
            kind,
            fill_timeout_secs: 15,
            trigger_timeout_secs: 300,
        }
    }

    fn fill_event(order_id: &str, price: f64) -> TradeUpdate {
        TradeUpdate {
            event: "fill".into(),
            order_id: order_id.into(),
            symbol: "AAPL".into(),
            status: "filled".into(),
            filled_qty: Some(10.0),
            filled_avg_price: Some(price),
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn profit_target() -> StrategyKind {
        StrategyKind::ProfitTarget {
            profit_offset: Offset::dollar(0.5),
        }
    }

    fn confirmation_stop() -> StrategyKind {
        StrategyKind::ConfirmationStop {
            trigger: Offset::dollar(5.0),
            stop: Offset::dollar(1.0),
        }
    }

    #[tokio::test]
    async fn profit_target_places_once_on_duplicate_fills() {
        let h = harness();
        let mut rx = h.engine.notifier().subscribe();
        h.engine.register("o1", spec(Side::Buy, profit_target())).await.unwrap();

        h.engine.handle_trade_update(&fill_event("o1", 100.0)).await;
        h.engine.handle_trade_update(&fill_event("o1", 100.0)).await;

        assert_eq!(
            h.broker.calls(),
            vec![Call::Limit {
                side: Side::Sell,
                price: 100.5
            }]
        );
        assert!(h.engine.get("o1").is_none());

        match rx.recv().await.unwrap() {
            Notification::ProfitPlaced { profit_price, side, .. } => {
                assert!(approx(profit_price, 100.5));
                assert_eq!(side, Side::Sell);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Notification::TradeUpdate { .. }));
    }

    #[tokio::test]
    async fn concurrent_fill_paths_place_exactly_once() {
        let h = harness();
        h.engine.register("o1", spec(Side::Sell, profit_target())).await.unwrap();

        let (a, b) = tokio::join!(
            h.engine.apply_fill("o1", Some(100.0)),
            h.engine.apply_fill("o1", Some(100.0))
        );
        let placed = [&a, &b]
            .iter()
            .filter(|o| matches!(o, FillOutcome::ProfitPlaced { .. }))
            .count();
        assert_eq!(placed, 1);
        assert_eq!(h.broker.calls().len(), 1);
    }

    #[tokio::test]
    async fn profit_failure_keeps_record_for_retry() {
        let h = harness();
        let mut rx = h.engine.notifier().subscribe();
        h.engine.register("o1", spec(Side::Buy, profit_target())).await.unwrap();
        h.broker.fail_limit.lock().push("insufficient buying power".into());

        let first = h.engine.apply_fill("o1", Some(100.0)).await;
        assert_eq!(
            first,
            FillOutcome::Failed {
                error: "insufficient buying power".into()
            }
        );
        let rec = h.engine.get("o1").unwrap();
        assert_eq!(rec.status, StrategyStatus::WaitingFill);
        assert!(matches!(rx.recv().await.unwrap(), Notification::ProfitFailed { .. }));

        let retry = h.engine.apply_fill("o1", Some(100.0)).await;
        assert!(matches!(retry, FillOutcome::ProfitPlaced { .. }));
        assert!(h.engine.get("o1").is_none());
    }

    #[tokio::test]
    async fn bracket_places_stop_loss_before_take_profit() {
        let h = harness();
        let kind = StrategyKind::Bracket {
            take_profit: Offset::percent(2.0),
            stop_loss: Offset::percent(1.0),
            legs: BracketLegs::default(),
        };
        h.engine.register("o1", spec(Side::Buy, kind)).await.unwrap();

        let outcome = h.engine.apply_fill("o1", Some(100.0)).await;
        assert!(matches!(outcome, FillOutcome::BracketPlaced { .. }));
        assert_eq!(
            h.broker.calls(),
            vec![
                Call::StopLimit {
                    side: Side::Sell,
                    stop: 99.0,
                    limit: 98.99
                },
                Call::Limit {
                    side: Side::Sell,
                    price: 102.0
                },
            ]
        );
        assert!(h.engine.get("o1").is_none());
    }

    #[tokio::test]
    async fn bracket_retry_places_only_missing_leg() {
        let h = harness();
        let kind = StrategyKind::Bracket {
            take_profit: Offset::dollar(1.0),
            stop_loss: Offset::dollar(0.5),
            legs: BracketLegs::default(),
        };
        h.engine.register("o1", spec(Side::Buy, kind)).await.unwrap();
        h.broker.fail_limit.lock().push("market closed".into());

        let first = h.engine.apply_fill("o1", Some(50.0)).await;
        assert_eq!(
            first,
            FillOutcome::Failed {
                error: "TP: market closed".into()
            }
        );
        let rec = h.engine.get("o1").unwrap();
        assert_eq!(rec.status, StrategyStatus::WaitingFill);
        assert_eq!(rec.fill_price, Some(50.0));

        // A later observation at a different price still uses the stored fill.
        let retry = h.engine.apply_fill("o1", Some(51.0)).await;
        match retry {
            FillOutcome::BracketPlaced {
                take_profit_price, ..
            } => assert!(approx(take_profit_price, 51.0)),
            other => panic!("unexpected {other:?}"),
        }

        let stop_legs = h
            .broker
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::StopLimit { .. }))
            .count();
        assert_eq!(stop_legs, 1);
    }

    #[tokio::test]
    async fn bracket_both_legs_failing_reports_compound_error() {
        let h = harness();
        let kind = StrategyKind::Bracket {
            take_profit: Offset::dollar(1.0),
            stop_loss: Offset::dollar(0.5),
            legs: BracketLegs::default(),
        };
        h.engine.register("o1", spec(Side::Buy, kind)).await.unwrap();
        h.broker.fail_limit.lock().push("tp down".into());
        h.broker.fail_stop_limit.lock().push("sl down".into());

        let outcome = h.engine.apply_fill("o1", Some(50.0)).await;
        assert_eq!(
            outcome,
            FillOutcome::Failed {
                error: "TP: tp down; SL: sl down".into()
            }
        );
        assert!(h.engine.get("o1").is_some());
    }

    #[tokio::test]
    async fn confirmation_stop_full_cycle() {
        let h = harness();
        h.engine.register("o1", spec(Side::Buy, confirmation_stop())).await.unwrap();
        h.engine.handle_trade_update(&fill_event("o1", 100.0)).await;

        let rec = h.engine.get("o1").unwrap();
        assert_eq!(rec.status, StrategyStatus::WaitingTrigger);
        assert_eq!(rec.trigger_price, Some(105.0));

        h.broker.set_price(104.99);
        let check = h.engine.check_trigger("o1").await;
        assert!(check.found);
        assert!(!check.triggered);
        assert_eq!(check.current_price, Some(104.99));

        h.broker.set_price(105.0);
        let check = h.engine.check_trigger("o1").await;
        assert!(check.triggered);
        assert_eq!(check.stop_order_id.as_deref(), Some("x-1"));
        assert!(check.stop_price.is_some_and(|p| approx(p, 104.0)));
        assert!(check.limit_price.is_some_and(|p| approx(p, 103.99)));
        assert!(h.engine.get("o1").is_none());

        let again = h.engine.check_trigger("o1").await;
        assert!(!again.found);
        assert!(!again.triggered);
    }

    #[tokio::test]
    async fn short_trailing_stop_fires_at_or_below_trigger() {
        let h = harness();
        let kind = StrategyKind::TrailingStop {
            trigger: Offset::dollar(5.0),
            trail: Offset::percent(1.0),
        };
        h.engine.register("o1", spec(Side::Sell, kind)).await.unwrap();
        h.engine.apply_fill("o1", Some(100.0)).await;

        h.broker.set_price(95.01);
        assert!(!h.engine.check_trigger("o1").await.triggered);

        h.broker.set_price(95.0);
        let check = h.engine.check_trigger("o1").await;
        assert!(check.triggered);
        assert_eq!(check.trail_type, Some(OffsetType::Percent));
        assert!(h.broker.calls().contains(&Call::Trailing {
            side: Side::Buy,
            trail: Offset::percent(1.0)
        }));
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_trigger_cleans_up() {
        let h = harness();
        h.engine.register("o1", spec(Side::Buy, confirmation_stop())).await.unwrap();
        h.engine.apply_fill("o1", Some(100.0)).await;

        let mut cancel = fill_event("o1", 0.0);
        cancel.event = "canceled".into();
        cancel.filled_avg_price = None;
        h.engine.handle_trade_update(&cancel).await;

        assert!(h.engine.get("o1").is_none());
        let check = h.engine.check_trigger("o1").await;
        assert!(!check.found);
        assert!(!h
            .broker
            .calls()
            .iter()
            .any(|c| matches!(c, Call::StopLimit { .. })));
    }

    #[tokio::test]
    async fn persisted_trigger_record_survives_restart() {
        let h = harness();
        h.engine.register("o1", spec(Side::Buy, confirmation_stop())).await.unwrap();
        h.engine.apply_fill("o1", Some(100.0)).await;

        // Fresh engine over the same file, as after a crash.
        let broker = Arc::new(FakeBroker::default());
        let store = Arc::new(JsonFileStore::open(h.store_path()));
        let engine = ExitEngine::new(broker.clone(), store, Notifier::new(8));

        broker.set_price(106.0);
        let check = engine.check_trigger("o1").await;
        assert!(check.triggered);
        assert!(engine.get("o1").is_none());
        assert_eq!(broker.calls().len(), 2); // quote + stop-limit
    }

    #[tokio::test]
    async fn check_trigger_polls_fill_for_waiting_records() {
        let h = harness();
        h.engine.register("o1", spec(Side::Buy, confirmation_stop())).await.unwrap();

        h.broker.set_order("o1", "new", None);
        let check = h.engine.check_trigger("o1").await;
        assert!(check.found);
        assert_eq!(check.status, Some(StrategyStatus::WaitingFill));
        assert!(check.error.is_some());

        h.broker.set_order("o1", "filled", Some(100.0));
        h.broker.set_price(101.0);
        let check = h.engine.check_trigger("o1").await;
        assert!(matches!(check.fill, Some(FillOutcome::Armed { .. })));
        assert_eq!(check.status, Some(StrategyStatus::WaitingTrigger));
        assert_eq!(check.trigger_price, Some(105.0));
        assert!(!check.triggered);
    }

    #[tokio::test]
    async fn check_trigger_on_filled_profit_target_reports_placement() {
        let h = harness();
        h.engine.register("o1", spec(Side::Buy, profit_target())).await.unwrap();
        h.broker.set_order("o1", "filled", Some(20.0));

        let check = h.engine.check_trigger("o1").await;
        assert_eq!(check.status, Some(StrategyStatus::ProfitPlaced));
        assert!(matches!(check.fill, Some(FillOutcome::ProfitPlaced { .. })));
        assert!(h.engine.get("o1").is_none());
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_bad_input() {
        let h = harness();
        h.engine.register("o1", spec(Side::Buy, profit_target())).await.unwrap();
        assert!(matches!(
            h.engine.register("o1", spec(Side::Buy, profit_target())).await,
            Err(EngineError::Duplicate(_))
        ));

        let mut bad = spec(Side::Buy, profit_target());
        bad.quantity = 0;
        assert!(matches!(
            h.engine.register("o2", bad).await,
            Err(EngineError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn fill_for_unknown_order_is_harmless() {
        let h = harness();
        assert_eq!(h.engine.apply_fill("nope", Some(1.0)).await, FillOutcome::NoStrategy);
        assert!(!h.engine.remove("nope", "canceled").await);
        assert!(h.broker.calls().is_empty());
    }

    #[tokio::test]
    async fn sweep_fires_only_reached_triggers() {
        let h = harness();
        h.engine.register("a", spec(Side::Buy, confirmation_stop())).await.unwrap();
        h.engine.register("b", spec(Side::Buy, confirmation_stop())).await.unwrap();
        h.engine.apply_fill("a", Some(100.0)).await;
        h.engine.apply_fill("b", Some(200.0)).await;

        h.broker.set_price(150.0);
        assert_eq!(h.engine.sweep_triggers().await, 1);
        assert!(h.engine.get("a").is_none());
        assert!(h.engine.get("b").is_some());
    }

    /// Engine over a store at `<dir>/sub/strategies.json`. Replacing `sub`
    /// with a regular file makes every store write fail.
    fn engine_in_subdir(dir: &tempfile::TempDir) -> (Arc<ExitEngine>, Arc<FakeBroker>) {
        let broker = Arc::new(FakeBroker::default());
        let store = Arc::new(JsonFileStore::open(dir.path().join("sub").join("strategies.json")));
        let engine = Arc::new(ExitEngine::new(broker.clone(), store, Notifier::new(64)));
        (engine, broker)
    }

    fn block_store(dir: &tempfile::TempDir) {
        let sub = dir.path().join("sub");
        if sub.is_dir() {
            std::fs::remove_dir_all(&sub).unwrap();
        }
        std::fs::write(&sub, "").unwrap();
    }

    fn unblock_store(dir: &tempfile::TempDir) {
        std::fs::remove_file(dir.path().join("sub")).unwrap();
    }

    #[tokio::test]
    async fn failed_register_leaves_no_live_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, broker) = engine_in_subdir(&dir);
        block_store(&dir);

        assert!(matches!(
            engine.register("o1", spec(Side::Buy, profit_target())).await,
            Err(EngineError::Store(_))
        ));
        assert!(engine.get("o1").is_none());
        assert_eq!(engine.apply_fill("o1", Some(100.0)).await, FillOutcome::NoStrategy);
        assert!(broker.calls().is_empty());

        unblock_store(&dir);
        engine.register("o1", spec(Side::Buy, profit_target())).await.unwrap();
        assert!(engine.get("o1").is_some());
    }

    #[tokio::test]
    async fn failed_arm_keeps_record_waiting_for_fill() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _broker) = engine_in_subdir(&dir);
        engine.register("o1", spec(Side::Buy, confirmation_stop())).await.unwrap();
        block_store(&dir);

        assert!(matches!(
            engine.apply_fill("o1", Some(100.0)).await,
            FillOutcome::Failed { .. }
        ));
        assert_eq!(engine.get("o1").unwrap().status, StrategyStatus::WaitingFill);

        unblock_store(&dir);
        assert!(matches!(
            engine.apply_fill("o1", Some(100.0)).await,
            FillOutcome::Armed { .. }
        ));
    }

    #[tokio::test]
    async fn placed_exit_is_not_repeated_when_delete_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, broker) = engine_in_subdir(&dir);
        engine.register("o1", spec(Side::Buy, profit_target())).await.unwrap();
        block_store(&dir);

        assert!(matches!(
            engine.apply_fill("o1", Some(100.0)).await,
            FillOutcome::ProfitPlaced { .. }
        ));
        assert!(engine.get("o1").is_none());
        assert_eq!(engine.apply_fill("o1", Some(100.0)).await, FillOutcome::NoStrategy);
        assert_eq!(broker.calls().len(), 1);
    }

    #[tokio::test]
    async fn lock_entries_do_not_accumulate() {
        let h = harness();
        h.broker.set_price(100.0);
        for i in 0..100 {
            let id = format!("unknown-{i}");
            h.engine.apply_fill(&id, Some(1.0)).await;
            h.engine.remove(&id, "canceled").await;
            h.engine.check_trigger(&id).await;
        }
        assert_eq!(h.engine.locks.lock().len(), 0);

        h.engine.register("o1", spec(Side::Buy, confirmation_stop())).await.unwrap();
        h.engine.apply_fill("o1", Some(100.0)).await;
        h.engine.check_trigger("o1").await;
        assert!(h.engine.get("o1").is_some());
        assert_eq!(h.engine.locks.lock().len(), 0);
    }

    #[tokio::test]
    async fn lock_entry_survives_while_another_task_holds_it() {
        let h = harness();
        let first = h.engine.lease("o1");
        let guard = first.lock().await;
        let second = h.engine.lease("o1");
        assert!(Arc::ptr_eq(&first.lock, &second.lock));

        drop(guard);
        drop(first);
        assert_eq!(h.engine.locks.lock().len(), 1);

        // A newcomer must serialise with `second`, not get a fresh lock.
        let third = h.engine.lease("o1");
        assert!(Arc::ptr_eq(&second.lock, &third.lock));

        drop(second);
        assert_eq!(h.engine.locks.lock().len(), 1);
        drop(third);
        assert_eq!(h.engine.locks.lock().len(), 0);
    }
}
