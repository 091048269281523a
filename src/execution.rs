// =============================================================================
// Entry Execution — places entry orders and attaches their exit strategy
// =============================================================================
//
// Flow for `POST /api/v1/orders`:
//   1. Validate the request (and the exit parameters) before touching the
//      broker, so a bad exit spec never leaves an unprotected entry behind.
//   2. Resolve the limit price: manual, or the current bid / ask.
//   3. Native bracket: one broker-linked bracket order priced from the
//      estimated fill. Nothing is registered locally.
//   4. Otherwise place the market / limit entry and register the exit
//      strategy under the returned order id.
//
// Also hosts the cancel and fill-status helpers, which share the engine's
// removal and fill transitions.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::{BracketOrderRequest, BrokerError, BrokerOrder, Quote};
use crate::exit::engine::{ExitEngine, FillOutcome};
use crate::exit::machine::Observation;
use crate::exit::pricing::{adverse_price, favourable_price, round_cents, stop_limit_price};
use crate::exit::strategy::{ExitStrategy, MonitoringHint, StrategyKind, StrategySpec};
use crate::types::Side;

fn default_quantity() -> u32 {
    1
}

fn default_fill_timeout_secs() -> u64 {
    15
}

fn default_trigger_timeout_secs() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryOrderType {
    #[default]
    #[serde(alias = "market")]
    Market,
    #[serde(alias = "limit")]
    Limit,
}

/// Where the limit price of a LIMIT entry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPriceSource {
    #[default]
    Manual,
    Bid,
    Ask,
}

/// Exit strategy requested alongside an entry order.
#[derive(Debug, Clone, Deserialize)]
pub struct ExitRequest {
    #[serde(flatten)]
    pub kind: StrategyKind,
    #[serde(default = "default_fill_timeout_secs")]
    pub fill_timeout_secs: u64,
    #[serde(default = "default_trigger_timeout_secs")]
    pub trigger_timeout_secs: u64,
    /// Bracket only: submit one broker-managed bracket order instead of
    /// placing the legs after the fill.
    #[serde(default)]
    pub native_bracket: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub order_type: EntryOrderType,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub limit_price_type: LimitPriceSource,
    /// Absent means no exit strategy.
    #[serde(default)]
    pub exit_strategy: Option<ExitRequest>,
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Invalid(String),
    #[error("failed to get quote: {0}")]
    Quote(BrokerError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Prices used for a native bracket entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NativeBracket {
    pub estimated_fill: f64,
    pub take_profit_price: f64,
    pub stop_price: f64,
    pub stop_limit_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryResult {
    pub order: BrokerOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_strategy: Option<ExitStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringHint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bracket: Option<NativeBracket>,
    /// Set when the entry was accepted but the exit strategy could not be
    /// stored. The entry is live and unprotected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_error: Option<String>,
}

/// Broker view of an entry order plus whatever the fill transition did.
#[derive(Debug, Clone, Serialize)]
pub struct FillStatus {
    pub order: BrokerOrder,
    pub filled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<FillOutcome>,
    /// True when the entry can no longer fill and its strategy was dropped.
    pub removed: bool,
}

// ---------------------------------------------------------------------------
// Entry placement
// ---------------------------------------------------------------------------

pub async fn place_entry(engine: &ExitEngine, req: EntryRequest) -> Result<EntryResult, ExecutionError> {
    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(ExecutionError::Invalid("symbol is required".into()));
    }
    if req.quantity == 0 {
        return Err(ExecutionError::Invalid("quantity must be positive".into()));
    }

    let exit = req.exit_strategy.clone();
    let spec = exit.as_ref().map(|e| StrategySpec {
        symbol: symbol.clone(),
        quantity: req.quantity,
        side: req.side,
        kind: e.kind.clone(),
        fill_timeout_secs: e.fill_timeout_secs,
        trigger_timeout_secs: e.trigger_timeout_secs,
    });
    if let Some(spec) = &spec {
        spec.validate()
            .map_err(|e| ExecutionError::Invalid(e.to_string()))?;
    }

    let limit_price = match req.order_type {
        EntryOrderType::Market => None,
        EntryOrderType::Limit => Some(resolve_limit_price(engine, &symbol, &req).await?),
    };

    if let Some(ExitRequest {
        kind: StrategyKind::Bracket {
            take_profit,
            stop_loss,
            ..
        },
        native_bracket: true,
        ..
    }) = &exit
    {
        let estimated_fill = match limit_price {
            Some(p) => p,
            None => {
                let quote = fetch_quote(engine, &symbol).await?;
                let side_price = match req.side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                positive(side_price).ok_or_else(|| {
                    ExecutionError::Quote(BrokerError(format!("no usable quote for {symbol}")))
                })?
            }
        };

        let stop_price = adverse_price(estimated_fill, *stop_loss, req.side);
        let bracket = NativeBracket {
            estimated_fill,
            take_profit_price: favourable_price(estimated_fill, *take_profit, req.side),
            stop_price,
            stop_limit_price: stop_limit_price(stop_price, req.side),
        };
        let order = engine
            .broker()
            .place_bracket_order(&BracketOrderRequest {
                symbol: symbol.clone(),
                quantity: req.quantity,
                side: req.side,
                limit_price,
                take_profit_price: bracket.take_profit_price,
                stop_price: bracket.stop_price,
                stop_limit_price: bracket.stop_limit_price,
            })
            .await?;

        info!(
            order_id = %order.id,
            symbol = %symbol,
            estimated_fill,
            take_profit = bracket.take_profit_price,
            stop = bracket.stop_price,
            "native bracket order placed"
        );
        return Ok(EntryResult {
            order,
            exit_strategy: None,
            monitoring: None,
            bracket: Some(bracket),
            registration_error: None,
        });
    }

    let order = match limit_price {
        Some(price) => {
            engine
                .broker()
                .place_limit_order(&symbol, req.quantity, req.side, price)
                .await?
        }
        None => {
            engine
                .broker()
                .place_market_order(&symbol, req.quantity, req.side)
                .await?
        }
    };
    info!(
        order_id = %order.id,
        symbol = %symbol,
        side = %req.side,
        quantity = req.quantity,
        limit_price = ?limit_price,
        "entry order placed"
    );

    let mut result = EntryResult {
        order,
        exit_strategy: None,
        monitoring: None,
        bracket: None,
        registration_error: None,
    };

    if let Some(spec) = spec {
        match engine.register(&result.order.id, spec).await {
            Ok(record) => {
                result.monitoring = Some(record.monitoring());
                result.exit_strategy = Some(record);
            }
            Err(e) => {
                warn!(order_id = %result.order.id, error = %e, "entry placed but exit strategy not registered");
                result.registration_error = Some(e.to_string());
            }
        }
    }

    Ok(result)
}

async fn resolve_limit_price(
    engine: &ExitEngine,
    symbol: &str,
    req: &EntryRequest,
) -> Result<f64, ExecutionError> {
    let price = match req.limit_price_type {
        LimitPriceSource::Manual => positive(req.limit_price),
        LimitPriceSource::Bid => positive(fetch_quote(engine, symbol).await?.bid),
        LimitPriceSource::Ask => positive(fetch_quote(engine, symbol).await?.ask),
    };
    match (price, req.limit_price_type) {
        (Some(p), source) => {
            if source != LimitPriceSource::Manual {
                info!(symbol, source = ?source, price = p, "limit price taken from quote");
            }
            Ok(round_cents(p))
        }
        (None, LimitPriceSource::Manual) => Err(ExecutionError::Invalid("limit price required".into())),
        (None, source) => Err(ExecutionError::Quote(BrokerError(format!(
            "quote for {symbol} has no {source:?} price"
        )))),
    }
}

async fn fetch_quote(engine: &ExitEngine, symbol: &str) -> Result<Quote, ExecutionError> {
    engine
        .broker()
        .get_quote(symbol)
        .await
        .map_err(ExecutionError::Quote)
}

fn positive(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p > 0.0)
}

// ---------------------------------------------------------------------------
// Cancel & fill status
// ---------------------------------------------------------------------------

/// Cancel an entry at the broker and drop its pending strategy. The strategy
/// is kept when the broker refuses the cancel (the entry may have filled).
pub async fn cancel_entry(engine: &ExitEngine, order_id: &str) -> Result<bool, BrokerError> {
    engine.broker().cancel_order(order_id).await?;
    let removed = engine.remove(order_id, "canceled by user").await;
    info!(order_id, strategy_removed = removed, "entry order canceled");
    Ok(removed)
}

/// Ask the broker about an entry order and apply the result.
pub async fn fill_status(engine: &ExitEngine, order_id: &str) -> Result<FillStatus, BrokerError> {
    let order = engine.broker().get_order(order_id).await?;
    let mut status = FillStatus {
        filled: order.is_filled(),
        exit: None,
        removed: false,
        order,
    };

    match Observation::from_order_status(&status.order.status) {
        Observation::Filled => {
            status.exit = Some(engine.apply_fill(order_id, status.order.filled_avg_price).await);
        }
        Observation::Terminated => {
            status.removed = engine.remove(order_id, &status.order.status).await;
        }
        Observation::Other => {}
    }
    Ok(status)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::engine::tests::{harness, Call};
    use crate::exit::strategy::StrategyStatus;
    use crate::types::Offset;

    fn request(json: serde_json::Value) -> EntryRequest {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn market_entry_registers_profit_target() {
        let h = harness();
        let req = request(serde_json::json!({
            "symbol": "aapl",
            "side": "BUY",
            "quantity": 5,
            "exit_strategy": {
                "strategy_type": "profit-target",
                "profit_offset": { "offset_type": "percent", "amount": 1.0 }
            }
        }));

        let result = place_entry(&h.engine, req).await.unwrap();
        assert_eq!(h.broker.calls(), vec![Call::Market { side: Side::Buy }]);

        let record = result.exit_strategy.unwrap();
        assert_eq!(record.order_id, result.order.id);
        assert_eq!(record.symbol, "AAPL");
        assert_eq!(record.quantity, 5);
        assert_eq!(record.status, StrategyStatus::WaitingFill);
        assert!(result.monitoring.is_some());
        assert!(h.engine.get(&result.order.id).is_some());
    }

    #[tokio::test]
    async fn limit_from_bid_uses_quote() {
        let h = harness();
        h.broker.set_price(42.5);
        let req = request(serde_json::json!({
            "symbol": "MSFT",
            "side": "sell",
            "order_type": "LIMIT",
            "limit_price_type": "bid"
        }));

        let result = place_entry(&h.engine, req).await.unwrap();
        assert!(result.exit_strategy.is_none());
        assert_eq!(
            h.broker.calls(),
            vec![
                Call::GetQuote("MSFT".into()),
                Call::Limit {
                    side: Side::Sell,
                    price: 42.5
                }
            ]
        );
    }

    #[tokio::test]
    async fn manual_limit_without_price_is_rejected_before_any_order() {
        let h = harness();
        let req = request(serde_json::json!({
            "symbol": "MSFT",
            "side": "BUY",
            "order_type": "LIMIT"
        }));
        let err = place_entry(&h.engine, req).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Invalid(_)));
        assert!(h.broker.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_exit_spec_blocks_the_entry() {
        let h = harness();
        let req = request(serde_json::json!({
            "symbol": "MSFT",
            "side": "BUY",
            "exit_strategy": {
                "strategy_type": "bracket",
                "take_profit": { "amount": 1.0 },
                "stop_loss": { "amount": 0.0 }
            }
        }));
        assert!(matches!(
            place_entry(&h.engine, req).await,
            Err(ExecutionError::Invalid(_))
        ));
        assert!(h.broker.calls().is_empty());
    }

    #[tokio::test]
    async fn native_bracket_prices_from_ask_and_registers_nothing() {
        let h = harness();
        h.broker.set_price(100.0);
        let req = request(serde_json::json!({
            "symbol": "AAPL",
            "side": "BUY",
            "quantity": 2,
            "exit_strategy": {
                "strategy_type": "bracket",
                "take_profit": { "offset_type": "dollar", "amount": 0.5 },
                "stop_loss": { "offset_type": "dollar", "amount": 0.25 },
                "native_bracket": true
            }
        }));

        let result = place_entry(&h.engine, req).await.unwrap();
        let bracket = result.bracket.unwrap();
        assert_eq!(bracket.estimated_fill, 100.0);
        assert_eq!(bracket.take_profit_price, 100.5);
        assert_eq!(bracket.stop_price, 99.75);
        assert_eq!(bracket.stop_limit_price, 99.74);

        let calls = h.broker.calls();
        assert_eq!(calls[0], Call::GetQuote("AAPL".into()));
        match &calls[1] {
            Call::Bracket(r) => {
                assert_eq!(r.limit_price, None);
                assert_eq!(r.quantity, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_removes_pending_strategy() {
        let h = harness();
        let req = request(serde_json::json!({
            "symbol": "AAPL",
            "side": "BUY",
            "exit_strategy": {
                "strategy_type": "trailing-stop",
                "trigger": { "amount": 1.0 },
                "trail": { "offset_type": "percent", "amount": 0.5 }
            }
        }));
        let result = place_entry(&h.engine, req).await.unwrap();
        let id = result.order.id.clone();

        assert!(cancel_entry(&h.engine, &id).await.unwrap());
        assert!(h.engine.get(&id).is_none());
        assert!(h.broker.calls().contains(&Call::Cancel(id)));
    }

    #[tokio::test]
    async fn fill_status_applies_the_fill() {
        let h = harness();
        h.engine
            .register(
                "e1",
                StrategySpec {
                    symbol: "AAPL".into(),
                    quantity: 10,
                    side: Side::Buy,
                    kind: StrategyKind::ConfirmationStop {
                        trigger: Offset::dollar(2.0),
                        stop: Offset::dollar(1.0),
                    },
                    fill_timeout_secs: 15,
                    trigger_timeout_secs: 300,
                },
            )
            .await
            .unwrap();
        h.broker.set_order("e1", "filled", Some(20.0));

        let status = fill_status(&h.engine, "e1").await.unwrap();
        assert!(status.filled);
        assert!(matches!(
            status.exit,
            Some(FillOutcome::Armed { trigger_price, .. }) if trigger_price == 22.0
        ));
        assert_eq!(h.engine.get("e1").unwrap().status, StrategyStatus::WaitingTrigger);

        assert!(fill_status(&h.engine, "unknown").await.is_err());
    }
}
