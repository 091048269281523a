// =============================================================================
// Notifier — fan-out of typed state-change messages
// =============================================================================
//
// A single tokio broadcast channel. Publishing never blocks: a subscriber
// that falls more than `capacity` messages behind gets `Lagged` on its next
// receive and is expected to drop the connection. Publishing with no
// subscribers is not an error.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;

use crate::exit::strategy::StrategyStatus;
use crate::types::{OffsetType, Side};

/// Every message pushed to WebSocket subscribers, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// First frame on every subscriber connection.
    Connected { server_time: i64 },

    /// Entry filled and the record moved to `waiting_trigger`.
    Fill {
        order_id: String,
        symbol: String,
        fill_price: f64,
        trigger_price: Option<f64>,
        status: StrategyStatus,
    },

    ProfitPlaced {
        order_id: String,
        symbol: String,
        fill_price: f64,
        profit_order_id: String,
        profit_price: f64,
        side: Side,
    },

    ProfitFailed {
        order_id: String,
        symbol: String,
        error: String,
    },

    BracketPlaced {
        order_id: String,
        symbol: String,
        fill_price: f64,
        take_profit_order_id: String,
        take_profit_price: f64,
        stop_loss_order_id: String,
        stop_price: f64,
        stop_limit_price: f64,
    },

    BracketFailed {
        order_id: String,
        symbol: String,
        error: String,
    },

    TriggerHit {
        order_id: String,
        symbol: String,
        strategy_type: String,
        current_price: f64,
        trigger_price: f64,
        stop_order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit_price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trail_type: Option<OffsetType>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trail_amount: Option<f64>,
    },

    /// Raw relay of every broker trade update.
    TradeUpdate {
        event: String,
        order_id: String,
        symbol: String,
        status: String,
        filled_qty: Option<f64>,
        filled_avg_price: Option<f64>,
    },

    StrategyRemoved { order_id: String, reason: String },

    Quote {
        symbol: String,
        bid: f64,
        ask: f64,
        bid_size: f64,
        ask_size: f64,
        timestamp: String,
    },
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to all current subscribers. Returns how many received it.
    pub fn publish(&self, msg: Notification) -> usize {
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
