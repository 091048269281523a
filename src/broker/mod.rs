// =============================================================================
// Broker Module — order placement and market data lookups
// =============================================================================
//
// `OrderService` is the seam between the exit engine and the brokerage. The
// engine only ever sees this trait; `AlpacaClient` is the production
// implementation and the engine tests script a fake.
// =============================================================================

pub mod client;
pub mod rate_limit;

pub use client::AlpacaClient;
pub use rate_limit::RateLimitTracker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::exit::pricing::mid_price;
use crate::types::{Offset, Side};

/// Opaque broker failure. The message is surfaced verbatim to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl From<anyhow::Error> for BrokerError {
    fn from(e: anyhow::Error) -> Self {
        Self(format!("{e:#}"))
    }
}

impl From<&str> for BrokerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Order as reported by the broker, either on placement or on lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub status: String,
    pub side: Option<Side>,
    #[serde(rename = "type")]
    pub order_type: Option<String>,
    pub qty: Option<f64>,
    pub filled_qty: Option<f64>,
    pub filled_avg_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub created_at: Option<String>,
    pub filled_at: Option<String>,
    /// Child legs of a native bracket order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub legs: Vec<String>,
}

impl BrokerOrder {
    pub fn is_filled(&self) -> bool {
        self.status == "filled"
    }

    /// Terminal states in which the order can never fill.
    pub fn is_dead(&self) -> bool {
        matches!(self.status.as_str(), "canceled" | "expired" | "rejected")
    }
}

/// Latest top-of-book quote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_size: Option<f64>,
    pub timestamp: Option<String>,
}

impl Quote {
    /// Price used for trigger evaluation: bid/ask mid, or whichever side is
    /// quoted.
    pub fn last(&self) -> Option<f64> {
        mid_price(self.bid, self.ask)
    }
}

/// Which orders a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatusFilter {
    #[default]
    Open,
    Closed,
    All,
}

impl OrderStatusFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

/// Account balances and trading flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub id: String,
    pub status: String,
    pub cash: f64,
    pub buying_power: f64,
    pub portfolio_value: f64,
    pub equity: f64,
    pub trading_blocked: bool,
    pub transfers_blocked: bool,
}

/// One open position. `unrealized_plpc` and `change_today` are percentages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub side: String,
    pub market_value: f64,
    pub cost_basis: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pl: f64,
    pub unrealized_plpc: f64,
    pub change_today: f64,
}

/// Native bracket entry: one parent order with broker-linked TP/SL children.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketOrderRequest {
    pub symbol: String,
    pub quantity: u32,
    pub side: Side,
    /// `None` submits the parent as a market order.
    pub limit_price: Option<f64>,
    pub take_profit_price: f64,
    pub stop_price: f64,
    pub stop_limit_price: f64,
}

#[async_trait]
pub trait OrderService: Send + Sync {
    async fn place_market_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
    ) -> Result<BrokerOrder, BrokerError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
        limit_price: f64,
    ) -> Result<BrokerOrder, BrokerError>;

    async fn place_stop_limit_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
        stop_price: f64,
        limit_price: f64,
    ) -> Result<BrokerOrder, BrokerError>;

    /// Broker-managed trailing stop. Dollar offsets trail by price, percent
    /// offsets by percentage.
    async fn place_trailing_stop_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
        trail: Offset,
    ) -> Result<BrokerOrder, BrokerError>;

    async fn place_bracket_order(
        &self,
        request: &BracketOrderRequest,
    ) -> Result<BrokerOrder, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    async fn get_account(&self) -> Result<Account, BrokerError>;

    async fn list_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn list_orders(&self, status: OrderStatusFilter) -> Result<Vec<BrokerOrder>, BrokerError>;
}
