// =============================================================================
// Alpaca REST API Client — key-header authenticated requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialised. Every request
// carries APCA-API-KEY-ID / APCA-API-SECRET-KEY as default headers.
//
// Prices are sent as strings rounded to whole cents; Alpaca rejects
// sub-penny limit prices on most equities.
//
// The account (paper or live) can be switched at runtime: the per-account
// connection is swapped atomically and requests already in flight finish on
// the connection they started with.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::rate_limit::RateLimitTracker;
use super::{
    Account, BracketOrderRequest, BrokerError, BrokerOrder, OrderService, OrderStatusFilter,
    Position, Quote,
};
use crate::types::{AccountMode, DataFeed, Offset, OffsetType, Side};

const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_TRADING_URL: &str = "https://api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";
const DATA_STREAM_URL: &str = "wss://stream.data.alpaca.markets/v2";

// =============================================================================
// Credentials & endpoints
// =============================================================================

#[derive(Clone)]
pub struct Credentials {
    pub key_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key_id", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Read the key pair for `mode` from `PAPER_*` / `LIVE_*` env vars.
    pub fn from_env(mode: AccountMode) -> Result<Self> {
        let (key_var, secret_var) = match mode {
            AccountMode::Paper => ("PAPER_API_KEY", "PAPER_SECRET_KEY"),
            AccountMode::Live => ("LIVE_API_KEY", "LIVE_SECRET_KEY"),
        };
        let key_id = std::env::var(key_var).with_context(|| format!("{key_var} not set"))?;
        let secret_key =
            std::env::var(secret_var).with_context(|| format!("{secret_var} not set"))?;
        Ok(Self { key_id, secret_key })
    }
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub trading_url: String,
    pub data_url: String,
    pub data_stream_url: String,
    pub feed: DataFeed,
}

impl Endpoints {
    /// Defaults for `mode`, overridable via `PAPER_BASE_URL`, `LIVE_BASE_URL`,
    /// `ALPACA_DATA_URL` and `ALPACA_STREAM_URL`.
    pub fn from_env(mode: AccountMode, feed: DataFeed) -> Self {
        let trading_url = match mode {
            AccountMode::Paper => {
                std::env::var("PAPER_BASE_URL").unwrap_or_else(|_| PAPER_TRADING_URL.into())
            }
            AccountMode::Live => {
                std::env::var("LIVE_BASE_URL").unwrap_or_else(|_| LIVE_TRADING_URL.into())
            }
        };
        let data_url = std::env::var("ALPACA_DATA_URL").unwrap_or_else(|_| DATA_URL.into());
        let data_stream_url =
            std::env::var("ALPACA_STREAM_URL").unwrap_or_else(|_| DATA_STREAM_URL.into());
        Self {
            trading_url: trading_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
            data_stream_url: data_stream_url.trim_end_matches('/').to_string(),
            feed,
        }
    }

    /// Trade-updates WebSocket, served from the trading host.
    pub fn trade_stream_url(&self) -> String {
        let host = self
            .trading_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        format!("wss://{host}/stream")
    }

    pub fn quote_stream_url(&self) -> String {
        format!("{}/{}", self.data_stream_url, self.feed.as_str())
    }
}

// =============================================================================
// Client
// =============================================================================

/// Everything tied to one brokerage account.
struct Connection {
    mode: AccountMode,
    credentials: Credentials,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl Connection {
    fn new(mode: AccountMode, credentials: Credentials, endpoints: Endpoints) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&credentials.key_id) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(mut val) = HeaderValue::from_str(&credentials.secret_key) {
            val.set_sensitive(true);
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        info!(
            mode = %mode,
            trading_url = %endpoints.trading_url,
            data_url = %endpoints.data_url,
            feed = endpoints.feed.as_str(),
            "Alpaca connection initialised"
        );

        Self {
            mode,
            credentials,
            endpoints,
            http,
        }
    }
}

pub struct AlpacaClient {
    conn: RwLock<Arc<Connection>>,
    rate_limit: Arc<RateLimitTracker>,
}

impl AlpacaClient {
    pub fn new(mode: AccountMode, credentials: Credentials, endpoints: Endpoints) -> Self {
        Self {
            conn: RwLock::new(Arc::new(Connection::new(mode, credentials, endpoints))),
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    fn conn(&self) -> Arc<Connection> {
        self.conn.read().clone()
    }

    pub fn mode(&self) -> AccountMode {
        self.conn().mode
    }

    pub fn credentials(&self) -> Credentials {
        self.conn().credentials.clone()
    }

    pub fn endpoints(&self) -> Endpoints {
        self.conn().endpoints.clone()
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limit
    }

    /// Point every subsequent request at another account. The rate-limit
    /// window belongs to the old account and is reset.
    pub fn switch_account(&self, mode: AccountMode, credentials: Credentials, endpoints: Endpoints) {
        let next = Arc::new(Connection::new(mode, credentials, endpoints));
        let previous = std::mem::replace(&mut *self.conn.write(), next);
        self.rate_limit.reset();
        info!(from = %previous.mode, to = %mode, "Alpaca account switched");
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Send `req`, track rate-limit headers and decode the JSON body.
    /// Empty bodies (e.g. 204 on cancel) decode as `Value::Null`.
    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        if !self.rate_limit.can_send_request(chrono::Utc::now().timestamp()) {
            anyhow::bail!("{what} refused locally: rate limit exhausted");
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let text = resp
            .text()
            .await
            .with_context(|| format!("failed to read {what} response"))?;

        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {what} response"))?
        };

        if !status.is_success() {
            let message = body["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| text.clone());
            anyhow::bail!("Alpaca {what} returned {status}: {message}");
        }

        Ok(body)
    }

    async fn submit_order(&self, body: Value) -> Result<BrokerOrder> {
        let conn = self.conn();
        let url = format!("{}/v2/orders", conn.endpoints.trading_url);
        debug!(order = %body, "submitting order");
        let resp = self
            .send(conn.http.post(&url).json(&body), "POST /v2/orders")
            .await?;
        let order = parse_order(&resp)?;
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            status = %order.status,
            kind = body["type"].as_str().unwrap_or("?"),
            "order accepted"
        );
        Ok(order)
    }
}

impl std::fmt::Debug for AlpacaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let conn = self.conn();
        f.debug_struct("AlpacaClient")
            .field("mode", &conn.mode)
            .field("credentials", &conn.credentials)
            .field("trading_url", &conn.endpoints.trading_url)
            .field("data_url", &conn.endpoints.data_url)
            .finish()
    }
}

#[async_trait]
impl OrderService for AlpacaClient {
    #[instrument(skip(self), name = "alpaca::place_market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
    ) -> Result<BrokerOrder, BrokerError> {
        let body = order_body(symbol, quantity, side, "market");
        Ok(self.submit_order(body).await?)
    }

    #[instrument(skip(self), name = "alpaca::place_limit_order")]
    async fn place_limit_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
        limit_price: f64,
    ) -> Result<BrokerOrder, BrokerError> {
        let mut body = order_body(symbol, quantity, side, "limit");
        body["limit_price"] = json!(price_str(limit_price));
        Ok(self.submit_order(body).await?)
    }

    #[instrument(skip(self), name = "alpaca::place_stop_limit_order")]
    async fn place_stop_limit_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
        stop_price: f64,
        limit_price: f64,
    ) -> Result<BrokerOrder, BrokerError> {
        let mut body = order_body(symbol, quantity, side, "stop_limit");
        body["stop_price"] = json!(price_str(stop_price));
        body["limit_price"] = json!(price_str(limit_price));
        Ok(self.submit_order(body).await?)
    }

    #[instrument(skip(self), name = "alpaca::place_trailing_stop_order")]
    async fn place_trailing_stop_order(
        &self,
        symbol: &str,
        quantity: u32,
        side: Side,
        trail: Offset,
    ) -> Result<BrokerOrder, BrokerError> {
        Ok(self
            .submit_order(trailing_stop_body(symbol, quantity, side, trail))
            .await?)
    }

    #[instrument(skip(self), name = "alpaca::place_bracket_order")]
    async fn place_bracket_order(
        &self,
        request: &BracketOrderRequest,
    ) -> Result<BrokerOrder, BrokerError> {
        Ok(self.submit_order(bracket_body(request)).await?)
    }

    #[instrument(skip(self), name = "alpaca::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let conn = self.conn();
        let url = format!("{}/v2/orders/{order_id}", conn.endpoints.trading_url);
        self.send(conn.http.delete(&url), "DELETE /v2/orders")
            .await?;
        info!(order_id, "order cancel requested");
        Ok(())
    }

    #[instrument(skip(self), name = "alpaca::get_order")]
    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        let conn = self.conn();
        let url = format!("{}/v2/orders/{order_id}", conn.endpoints.trading_url);
        let body = self.send(conn.http.get(&url), "GET /v2/orders").await?;
        Ok(parse_order(&body)?)
    }

    #[instrument(skip(self), name = "alpaca::get_quote")]
    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let conn = self.conn();
        let url = format!(
            "{}/v2/stocks/{}/quotes/latest?feed={}",
            conn.endpoints.data_url,
            symbol.to_uppercase(),
            conn.endpoints.feed.as_str()
        );
        let body = self
            .send(conn.http.get(&url), "GET /v2/stocks/quotes/latest")
            .await?;
        Ok(parse_latest_quote(symbol, &body)?)
    }

    #[instrument(skip(self), name = "alpaca::get_account")]
    async fn get_account(&self) -> Result<Account, BrokerError> {
        let conn = self.conn();
        let url = format!("{}/v2/account", conn.endpoints.trading_url);
        let body = self.send(conn.http.get(&url), "GET /v2/account").await?;
        Ok(parse_account(&body)?)
    }

    #[instrument(skip(self), name = "alpaca::list_positions")]
    async fn list_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let conn = self.conn();
        let url = format!("{}/v2/positions", conn.endpoints.trading_url);
        let body = self.send(conn.http.get(&url), "GET /v2/positions").await?;
        Ok(parse_list(&body, "positions", parse_position)?)
    }

    #[instrument(skip(self), name = "alpaca::list_orders")]
    async fn list_orders(&self, status: OrderStatusFilter) -> Result<Vec<BrokerOrder>, BrokerError> {
        let conn = self.conn();
        let url = format!(
            "{}/v2/orders?status={}&limit=500",
            conn.endpoints.trading_url,
            status.as_str()
        );
        let body = self.send(conn.http.get(&url), "GET /v2/orders").await?;
        Ok(parse_list(&body, "orders", parse_order)?)
    }
}

// =============================================================================
// Request bodies
// =============================================================================

fn price_str(p: f64) -> String {
    format!("{p:.2}")
}

/// Common order fields. Every submission carries a fresh `client_order_id`
/// so a retried request can be matched to the order it created.
fn order_body(symbol: &str, quantity: u32, side: Side, order_type: &str) -> Value {
    json!({
        "symbol": symbol.to_uppercase(),
        "qty": quantity.to_string(),
        "side": side.as_wire(),
        "type": order_type,
        "time_in_force": "day",
        "client_order_id": Uuid::new_v4().to_string(),
    })
}

fn trailing_stop_body(symbol: &str, quantity: u32, side: Side, trail: Offset) -> Value {
    let mut body = order_body(symbol, quantity, side, "trailing_stop");
    match trail.offset_type {
        OffsetType::Percent => body["trail_percent"] = json!(trail.amount.to_string()),
        OffsetType::Dollar => body["trail_price"] = json!(price_str(trail.amount)),
    }
    body
}

fn bracket_body(req: &BracketOrderRequest) -> Value {
    let order_type = if req.limit_price.is_some() { "limit" } else { "market" };
    let mut body = order_body(&req.symbol, req.quantity, req.side, order_type);
    if let Some(p) = req.limit_price {
        body["limit_price"] = json!(price_str(p));
    }
    body["order_class"] = json!("bracket");
    body["take_profit"] = json!({ "limit_price": price_str(req.take_profit_price) });
    body["stop_loss"] = json!({
        "stop_price": price_str(req.stop_price),
        "limit_price": price_str(req.stop_limit_price),
    });
    body
}

// =============================================================================
// Response parsing
// =============================================================================

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_opt_f64(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_side(val: &Value) -> Option<Side> {
    match val.as_str()? {
        "buy" => Some(Side::Buy),
        "sell" => Some(Side::Sell),
        _ => None,
    }
}

/// Decode an Alpaca order object (REST response or `trade_updates` payload).
pub fn parse_order(body: &Value) -> Result<BrokerOrder> {
    let id = body["id"]
        .as_str()
        .context("order response missing 'id'")?
        .to_string();

    let legs = body["legs"]
        .as_array()
        .map(|legs| {
            legs.iter()
                .filter_map(|l| l["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let opt_str = |key: &str| body[key].as_str().map(str::to_string);

    Ok(BrokerOrder {
        id,
        client_order_id: opt_str("client_order_id"),
        symbol: body["symbol"].as_str().unwrap_or_default().to_string(),
        status: body["status"].as_str().unwrap_or("unknown").to_string(),
        side: parse_side(&body["side"]),
        order_type: opt_str("type"),
        qty: parse_opt_f64(&body["qty"]),
        filled_qty: parse_opt_f64(&body["filled_qty"]),
        filled_avg_price: parse_opt_f64(&body["filled_avg_price"]),
        limit_price: parse_opt_f64(&body["limit_price"]),
        stop_price: parse_opt_f64(&body["stop_price"]),
        created_at: opt_str("created_at"),
        filled_at: opt_str("filled_at"),
        legs,
    })
}

fn parse_list<T>(body: &Value, what: &str, parse: fn(&Value) -> Result<T>) -> Result<Vec<T>> {
    body.as_array()
        .with_context(|| format!("{what} response is not an array"))?
        .iter()
        .map(parse)
        .collect()
}

fn parse_account(body: &Value) -> Result<Account> {
    let num = |key: &str| parse_opt_f64(&body[key]).unwrap_or_default();
    Ok(Account {
        id: body["id"]
            .as_str()
            .context("account response missing 'id'")?
            .to_string(),
        status: body["status"].as_str().unwrap_or("unknown").to_string(),
        cash: num("cash"),
        buying_power: num("buying_power"),
        portfolio_value: num("portfolio_value"),
        equity: num("equity"),
        trading_blocked: body["trading_blocked"].as_bool().unwrap_or(false),
        transfers_blocked: body["transfers_blocked"].as_bool().unwrap_or(false),
    })
}

/// Alpaca reports `unrealized_plpc` and `change_today` as fractions; they
/// are exposed as percentages.
fn parse_position(body: &Value) -> Result<Position> {
    let num = |key: &str| parse_opt_f64(&body[key]).unwrap_or_default();
    Ok(Position {
        symbol: body["symbol"]
            .as_str()
            .context("position missing 'symbol'")?
            .to_string(),
        qty: num("qty"),
        side: body["side"].as_str().unwrap_or_default().to_string(),
        market_value: num("market_value"),
        cost_basis: num("cost_basis"),
        avg_entry_price: num("avg_entry_price"),
        current_price: num("current_price"),
        unrealized_pl: num("unrealized_pl"),
        unrealized_plpc: num("unrealized_plpc") * 100.0,
        change_today: num("change_today") * 100.0,
    })
}

fn parse_latest_quote(symbol: &str, body: &Value) -> Result<Quote> {
    let q = body
        .get("quote")
        .context("latest quote response missing 'quote'")?;

    let positive = |v: &Value| parse_opt_f64(v).filter(|p| *p > 0.0);
    let quote = Quote {
        symbol: body["symbol"]
            .as_str()
            .unwrap_or(symbol)
            .to_uppercase(),
        bid: positive(&q["bp"]),
        ask: positive(&q["ap"]),
        bid_size: parse_opt_f64(&q["bs"]),
        ask_size: parse_opt_f64(&q["as"]),
        timestamp: q["t"].as_str().map(str::to_string),
    };

    if quote.bid.is_none() && quote.ask.is_none() {
        warn!(symbol, "latest quote has neither bid nor ask");
    }
    Ok(quote)
}
