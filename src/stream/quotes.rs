// =============================================================================
// Quote Stream — top-of-book ticks for a bounded, dynamic symbol set
// =============================================================================
//
// Protocol (Alpaca market data v2, every frame is a JSON array):
//
//   ← [{"T":"success","msg":"connected"}]
//   → {"action":"auth","key":"…","secret":"…"}
//   ← [{"T":"success","msg":"authenticated"}]
//   → {"action":"subscribe","quotes":["AAPL",…]}
//   ← [{"T":"subscription","quotes":["AAPL",…],…}]
//   ← [{"T":"q","S":"AAPL","bp":187.1,"bs":3,"ap":187.2,"as":1,"t":"…"}]
//
// The hub owns the subscribed set and the latest tick per symbol. REST
// handlers mutate the set synchronously and push a command to the stream
// task; after every (re)authentication the full set is resubscribed, so
// commands issued while disconnected are never lost. Each stream task
// attaches its own command channel, so a restarted task (e.g. after an
// account switch) takes over from the one it replaces.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::StreamHealth;
use crate::broker::client::Credentials;
use crate::notify::{Notification, Notifier};
use crate::runtime_config::ReconnectSettings;

/// Latest top-of-book for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuoteTick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub timestamp: String,
}

impl QuoteTick {
    pub fn mid(&self) -> Option<f64> {
        crate::exit::pricing::mid_price(Some(self.bid), Some(self.ask))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuoteCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("no symbols given")]
    Empty,
    #[error("subscription limit exceeded: {current_count} subscribed, limit {limit}")]
    LimitExceeded { current_count: usize, limit: usize },
}

/// Result of a subscribe / unsubscribe call.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionChange {
    pub symbols: Vec<String>,
    pub all_subscribed: Vec<String>,
    pub count: usize,
}

pub struct QuoteHub {
    book: RwLock<HashMap<String, QuoteTick>>,
    subscribed: RwLock<BTreeSet<String>>,
    limit: usize,
    cmd_tx: parking_lot::Mutex<mpsc::UnboundedSender<QuoteCommand>>,
    health: Arc<StreamHealth>,
    notifier: Notifier,
}

fn normalise(symbols: &[String]) -> Vec<String> {
    let mut out: Vec<String> = symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

impl QuoteHub {
    /// Build a hub. Commands are discarded until a stream task attaches.
    pub fn new(limit: usize, notifier: Notifier) -> Self {
        let (cmd_tx, _) = mpsc::unbounded_channel();
        Self {
            book: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(BTreeSet::new()),
            limit,
            cmd_tx: parking_lot::Mutex::new(cmd_tx),
            health: Arc::new(StreamHealth::default()),
            notifier,
        }
    }

    /// Route subsequent commands to a fresh receiver. The previous receiver
    /// sees its channel close.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<QuoteCommand> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock() = cmd_tx;
        cmd_rx
    }

    fn send_command(&self, cmd: QuoteCommand) {
        let _ = self.cmd_tx.lock().send(cmd);
    }

    pub fn subscribe(&self, symbols: &[String]) -> Result<SubscriptionChange, SubscriptionError> {
        let symbols = normalise(symbols);
        if symbols.is_empty() {
            return Err(SubscriptionError::Empty);
        }

        let mut set = self.subscribed.write();
        let union = set.iter().chain(symbols.iter()).collect::<BTreeSet<_>>().len();
        if union > self.limit {
            return Err(SubscriptionError::LimitExceeded {
                current_count: set.len(),
                limit: self.limit,
            });
        }
        set.extend(symbols.iter().cloned());
        let all: Vec<String> = set.iter().cloned().collect();
        drop(set);

        self.send_command(QuoteCommand::Subscribe(symbols.clone()));
        info!(symbols = ?symbols, total = all.len(), "quote subscription added");
        Ok(SubscriptionChange {
            symbols,
            count: all.len(),
            all_subscribed: all,
        })
    }

    pub fn unsubscribe(&self, symbols: &[String]) -> Result<SubscriptionChange, SubscriptionError> {
        let symbols = normalise(symbols);
        if symbols.is_empty() {
            return Err(SubscriptionError::Empty);
        }

        let mut set = self.subscribed.write();
        for s in &symbols {
            set.remove(s);
        }
        let all: Vec<String> = set.iter().cloned().collect();
        drop(set);

        {
            let mut book = self.book.write();
            for s in &symbols {
                book.remove(s);
            }
        }

        self.send_command(QuoteCommand::Unsubscribe(symbols.clone()));
        info!(symbols = ?symbols, total = all.len(), "quote subscription removed");
        Ok(SubscriptionChange {
            symbols,
            count: all.len(),
            all_subscribed: all,
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.subscribed.read().iter().cloned().collect()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn latest(&self, symbol: &str) -> Option<QuoteTick> {
        self.book.read().get(&symbol.to_uppercase()).cloned()
    }

    pub fn health(&self) -> &Arc<StreamHealth> {
        &self.health
    }

    fn record(&self, tick: QuoteTick) {
        // Late ticks for a symbol that was just unsubscribed are dropped.
        if !self.subscribed.read().contains(&tick.symbol) {
            return;
        }
        self.book.write().insert(tick.symbol.clone(), tick.clone());
        self.notifier.publish(Notification::Quote {
            symbol: tick.symbol,
            bid: tick.bid,
            ask: tick.ask,
            bid_size: tick.bid_size,
            ask_size: tick.ask_size,
            timestamp: tick.timestamp,
        });
    }
}

// =============================================================================
// Frame parsing
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum DataMessage {
    Connected,
    Authenticated,
    Subscription(Vec<String>),
    Quote(QuoteTick),
    Error { code: i64, msg: String },
    Other,
}

fn parse_batch(text: &str) -> Result<Vec<DataMessage>> {
    let root: Value = serde_json::from_str(text).context("failed to parse quote stream JSON")?;
    let items = match root {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items.iter().map(parse_message).collect())
}

fn parse_message(v: &Value) -> DataMessage {
    let num = |key: &str| v[key].as_f64().unwrap_or(0.0);
    match v["T"].as_str() {
        Some("success") => match v["msg"].as_str() {
            Some("connected") => DataMessage::Connected,
            Some("authenticated") => DataMessage::Authenticated,
            _ => DataMessage::Other,
        },
        Some("subscription") => DataMessage::Subscription(
            v["quotes"]
                .as_array()
                .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        ),
        Some("q") => match v["S"].as_str() {
            Some(symbol) => DataMessage::Quote(QuoteTick {
                symbol: symbol.to_string(),
                bid: num("bp"),
                ask: num("ap"),
                bid_size: num("bs"),
                ask_size: num("as"),
                timestamp: v["t"].as_str().unwrap_or_default().to_string(),
            }),
            None => DataMessage::Other,
        },
        Some("error") => DataMessage::Error {
            code: v["code"].as_i64().unwrap_or_default(),
            msg: v["msg"].as_str().unwrap_or_default().to_string(),
        },
        _ => DataMessage::Other,
    }
}

/// Errors after which reconnecting with the same credentials is pointless
/// until the backoff has elapsed: auth failures and connection limits.
fn is_fatal_code(code: i64) -> bool {
    matches!(code, 401 | 402 | 403 | 404 | 406 | 409)
}

// =============================================================================
// Supervisor
// =============================================================================

pub async fn run_quote_stream(
    hub: Arc<QuoteHub>,
    url: String,
    credentials: Credentials,
    reconnect: ReconnectSettings,
    cancel: CancellationToken,
) {
    let mut commands = hub.attach();
    let mut backoff = Backoff::new(&reconnect);
    let health = hub.health().clone();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let result =
            connect_and_stream(&hub, &url, &credentials, &mut commands, &cancel, &mut backoff).await;
        if cancel.is_cancelled() {
            break;
        }

        let error = match result {
            Ok(()) => {
                warn!("quote stream ended");
                None
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "quote stream error");
                Some(format!("{e:#}"))
            }
        };
        health.mark_disconnected(error);

        let delay = backoff.next_delay();
        info!(
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting to quote stream"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    health.mark_disconnected(None);
    info!("quote stream stopped");
}

async fn connect_and_stream(
    hub: &QuoteHub,
    url: &str,
    credentials: &Credentials,
    commands: &mut mpsc::UnboundedReceiver<QuoteCommand>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<()> {
    info!(url = %url, "connecting to quote stream");
    let (ws, _response) = connect_async(url)
        .await
        .context("failed to connect to quote stream")?;
    let (mut write, mut read) = ws.split();

    let auth = json!({
        "action": "auth",
        "key": credentials.key_id,
        "secret": credentials.secret_key,
    });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("failed to send auth")?;

    let mut authenticated = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    // Another stream task attached; idle until this one is cancelled.
                    let _ = write.send(Message::Close(None)).await;
                    cancel.cancelled().await;
                    return Ok(());
                };
                // Before auth the full set is sent on authentication anyway.
                if !authenticated {
                    continue;
                }
                let payload = match cmd {
                    QuoteCommand::Subscribe(symbols) => json!({"action": "subscribe", "quotes": symbols}),
                    QuoteCommand::Unsubscribe(symbols) => json!({"action": "unsubscribe", "quotes": symbols}),
                };
                write
                    .send(Message::Text(payload.to_string()))
                    .await
                    .context("failed to send subscription change")?;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => return Err(e).context("quote stream read error"),
                    None => return Ok(()),
                };

                let text = match msg {
                    Message::Text(t) => t,
                    Message::Binary(b) => match String::from_utf8(b) {
                        Ok(t) => t,
                        Err(_) => continue,
                    },
                    Message::Ping(data) => {
                        write.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Message::Close(frame) => {
                        debug!(frame = ?frame, "quote stream close frame");
                        return Ok(());
                    }
                    _ => continue,
                };
                hub.health().mark_message();

                let batch = match parse_batch(&text) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "unparseable quote stream frame");
                        continue;
                    }
                };

                for item in batch {
                    match item {
                        DataMessage::Connected => debug!("quote stream connected"),
                        DataMessage::Authenticated => {
                            authenticated = true;
                            hub.health().mark_connected();
                            backoff.reset();
                            let symbols = hub.symbols();
                            info!(count = symbols.len(), "quote stream authenticated");
                            if !symbols.is_empty() {
                                let payload = json!({"action": "subscribe", "quotes": symbols});
                                write
                                    .send(Message::Text(payload.to_string()))
                                    .await
                                    .context("failed to resubscribe quotes")?;
                            }
                        }
                        DataMessage::Subscription(quotes) => {
                            info!(quotes = ?quotes, "quote subscriptions confirmed");
                        }
                        DataMessage::Quote(tick) => hub.record(tick),
                        DataMessage::Error { code, msg } => {
                            if is_fatal_code(code) {
                                bail!("quote stream error {code}: {msg}");
                            }
                            warn!(code, msg = %msg, "quote stream error message");
                        }
                        DataMessage::Other => {}
                    }
                }
            }
        }
    }
}
