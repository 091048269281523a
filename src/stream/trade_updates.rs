// =============================================================================
// Trade Updates Stream — order lifecycle events from Alpaca
// =============================================================================
//
// Protocol (JSON, frames may arrive as Text or Binary):
//
//   → {"action":"auth","key":"…","secret":"…"}
//   ← {"stream":"authorization","data":{"status":"authorized",…}}
//   → {"action":"listen","data":{"streams":["trade_updates"]}}
//   ← {"stream":"listening","data":{"streams":["trade_updates"]}}
//   ← {"stream":"trade_updates","data":{"event":"fill","order":{…},…}}
//
// Parsed updates are pushed into an mpsc channel. The supervisor reconnects
// with backoff on any error and exits when cancelled. Events missed while
// disconnected are recovered by the reconciliation loop.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::StreamHealth;
use crate::broker::client::{parse_order, Credentials};
use crate::runtime_config::ReconnectSettings;

/// One order event, flattened from the Alpaca payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeUpdate {
    pub event: String,
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub filled_qty: Option<f64>,
    pub filled_avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Authorized,
    Unauthorized(String),
    Listening(Vec<String>),
    Update(TradeUpdate),
    Other,
}

fn parse_frame(text: &str) -> Result<Frame> {
    let root: Value = serde_json::from_str(text).context("failed to parse trade stream JSON")?;

    match root["stream"].as_str() {
        Some("authorization") => {
            let status = root["data"]["status"].as_str().unwrap_or_default();
            if status == "authorized" {
                Ok(Frame::Authorized)
            } else {
                Ok(Frame::Unauthorized(status.to_string()))
            }
        }
        Some("listening") => {
            let streams = root["data"]["streams"]
                .as_array()
                .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            Ok(Frame::Listening(streams))
        }
        Some("trade_updates") => {
            let data = &root["data"];
            let order = parse_order(&data["order"]).context("trade update missing order")?;
            let event = data["event"]
                .as_str()
                .context("trade update missing event")?
                .to_string();
            Ok(Frame::Update(TradeUpdate {
                event,
                order_id: order.id,
                symbol: order.symbol,
                status: order.status,
                filled_qty: order.filled_qty,
                filled_avg_price: order.filled_avg_price,
            }))
        }
        _ => Ok(Frame::Other),
    }
}

fn frame_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(t) => Some(t),
        Message::Binary(b) => String::from_utf8(b).ok(),
        _ => None,
    }
}

/// Supervise the trade-updates connection until `cancel` fires.
pub async fn run_trade_update_stream(
    url: String,
    credentials: Credentials,
    reconnect: ReconnectSettings,
    health: Arc<StreamHealth>,
    tx: mpsc::Sender<TradeUpdate>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(&reconnect);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let result = connect_and_listen(&url, &credentials, &health, &tx, &cancel, &mut backoff).await;
        if cancel.is_cancelled() {
            break;
        }

        let error = match result {
            Ok(()) => {
                warn!("trade updates stream ended");
                None
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "trade updates stream error");
                Some(format!("{e:#}"))
            }
        };
        health.mark_disconnected(error);

        if tx.is_closed() {
            warn!("trade update consumer gone, stopping stream");
            break;
        }

        let delay = backoff.next_delay();
        info!(
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting to trade updates stream"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    health.mark_disconnected(None);
    info!("trade updates stream stopped");
}

async fn connect_and_listen(
    url: &str,
    credentials: &Credentials,
    health: &StreamHealth,
    tx: &mpsc::Sender<TradeUpdate>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<()> {
    info!(url = %url, "connecting to trade updates stream");
    let (ws, _response) = connect_async(url)
        .await
        .context("failed to connect to trade updates stream")?;
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

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = read.next() => msg,
        };

        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => return Err(e).context("trade updates read error"),
            None => return Ok(()),
        };

        if let Message::Ping(data) = &msg {
            write.send(Message::Pong(data.clone())).await?;
            continue;
        }
        if let Message::Close(frame) = &msg {
            debug!(frame = ?frame, "trade updates close frame");
            return Ok(());
        }
        let Some(text) = frame_text(msg) else {
            continue;
        };
        health.mark_message();

        match parse_frame(&text) {
            Ok(Frame::Authorized) => {
                info!("trade updates authenticated");
                let listen = json!({
                    "action": "listen",
                    "data": { "streams": ["trade_updates"] },
                });
                write
                    .send(Message::Text(listen.to_string()))
                    .await
                    .context("failed to send listen")?;
            }
            Ok(Frame::Unauthorized(status)) => {
                bail!("trade updates authorization failed: {status}");
            }
            Ok(Frame::Listening(streams)) => {
                info!(streams = ?streams, "listening to trade updates");
                health.mark_connected();
                backoff.reset();
            }
            Ok(Frame::Update(update)) => {
                debug!(event = %update.event, order_id = %update.order_id, "trade update received");
                if tx.send(update).await.is_err() {
                    return Ok(());
                }
            }
            Ok(Frame::Other) => {}
            Err(e) => warn!(error = %e, "unparseable trade stream frame"),
        }
    }
}
