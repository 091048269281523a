// =============================================================================
// Event Sources — Alpaca WebSocket streams
// =============================================================================
//
// Two supervised connections:
//   - trade_updates: order lifecycle events, forwarded into an mpsc channel
//     consumed by the exit engine listener.
//   - quotes: top-of-book ticks for a bounded, dynamic symbol set, kept in a
//     QuoteHub and relayed to subscribers.
//
// Each supervisor reconnects with exponential backoff and stops when its
// CancellationToken fires.
// =============================================================================

pub mod backoff;
pub mod quotes;
pub mod trade_updates;

pub use quotes::{QuoteHub, QuoteTick};
pub use trade_updates::TradeUpdate;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Connectivity flags for one stream, surfaced on the status endpoint.
#[derive(Debug, Default)]
pub struct StreamHealth {
    connected: AtomicBool,
    reconnects: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_message: RwLock<Option<std::time::Instant>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamHealthSnapshot {
    pub connected: bool,
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub last_message_age_ms: Option<u64>,
}

impl StreamHealth {
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        *self.last_error.write() = None;
    }

    pub fn mark_disconnected(&self, error: Option<String>) {
        self.connected.store(false, Ordering::Relaxed);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        if error.is_some() {
            *self.last_error.write() = error;
        }
    }

    pub fn mark_message(&self) {
        *self.last_message.write() = Some(std::time::Instant::now());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StreamHealthSnapshot {
        StreamHealthSnapshot {
            connected: self.is_connected(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
            last_message_age_ms: self
                .last_message
                .read()
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }
}
