// =============================================================================
// Stream Connections — supervised WebSocket tasks per brokerage account
// =============================================================================
//
// Owns the two account-bound streams (trade updates and quotes). Each run
// gets a child of the process shutdown token; an account switch cancels the
// current run, waits for both tasks to let go of their sockets, swaps the
// REST connection and starts a fresh run with the new credentials.
//
// The restart is sequential: Alpaca allows a single market data connection
// per key, so the old quote socket must be closed before the new one opens.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::broker::client::{Credentials, Endpoints};
use crate::broker::AlpacaClient;
use crate::runtime_config::ReconnectSettings;
use crate::stream::{self, QuoteHub, StreamHealth, TradeUpdate};
use crate::types::{AccountMode, DataFeed};

/// How long a stopping run may take before its tasks are aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Connections {
    client: Arc<AlpacaClient>,
    quotes: Arc<QuoteHub>,
    trade_health: Arc<StreamHealth>,
    updates: mpsc::Sender<TradeUpdate>,
    reconnect: ReconnectSettings,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    /// Serialises start, stop and switch.
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Connections {
    pub fn new(
        client: Arc<AlpacaClient>,
        quotes: Arc<QuoteHub>,
        updates: mpsc::Sender<TradeUpdate>,
        reconnect: ReconnectSettings,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            quotes,
            trade_health: Arc::new(StreamHealth::default()),
            updates,
            reconnect,
            tracker,
            shutdown,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn trade_health(&self) -> &Arc<StreamHealth> {
        &self.trade_health
    }

    pub fn mode(&self) -> AccountMode {
        self.client.mode()
    }

    /// Start both streams for the client's current account, replacing any
    /// run already in progress.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if let Some(old) = running.take() {
            stop_run(old).await;
        }
        *running = Some(self.spawn_run());
    }

    pub async fn stop(&self) {
        if let Some(old) = self.running.lock().await.take() {
            stop_run(old).await;
        }
    }

    /// Switch to `mode`, reading its credentials and endpoints from the
    /// environment. Nothing changes when the credentials are missing.
    pub async fn switch(&self, mode: AccountMode, feed: DataFeed) -> Result<()> {
        let credentials = Credentials::from_env(mode)?;
        let endpoints = Endpoints::from_env(mode, feed);
        self.switch_to(mode, credentials, endpoints).await;
        Ok(())
    }

    pub async fn switch_to(&self, mode: AccountMode, credentials: Credentials, endpoints: Endpoints) {
        let mut running = self.running.lock().await;
        if let Some(old) = running.take() {
            stop_run(old).await;
        }
        self.client.switch_account(mode, credentials, endpoints);
        if self.shutdown.is_cancelled() {
            return;
        }
        *running = Some(self.spawn_run());
        info!(account_mode = %mode, "streams restarted for new account");
    }

    fn spawn_run(&self) -> Running {
        let cancel = self.shutdown.child_token();
        let credentials = self.client.credentials();
        let endpoints = self.client.endpoints();

        let trade = self.tracker.spawn(stream::trade_updates::run_trade_update_stream(
            endpoints.trade_stream_url(),
            credentials.clone(),
            self.reconnect.clone(),
            self.trade_health.clone(),
            self.updates.clone(),
            cancel.clone(),
        ));
        let quotes = self.tracker.spawn(stream::quotes::run_quote_stream(
            self.quotes.clone(),
            endpoints.quote_stream_url(),
            credentials,
            self.reconnect.clone(),
            cancel.clone(),
        ));

        Running {
            cancel,
            tasks: vec![trade, quotes],
        }
    }
}

async fn stop_run(run: Running) {
    run.cancel.cancel();
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    for mut task in run.tasks {
        tokio::select! {
            _ = &mut task => {}
            _ = tokio::time::sleep_until(deadline) => {
                warn!("stream task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}
