// =============================================================================
// Exit Engine — Main Entry Point
// =============================================================================
//
// Wires the Alpaca client, the strategy store, the exit engine and its
// background loops, the two WebSocket streams and the HTTP API. Everything
// long-running shares one CancellationToken that Ctrl-C fires; the streams
// run on child tokens so an account switch can restart them alone.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod connections;
mod execution;
mod exit;
mod notify;
mod reconcile;
mod runtime_config;
mod stream;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::client::{Credentials, Endpoints};
use crate::broker::AlpacaClient;
use crate::connections::Connections;
use crate::exit::engine::ExitEngine;
use crate::exit::store::JsonFileStore;
use crate::notify::Notifier;
use crate::runtime_config::RuntimeConfig;
use crate::stream::QuoteHub;

/// Buffered trade updates between the stream reader and the engine listener.
const TRADE_UPDATE_CHANNEL: usize = 1024;
/// How long shutdown waits for background tasks before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Exit engine starting up");

    let config_path =
        std::env::var("EXIT_ENGINE_CONFIG").unwrap_or_else(|_| "exit_engine.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        account_mode = %config.account_mode,
        data_feed = config.data_feed.as_str(),
        store = %config.store_path,
        bind = %config.bind_addr,
        "Configuration resolved"
    );

    // ── 2. Broker client ─────────────────────────────────────────────────
    let credentials = Credentials::from_env(config.account_mode)?;
    let endpoints = Endpoints::from_env(config.account_mode, config.data_feed);
    let client = Arc::new(AlpacaClient::new(config.account_mode, credentials, endpoints));

    // ── 3. Store, notifier, engine ───────────────────────────────────────
    let store = Arc::new(JsonFileStore::open(&config.store_path));
    let notifier = Notifier::new(config.notify_capacity);
    let engine = Arc::new(ExitEngine::new(client.clone(), store, notifier.clone()));
    info!(pending = engine.pending_count(), "Exit strategies restored");

    // ── 4. Quote hub ─────────────────────────────────────────────────────
    let quote_hub = Arc::new(QuoteHub::new(config.max_quote_subscriptions, notifier));
    if !config.quote_symbols.is_empty() {
        if let Err(e) = quote_hub.subscribe(&config.quote_symbols) {
            warn!(error = %e, "Initial quote subscriptions rejected");
        }
    }

    // ── 5. Stream connections ────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (update_tx, update_rx) = mpsc::channel(TRADE_UPDATE_CHANNEL);
    let connections = Arc::new(Connections::new(
        client.clone(),
        quote_hub.clone(),
        update_tx,
        config.reconnect.clone(),
        tracker.clone(),
        cancel.clone(),
    ));

    // ── 6. Shared state ──────────────────────────────────────────────────
    let admin_token = std::env::var("EXIT_ENGINE_ADMIN_TOKEN").ok();
    if admin_token.as_deref().map_or(true, str::is_empty) {
        warn!("EXIT_ENGINE_ADMIN_TOKEN not set; authenticated endpoints will refuse all requests");
    }
    let state = Arc::new(
        AppState::new(
            config.clone(),
            engine.clone(),
            quote_hub.clone(),
            client.rate_limit().clone(),
            admin_token,
        )
        .with_connections(connections.clone(), Some(config_path)),
    );

    // ── 7. Trade updates & quotes: streams → engine / hub ────────────────
    connections.start().await;
    tracker.spawn(exit::monitor::run_trade_update_listener(
        engine.clone(),
        update_rx,
        cancel.clone(),
    ));

    // ── 8. Reconciliation & trigger sweep ────────────────────────────────
    tracker.spawn(reconcile::run_reconcile_loop(
        state.clone(),
        config.reconcile_interval_secs,
        cancel.clone(),
    ));
    tracker.spawn(exit::monitor::run_trigger_sweep(
        engine.clone(),
        config.trigger_sweep_secs,
        cancel.clone(),
    ));

    // ── 9. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let server_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(server_cancel.cancelled_owned())
            .await
        {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
        warn!("Background tasks did not stop within the grace period");
    }

    info!(pending = engine.pending_count(), "Exit engine shut down");
    Ok(())
}
