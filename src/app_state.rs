// =============================================================================
// Central Application State — Exit Engine
// =============================================================================
//
// Ties the subsystems together for the HTTP layer and background loops. The
// engine, quote hub and stream health flags manage their own interior
// mutability; AppState adds the error log, reconciliation status and a
// unified status snapshot. Account switches go through the stream
// connections and are written back to the config file.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the small mutable collections held here.
//   - Arc wrappers for subsystems shared with spawned tasks.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::connections::Connections;
use crate::exit::engine::ExitEngine;
use crate::notify::Notifier;
use crate::runtime_config::RuntimeConfig;
use crate::stream::{QuoteHub, StreamHealth, StreamHealthSnapshot};
use crate::types::AccountMode;

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Optional machine-readable context (e.g. the order id involved).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Incremented on every mutation made through the API.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    /// Where account switches are persisted. `None` keeps them in memory.
    pub config_path: Option<String>,
    /// Bearer token required by authenticated routes. `None` rejects them all.
    pub admin_token: Option<String>,

    // ── Subsystems ──────────────────────────────────────────────────────
    pub engine: Arc<ExitEngine>,
    pub notifier: Notifier,
    pub quotes: Arc<QuoteHub>,
    pub trade_stream: Arc<StreamHealth>,
    pub rate_limit: Arc<RateLimitTracker>,
    /// Stream supervisor; absent when no streams are running (tests).
    pub connections: Option<Arc<Connections>>,

    // ── Error Log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Reconciliation ──────────────────────────────────────────────────
    pub last_reconcile_ok: RwLock<Option<std::time::Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        engine: Arc<ExitEngine>,
        quotes: Arc<QuoteHub>,
        rate_limit: Arc<RateLimitTracker>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            config_path: None,
            admin_token: admin_token.filter(|t| !t.is_empty()),
            notifier: engine.notifier().clone(),
            engine,
            quotes,
            trade_stream: Arc::new(StreamHealth::default()),
            rate_limit,
            connections: None,
            recent_errors: RwLock::new(Vec::new()),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    /// Attach the stream supervisor. Its trade stream health replaces the
    /// detached default.
    pub fn with_connections(
        mut self,
        connections: Arc<Connections>,
        config_path: Option<String>,
    ) -> Self {
        self.trade_stream = connections.trade_health().clone();
        self.connections = Some(connections);
        self.config_path = config_path;
        self
    }

    // ── Account Mode ────────────────────────────────────────────────────

    pub fn account_mode(&self) -> AccountMode {
        self.runtime_config.read().account_mode
    }

    /// Move the broker connection and both streams to `mode`. Returns
    /// `false` when already on that account.
    pub async fn switch_account_mode(&self, mode: AccountMode) -> Result<bool> {
        let Some(connections) = &self.connections else {
            bail!("stream connections are not running");
        };
        if connections.mode() == mode {
            return Ok(false);
        }

        let feed = self.runtime_config.read().data_feed;
        connections.switch(mode, feed).await?;

        let config = {
            let mut config = self.runtime_config.write();
            config.account_mode = mode;
            config.clone()
        };
        if let Some(path) = &self.config_path {
            if let Err(e) = config.save(path) {
                self.push_error_with_code(format!("{e:#}"), Some("config".into()));
            }
        }
        self.increment_version();
        Ok(true)
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    pub fn record_reconcile(&self, result: Result<(), String>) {
        match result {
            Ok(()) => {
                *self.last_reconcile_ok.write() = Some(std::time::Instant::now());
                *self.last_reconcile_error.write() = None;
            }
            Err(e) => {
                *self.last_reconcile_error.write() = Some(e.clone());
                self.push_error_with_code(e, Some("reconcile".into()));
            }
        }
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Serialisable status for `GET /api/v1/status`.
    pub fn build_status(&self) -> StatusSnapshot {
        let config = self.runtime_config.read();

        let mut strategies_by_status = BTreeMap::new();
        for record in self.engine.list() {
            *strategies_by_status.entry(record.status.to_string()).or_insert(0) += 1;
        }

        StatusSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            account_mode: config.account_mode.to_string(),
            data_feed: config.data_feed.as_str(),
            trade_stream: self.trade_stream.snapshot(),
            quote_stream: self.quotes.health().snapshot(),
            quote_subscriptions: self.quotes.symbols().len(),
            quote_limit: self.quotes.limit(),
            pending_strategies: self.engine.pending_count(),
            strategies_by_status,
            subscribers: self.notifier.subscriber_count(),
            rate_limit: self.rate_limit.snapshot(),
            reconcile_last_ok_age_s: self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs()),
            reconcile_last_error: self.last_reconcile_error.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub account_mode: String,
    pub data_feed: &'static str,
    pub trade_stream: StreamHealthSnapshot,
    pub quote_stream: StreamHealthSnapshot,
    pub quote_subscriptions: usize,
    pub quote_limit: usize,
    pub pending_strategies: usize,
    pub strategies_by_status: BTreeMap<String, usize>,
    pub subscribers: usize,
    pub rate_limit: RateLimitSnapshot,
    pub reconcile_last_ok_age_s: Option<u64>,
    pub reconcile_last_error: Option<String>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connections::tests::connections;
    use crate::exit::engine::tests::{harness, Harness};
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    /// AppState over the fake broker harness, with `secret` as admin token.
    pub fn test_state() -> (Arc<AppState>, Harness) {
        let h = harness();
        let hub = QuoteHub::new(30, h.engine.notifier().clone());
        let state = AppState::new(
            RuntimeConfig::default(),
            h.engine.clone(),
            Arc::new(hub),
            Arc::new(RateLimitTracker::new()),
            Some("secret".into()),
        );
        (Arc::new(state), h)
    }

    /// `test_state` with a stream supervisor on refused local endpoints and
    /// the config written under the harness directory.
    pub fn test_state_with_connections() -> (Arc<AppState>, Harness, CancellationToken) {
        let (state, h) = test_state();
        let state = Arc::try_unwrap(state).ok().unwrap();
        let shutdown = CancellationToken::new();
        let conns = Arc::new(connections(&TaskTracker::new(), &shutdown));
        let path = h.dir.path().join("config.json").to_string_lossy().into_owned();
        (Arc::new(state.with_connections(conns, Some(path))), h, shutdown)
    }

    #[tokio::test]
    async fn switch_without_connections_is_refused() {
        let (state, _h) = test_state();
        assert!(state.switch_account_mode(AccountMode::Live).await.is_err());
        assert_eq!(state.account_mode(), AccountMode::Paper);
    }

    #[tokio::test]
    async fn switch_to_current_mode_is_a_no_op() {
        let (state, h, shutdown) = test_state_with_connections();
        let version = state.current_state_version();
        assert!(!state.switch_account_mode(AccountMode::Paper).await.unwrap());
        assert_eq!(state.current_state_version(), version);
        assert!(!h.dir.path().join("config.json").exists());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn switch_updates_config_and_persists_it() {
        std::env::set_var("LIVE_API_KEY", "live-key");
        std::env::set_var("LIVE_SECRET_KEY", "live-secret");
        std::env::set_var("LIVE_BASE_URL", "http://127.0.0.1:9");
        std::env::set_var("ALPACA_STREAM_URL", "ws://127.0.0.1:9");

        let (state, h, shutdown) = test_state_with_connections();
        assert!(state.switch_account_mode(AccountMode::Live).await.unwrap());
        assert_eq!(state.account_mode(), AccountMode::Live);
        assert_eq!(state.build_status().account_mode, "LIVE");

        let saved = RuntimeConfig::load(h.dir.path().join("config.json")).unwrap();
        assert_eq!(saved.account_mode, AccountMode::Live);
        shutdown.cancel();
    }

    #[test]
    fn error_ring_is_capped() {
        let (state, _h) = test_state();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error(format!("e{i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "e5");
    }

    #[test]
    fn reconcile_status_is_tracked() {
        let (state, _h) = test_state();
        state.record_reconcile(Err("broker down".into()));
        assert_eq!(state.build_status().reconcile_last_error.as_deref(), Some("broker down"));
        assert_eq!(state.recent_errors.read()[0].code.as_deref(), Some("reconcile"));

        state.record_reconcile(Ok(()));
        let status = state.build_status();
        assert!(status.reconcile_last_error.is_none());
        assert_eq!(status.reconcile_last_ok_age_s, Some(0));
    }

    #[test]
    fn empty_admin_token_is_treated_as_unset() {
        let h = harness();
        let hub = QuoteHub::new(30, h.engine.notifier().clone());
        let state = AppState::new(
            RuntimeConfig::default(),
            h.engine.clone(),
            Arc::new(hub),
            Arc::new(RateLimitTracker::new()),
            Some(String::new()),
        );
        assert!(state.admin_token.is_none());
        assert_eq!(state.build_status().quote_limit, 30);
    }
}
