// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable the exit engine reads at startup lives here: account mode,
// store location, HTTP bind address, quote subscriptions, background loop
// intervals and stream reconnect policy.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Credentials never live in this file; they come from the environment.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, DataFeed};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_store_path() -> String {
    "exit_strategies.json".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_notify_capacity() -> usize {
    256
}

fn default_max_quote_subscriptions() -> usize {
    30
}

fn default_trigger_sweep_secs() -> u64 {
    5
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

// =============================================================================
// ReconnectSettings
// =============================================================================

/// Exponential backoff for the WebSocket stream supervisors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay applied as +/- random jitter (0.0 - 1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the exit engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Account --------------------------------------------------------------

    /// Paper or Live brokerage account. Selects credentials and base URL.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Market data feed for quotes (iex on the basic plan).
    #[serde(default)]
    pub data_feed: DataFeed,

    // --- Persistence & serving ------------------------------------------------

    /// JSON file holding pending exit strategies.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Buffered messages per WebSocket subscriber before it is dropped.
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,

    // --- Quotes ---------------------------------------------------------------

    /// Symbols subscribed on the quote stream at startup.
    #[serde(default)]
    pub quote_symbols: Vec<String>,

    #[serde(default = "default_max_quote_subscriptions")]
    pub max_quote_subscriptions: usize,

    // --- Background loops -----------------------------------------------------

    /// Seconds between trigger sweeps. 0 disables the sweep.
    #[serde(default = "default_trigger_sweep_secs")]
    pub trigger_sweep_secs: u64,

    /// Seconds between fill reconciliation passes. 0 runs it at startup only.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Paper,
            data_feed: DataFeed::Iex,
            store_path: default_store_path(),
            bind_addr: default_bind_addr(),
            notify_capacity: default_notify_capacity(),
            quote_symbols: Vec::new(),
            max_quote_subscriptions: default_max_quote_subscriptions(),
            trigger_sweep_secs: default_trigger_sweep_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            account_mode = %config.account_mode,
            store_path = %config.store_path,
            quote_symbols = config.quote_symbols.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `EXIT_ENGINE_*` / `ALPACA_*` environment overrides on top of the
    /// file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(mode) = get("ALPACA_ACCOUNT_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "paper" => self.account_mode = AccountMode::Paper,
                "live" => self.account_mode = AccountMode::Live,
                other => warn!(value = other, "ignoring unknown ALPACA_ACCOUNT_MODE"),
            }
        }
        if let Some(feed) = get("ALPACA_DATA_FEED") {
            match feed.to_ascii_lowercase().as_str() {
                "iex" => self.data_feed = DataFeed::Iex,
                "sip" => self.data_feed = DataFeed::Sip,
                other => warn!(value = other, "ignoring unknown ALPACA_DATA_FEED"),
            }
        }
        if let Some(path) = get("EXIT_ENGINE_STORE") {
            self.store_path = path;
        }
        if let Some(addr) = get("EXIT_ENGINE_BIND") {
            self.bind_addr = addr;
        }
    }
}
