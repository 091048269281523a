// =============================================================================
// Reconciliation — catch up on fills missed while disconnected
// =============================================================================
//
// For every record still in `waiting_fill`, ask the broker for the entry
// order and feed what it says through the same transitions the stream uses:
//
//   filled                       → engine.apply_fill (places / arms exits)
//   canceled | expired | rejected → engine.remove
//   anything else                → left alone
//
// Runs once at startup (bridging downtime) and then periodically. Broker
// lookups that fail are counted and logged; the record is retried next pass.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::exit::engine::{ExitEngine, FillOutcome};
use crate::exit::machine::Observation;
use crate::exit::strategy::StrategyStatus;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileResult {
    /// Records in `waiting_fill` at the start of the pass.
    pub checked: u32,
    /// Entries the broker reported filled and that were applied.
    pub filled: u32,
    /// Entries that can no longer fill and were removed.
    pub removed: u32,
    /// Entries still open at the broker.
    pub pending: u32,
    /// Broker lookups (or exit placements) that failed.
    pub errors: u32,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Run one reconciliation cycle. Fails only when every lookup failed, which
/// usually means the broker is unreachable.
pub async fn reconcile_once(engine: &ExitEngine) -> Result<ReconcileResult> {
    let waiting = engine.list_by_status(StrategyStatus::WaitingFill);
    let mut result = ReconcileResult {
        checked: waiting.len() as u32,
        timestamp: Utc::now().to_rfc3339(),
        ..ReconcileResult::default()
    };

    if waiting.is_empty() {
        debug!("reconcile: nothing waiting for a fill");
        return Ok(result);
    }

    for record in waiting {
        let order = match engine.broker().get_order(&record.order_id).await {
            Ok(order) => order,
            Err(e) => {
                warn!(order_id = %record.order_id, error = %e, "reconcile: order lookup failed");
                result.errors += 1;
                continue;
            }
        };

        match Observation::from_order_status(&order.status) {
            Observation::Filled => {
                match engine.apply_fill(&record.order_id, order.filled_avg_price).await {
                    FillOutcome::Failed { error } => {
                        warn!(order_id = %record.order_id, error = %error, "reconcile: exit placement failed");
                        result.errors += 1;
                    }
                    outcome => {
                        info!(order_id = %record.order_id, outcome = ?outcome, "reconcile: applied missed fill");
                        result.filled += 1;
                    }
                }
            }
            Observation::Terminated => {
                if engine.remove(&record.order_id, &order.status).await {
                    result.removed += 1;
                }
            }
            Observation::Other => {
                debug!(order_id = %record.order_id, status = %order.status, "reconcile: entry still open");
                result.pending += 1;
            }
        }
    }

    info!(
        checked = result.checked,
        filled = result.filled,
        removed = result.removed,
        pending = result.pending,
        errors = result.errors,
        "reconciliation cycle complete"
    );

    if result.errors == result.checked {
        bail!("reconcile: all {} order lookups failed", result.errors);
    }
    Ok(result)
}

/// Startup pass followed by one pass every `interval_secs` (0 = startup only).
pub async fn run_reconcile_loop(state: Arc<AppState>, interval_secs: u64, cancel: CancellationToken) {
    let run = |state: Arc<AppState>| async move {
        let outcome = reconcile_once(&state.engine).await.map(|_| ()).map_err(|e| format!("{e:#}"));
        state.record_reconcile(outcome);
    };

    run(state.clone()).await;

    if interval_secs == 0 {
        info!("periodic reconciliation disabled");
        return;
    }

    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the startup pass already ran.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => run(state.clone()).await,
        }
    }

    info!("reconcile loop stopped");
}
