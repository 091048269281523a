// =============================================================================
// Exit Monitor Loops — trade-update listener and trigger sweep
// =============================================================================
//
// Both loops are spawned once at startup and stop when the shared
// CancellationToken fires:
//
//   tokio::spawn(run_trade_update_listener(engine.clone(), rx, cancel.clone()));
//   tokio::spawn(run_trigger_sweep(engine.clone(), 5, cancel.clone()));
//
// The listener is the only consumer of the trade-update channel. The sweep
// runs the trigger poller for every armed record so protective orders go
// out even when no client is polling check-trigger.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exit::engine::ExitEngine;
use crate::stream::TradeUpdate;

/// Drain the trade-update channel into the engine until the channel closes
/// or `cancel` fires.
pub async fn run_trade_update_listener(
    engine: Arc<ExitEngine>,
    mut updates: mpsc::Receiver<TradeUpdate>,
    cancel: CancellationToken,
) {
    info!("trade update listener started");

    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => update,
        };
        let Some(update) = update else {
            break;
        };
        engine.handle_trade_update(&update).await;
    }

    info!("trade update listener stopped");
}

/// Periodically run the trigger poller over every `waiting_trigger` record.
/// An interval of zero disables the sweep.
pub async fn run_trigger_sweep(engine: Arc<ExitEngine>, interval_secs: u64, cancel: CancellationToken) {
    if interval_secs == 0 {
        info!("trigger sweep disabled");
        return;
    }

    info!(interval_secs, "trigger sweep started");
    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fired = engine.sweep_triggers().await;
        if fired > 0 {
            info!(fired, "trigger sweep placed protective orders");
        } else {
            debug!("trigger sweep: nothing fired");
        }
    }

    info!("trigger sweep stopped");
}
