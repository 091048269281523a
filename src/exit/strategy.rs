// =============================================================================
// Exit Strategy Record — one per entry order awaiting its exit action
// =============================================================================
//
// Layout: a common envelope (order id, symbol, quantity, side, status, fill
// and trigger prices) plus a tagged payload per strategy type. The payload is
// flattened into the envelope on the wire so the persisted file reads as a
// flat object with a `strategy_type` discriminator.
// =============================================================================

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Offset, Side};

fn default_fill_timeout_secs() -> u64 {
    15
}

fn default_trigger_timeout_secs() -> u64 {
    300
}

// =============================================================================
// Status
// =============================================================================

/// State-machine position of an [`ExitStrategy`].
///
/// Only `WaitingFill` and `WaitingTrigger` are ever persisted; the placed
/// states are terminal and the record is deleted as soon as they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    WaitingFill,
    WaitingTrigger,
    ProfitPlaced,
    BracketPlaced,
    StopPlaced,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WaitingFill => "waiting_fill",
            Self::WaitingTrigger => "waiting_trigger",
            Self::ProfitPlaced => "profit_placed",
            Self::BracketPlaced => "bracket_placed",
            Self::StopPlaced => "stop_placed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Broker ids of bracket legs that have already been accepted. A retry after
/// a partial failure only places the legs still missing here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketLegs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_order_id: Option<String>,
}

impl BracketLegs {
    pub fn is_empty(&self) -> bool {
        self.stop_loss_order_id.is_none() && self.take_profit_order_id.is_none()
    }
}

/// Strategy-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy_type", rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Single limit close at fill ± offset, placed as soon as the entry fills.
    ProfitTarget { profit_offset: Offset },

    /// Take-profit limit plus stop-loss stop-limit, both placed on fill.
    Bracket {
        take_profit: Offset,
        stop_loss: Offset,
        #[serde(default, skip_serializing_if = "BracketLegs::is_empty")]
        legs: BracketLegs,
    },

    /// Wait for price to confirm the move, then place a stop-limit below
    /// (long) or above (short) the confirming price.
    ConfirmationStop { trigger: Offset, stop: Offset },

    /// Wait for price to confirm the move, then hand off to a broker-managed
    /// trailing stop.
    TrailingStop { trigger: Offset, trail: Offset },
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProfitTarget { .. } => "profit-target",
            Self::Bracket { .. } => "bracket",
            Self::ConfirmationStop { .. } => "confirmation-stop",
            Self::TrailingStop { .. } => "trailing-stop",
        }
    }

    /// Offset used to derive the trigger price, for the deferred strategies.
    pub fn trigger_offset(&self) -> Option<Offset> {
        match self {
            Self::ConfirmationStop { trigger, .. } | Self::TrailingStop { trigger, .. } => {
                Some(*trigger)
            }
            _ => None,
        }
    }

    fn offsets(&self) -> Vec<(&'static str, Offset)> {
        match self {
            Self::ProfitTarget { profit_offset } => vec![("profit_offset", *profit_offset)],
            Self::Bracket {
                take_profit,
                stop_loss,
                ..
            } => vec![("take_profit", *take_profit), ("stop_loss", *stop_loss)],
            Self::ConfirmationStop { trigger, stop } => {
                vec![("trigger", *trigger), ("stop", *stop)]
            }
            Self::TrailingStop { trigger, trail } => vec![("trigger", *trigger), ("trail", *trail)],
        }
    }
}

// =============================================================================
// Registration request
// =============================================================================

/// Parameters supplied by a client when registering an exit strategy for an
/// entry order it has just placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub symbol: String,
    pub quantity: u32,
    pub side: Side,
    #[serde(flatten)]
    pub kind: StrategyKind,
    #[serde(default = "default_fill_timeout_secs")]
    pub fill_timeout_secs: u64,
    #[serde(default = "default_trigger_timeout_secs")]
    pub trigger_timeout_secs: u64,
}

impl StrategySpec {
    /// Reject parameters that could never produce a sane close order.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("symbol is required");
        }
        if self.quantity == 0 {
            bail!("quantity must be positive");
        }
        for (name, offset) in self.kind.offsets() {
            if !offset.amount.is_finite() || offset.amount < 0.0 {
                bail!("{name} must be a non-negative number, got {}", offset.amount);
            }
        }
        if let StrategyKind::Bracket { stop_loss, .. } = &self.kind {
            if stop_loss.amount == 0.0 {
                bail!("stop_loss must be greater than zero");
            }
        }
        Ok(())
    }
}

// =============================================================================
// ExitStrategy
// =============================================================================

/// A pending exit strategy keyed by the broker id of its entry order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitStrategy {
    pub order_id: String,
    pub symbol: String,
    pub quantity: u32,
    /// Entry direction. Close orders use the opposite side.
    pub side: Side,
    #[serde(flatten)]
    pub kind: StrategyKind,
    pub status: StrategyStatus,
    #[serde(default)]
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_fill_timeout_secs")]
    pub fill_timeout_secs: u64,
    #[serde(default = "default_trigger_timeout_secs")]
    pub trigger_timeout_secs: u64,
}

impl ExitStrategy {
    /// Build a fresh `waiting_fill` record for `order_id`.
    pub fn new(order_id: impl Into<String>, spec: StrategySpec) -> Self {
        let kind = match spec.kind {
            // Leg ids are engine-owned; never trust a client-supplied value.
            StrategyKind::Bracket {
                take_profit,
                stop_loss,
                ..
            } => StrategyKind::Bracket {
                take_profit,
                stop_loss,
                legs: BracketLegs::default(),
            },
            other => other,
        };

        Self {
            order_id: order_id.into(),
            symbol: spec.symbol.trim().to_uppercase(),
            quantity: spec.quantity,
            side: spec.side,
            kind,
            status: StrategyStatus::WaitingFill,
            fill_price: None,
            trigger_price: None,
            created_at: Utc::now(),
            fill_timeout_secs: spec.fill_timeout_secs,
            trigger_timeout_secs: spec.trigger_timeout_secs,
        }
    }

    pub fn strategy_type(&self) -> &'static str {
        self.kind.name()
    }

    /// Side of every close order for this record.
    pub fn close_side(&self) -> Side {
        self.side.opposite()
    }

    /// Client-side polling hints echoed back at registration.
    pub fn monitoring(&self) -> MonitoringHint {
        MonitoringHint {
            strategy: self.strategy_type(),
            fill_timeout_secs: self.fill_timeout_secs,
            trigger_timeout_secs: self
                .kind
                .trigger_offset()
                .map(|_| self.trigger_timeout_secs),
        }
    }
}

/// How long a client should keep polling each phase before giving up.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringHint {
    pub strategy: &'static str,
    pub fill_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_timeout_secs: Option<u64>,
}
