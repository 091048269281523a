// =============================================================================
// Shared types used across the exit engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an order. Entry orders carry the side that opened the
/// position; close orders always use [`Side::opposite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "buy", alias = "Buy")]
    Buy,
    #[serde(alias = "sell", alias = "Sell")]
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Lowercase form used on the Alpaca wire.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// How an offset magnitude is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetType {
    #[default]
    Dollar,
    Percent,
}

/// A price distance: either an absolute dollar amount or a percentage of a
/// reference price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    #[serde(default)]
    pub offset_type: OffsetType,
    pub amount: f64,
}

impl Offset {
    pub fn dollar(amount: f64) -> Self {
        Self {
            offset_type: OffsetType::Dollar,
            amount,
        }
    }

    pub fn percent(amount: f64) -> Self {
        Self {
            offset_type: OffsetType::Percent,
            amount,
        }
    }
}

/// Whether we are trading against the paper or the live brokerage account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Paper,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Market data feed used for the quote stream and latest-quote lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataFeed {
    #[default]
    Iex,
    Sip,
}

impl DataFeed {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iex => "iex",
            Self::Sip => "sip",
        }
    }
}
