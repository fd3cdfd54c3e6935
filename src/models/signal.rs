//! Trading signal model: the reference prices an allocation is measured against.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Buy => Decimal::ONE,
            Direction::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Direction::Buy),
            "SELL" | "SHORT" => Ok(Direction::Sell),
            other => anyhow::bail!("Unknown signal direction: {}", other),
        }
    }
}

/// A published trading signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique signal identifier
    pub id: String,

    /// Instrument symbol (e.g., "EURUSD", "XAUUSD")
    pub symbol: String,

    /// Trade direction
    pub direction: Direction,

    /// Suggested entry price
    pub entry_price: Decimal,

    /// Stop-loss price
    pub stop_loss: Decimal,

    /// Take-profit price
    pub take_profit: Decimal,

    /// When the signal was published
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Create a new signal with a fresh identifier.
    pub fn new(
        symbol: &str,
        direction: Direction,
        entry_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.trim().to_uppercase(),
            direction,
            entry_price,
            stop_loss,
            take_profit,
            created_at: Utc::now(),
        }
    }
}
