//! Trade allocation model: capital assigned to one signal for one account.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::signal::Signal;

/// Lifecycle status of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    #[default]
    Open,
    Closed,
    Cancelled,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Open => "open",
            AllocationStatus::Closed => "closed",
            AllocationStatus::Cancelled => "cancelled",
        }
    }

    /// Only open allocations move, and only to a terminal state.
    pub fn can_transition_to(&self, next: AllocationStatus) -> bool {
        matches!(
            (self, next),
            (AllocationStatus::Open, AllocationStatus::Closed)
                | (AllocationStatus::Open, AllocationStatus::Cancelled)
        )
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AllocationStatus::Open),
            "closed" => Ok(AllocationStatus::Closed),
            "cancelled" => Ok(AllocationStatus::Cancelled),
            other => anyhow::bail!("Unknown allocation status: {}", other),
        }
    }
}

/// A user's position on a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAllocation {
    /// Unique allocation identifier
    pub id: String,

    /// Owning user
    pub user_id: String,

    /// Owning trading account
    pub account_id: String,

    /// Referenced signal
    pub signal_id: String,

    /// Position size in lots (always positive)
    pub lot_size: Decimal,

    /// Fill price of the allocation
    pub entry_price: Decimal,

    /// Current lifecycle status
    #[serde(default)]
    pub status: AllocationStatus,

    /// Last live price used for P&L
    pub current_price: Option<Decimal>,

    /// Unrealized P&L in USD
    #[serde(default)]
    pub unrealized_pnl: Decimal,

    /// Signed pip movement since entry
    #[serde(default)]
    pub pips_moved: Decimal,

    /// Progress from stop-loss (0) to take-profit (100)
    #[serde(default)]
    pub progress_pct: Decimal,

    /// P&L fixed at close
    pub realized_pnl: Option<Decimal>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TradeAllocation {
    /// Create a new open allocation.
    pub fn new(
        user_id: &str,
        account_id: &str,
        signal_id: &str,
        lot_size: Decimal,
        entry_price: Decimal,
    ) -> Result<Self> {
        if lot_size <= Decimal::ZERO {
            anyhow::bail!("Lot size must be positive, got {}", lot_size);
        }

        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            account_id: account_id.to_string(),
            signal_id: signal_id.to_string(),
            lot_size,
            entry_price,
            status: AllocationStatus::Open,
            current_price: None,
            unrealized_pnl: Decimal::ZERO,
            pips_moved: Decimal::ZERO,
            progress_pct: Decimal::ZERO,
            realized_pnl: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        })
    }

    /// Move to a terminal status, fixing the realized P&L.
    pub fn finalize(&mut self, status: AllocationStatus, realized_pnl: Decimal) -> Result<()> {
        if !self.status.can_transition_to(status) {
            anyhow::bail!(
                "Allocation {} cannot move from {} to {}",
                self.id,
                self.status,
                status
            );
        }

        let now = Utc::now();
        self.status = status;
        self.realized_pnl = Some(realized_pnl);
        self.unrealized_pnl = Decimal::ZERO;
        self.updated_at = now;
        self.closed_at = Some(now);
        Ok(())
    }
}

/// An allocation joined with the signal it follows.
#[derive(Debug, Clone)]
pub struct AllocationWithSignal {
    pub allocation: TradeAllocation,
    pub signal: Signal,
}
