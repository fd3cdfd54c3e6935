//! Trading account model with its derived risk aggregates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A subscriber's trading account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier
    pub id: String,

    /// Owning user
    pub user_id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Balance the account started with, in USD
    pub starting_balance: Decimal,

    /// Running average lot size, 4 decimal places.
    /// `None` until the first consistency check past cold start.
    pub avg_lot_size: Option<Decimal>,

    /// Sum of unrealized P&L at the last scoped sync
    #[serde(default)]
    pub unrealized_pnl: Decimal,

    /// Starting balance plus realized and unrealized P&L
    pub theoretical_equity: Decimal,

    /// When P&L was last synced for this account
    pub last_synced_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with no trading history.
    pub fn new(id: &str, user_id: &str, name: &str, starting_balance: Decimal) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            starting_balance,
            avg_lot_size: None,
            unrealized_pnl: Decimal::ZERO,
            theoretical_equity: starting_balance,
            last_synced_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}
