//! Lot-size consistency policy.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Policy constants for the lot-size consistency guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotSizeConfig {
    /// Number of most recent allocations forming the baseline
    pub history_window: u32,

    /// Allocations required before spikes are evaluated
    pub min_history: u32,

    /// Requested size above `average * spike_multiplier` is a spike
    pub spike_multiplier: Decimal,
}

impl Default for LotSizeConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            min_history: 5,
            spike_multiplier: dec!(1.5), // 150% of average
        }
    }
}

impl LotSizeConfig {
    /// Spike threshold as a percentage of the average (150 for 1.5x).
    pub fn threshold_pct(&self) -> Decimal {
        self.spike_multiplier * dec!(100)
    }
}
