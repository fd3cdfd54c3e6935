//! Consistency alert: append-only audit record of a lot-size anomaly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The only alert type the lot-size guard writes.
pub const LOT_SIZE_SPIKE: &str = "lot_size_spike";

/// How the spike was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Order allowed, trader warned
    Warning,
    /// Order rejected
    Blocked,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Blocked => "blocked",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(AlertSeverity::Warning),
            "blocked" => Ok(AlertSeverity::Blocked),
            other => anyhow::bail!("Unknown alert severity: {}", other),
        }
    }
}

/// Audit record of a detected lot-size spike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyAlert {
    pub id: String,
    pub user_id: String,
    pub account_id: String,

    /// Always [`LOT_SIZE_SPIKE`]
    pub alert_type: String,

    pub severity: AlertSeverity,

    /// Requested lot size
    pub observed_value: Decimal,

    /// Average lot size the request was compared with
    pub expected_value: Decimal,

    /// Spike threshold as a percentage of the average (e.g., 150)
    pub threshold_pct: Decimal,

    pub was_blocked: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ConsistencyAlert {
    /// Build a lot-size spike alert. Severity follows whether the order was blocked.
    pub fn lot_size_spike(
        user_id: &str,
        account_id: &str,
        observed_value: Decimal,
        expected_value: Decimal,
        threshold_pct: Decimal,
        was_blocked: bool,
        message: String,
    ) -> Self {
        let severity = if was_blocked {
            AlertSeverity::Blocked
        } else {
            AlertSeverity::Warning
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            account_id: account_id.to_string(),
            alert_type: LOT_SIZE_SPIKE.to_string(),
            severity,
            observed_value,
            expected_value,
            threshold_pct,
            was_blocked,
            message,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_severity_follows_block_flag() {
        let warn = ConsistencyAlert::lot_size_spike(
            "u1", "a1", dec!(2), dec!(1), dec!(150), false, "spike".to_string(),
        );
        assert_eq!(warn.severity, AlertSeverity::Warning);
        assert_eq!(warn.alert_type, LOT_SIZE_SPIKE);

        let blocked = ConsistencyAlert::lot_size_spike(
            "u1", "a1", dec!(2), dec!(1), dec!(150), true, "spike".to_string(),
        );
        assert_eq!(blocked.severity, AlertSeverity::Blocked);
        assert!(blocked.was_blocked);
    }
}
