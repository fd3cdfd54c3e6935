//! Request and response bodies of the HTTP functions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::ConsistencyOutcome;

/// Body of `POST /functions/v1/lot-size-consistency`.
///
/// All fields optional so missing ones can be reported by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LotSizeCheckBody {
    pub account_id: Option<String>,
    pub user_id: Option<String>,
    pub requested_lot_size: Option<Decimal>,
    pub hard_block: Option<bool>,
}

/// Body of `POST /functions/v1/sync-trade-pnl`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTradePnlBody {
    pub user_id: Option<String>,
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LotSizeCheckResponse {
    /// `evaluated`, `insufficient_history` or `source_unavailable`
    pub status: &'static str,
    pub allowed: bool,
    pub is_spike: bool,
    #[serde(with = "rust_decimal::serde::float")]
    pub requested_lot_size: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_lot_size: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub max_allowed_lot_size: Decimal,
    pub spike_percentage: i64,
    pub message: Option<String>,
    pub recommendation: Option<String>,
}

impl From<&ConsistencyOutcome> for LotSizeCheckResponse {
    fn from(outcome: &ConsistencyOutcome) -> Self {
        let check = outcome.check();
        Self {
            status: outcome.status(),
            allowed: outcome.allowed(),
            is_spike: outcome.is_spike(),
            requested_lot_size: outcome.requested_lot_size(),
            avg_lot_size: check.map(|c| c.avg_lot_size).unwrap_or_default(),
            max_allowed_lot_size: check.map(|c| c.max_allowed_lot_size).unwrap_or_default(),
            spike_percentage: check.map(|c| c.spike_percentage).unwrap_or_default(),
            message: outcome.message(),
            recommendation: check.and_then(|c| c.recommendation.clone()),
        }
    }
}
