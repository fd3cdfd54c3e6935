//! Lot-size consistency guard.
//!
//! Compares a requested order size with the account's recent allocations and
//! flags sizes far above the trader's habit (revenge trading, fat fingers).
//! Two statistics are involved:
//! - the **window mean** of the most recent allocations, used for the spike test;
//! - the **running average** stored on the account, nudged toward every
//!   requested size with weight `1 / (n + 1)`.
//!
//! The guard fails open: if history cannot be read the order is allowed and
//! the outcome says so.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::ConsistencyAlert;

use super::error::{RiskError, RiskResult};
use super::LotSizeConfig;

/// A validated consistency check request.
#[derive(Debug, Clone)]
pub struct LotSizeRequest {
    pub account_id: String,
    pub user_id: String,
    pub requested_lot_size: Decimal,
    pub hard_block: bool,
}

impl LotSizeRequest {
    /// Validate raw request fields. Empty identifiers count as missing.
    pub fn new(
        account_id: Option<String>,
        user_id: Option<String>,
        requested_lot_size: Option<Decimal>,
        hard_block: Option<bool>,
    ) -> RiskResult<Self> {
        let account_id = account_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(RiskError::MissingField("account_id"))?;
        let user_id = user_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(RiskError::MissingField("user_id"))?;
        let requested_lot_size =
            requested_lot_size.ok_or(RiskError::MissingField("requested_lot_size"))?;

        if requested_lot_size <= Decimal::ZERO {
            return Err(RiskError::InvalidLotSize(format!(
                "must be positive, got {}",
                requested_lot_size
            )));
        }

        Ok(Self {
            account_id,
            user_id,
            requested_lot_size,
            hard_block: hard_block.unwrap_or(false),
        })
    }
}

/// Result of comparing a request against an established baseline.
#[derive(Debug, Clone, Serialize)]
pub struct LotSizeCheck {
    pub allowed: bool,
    pub is_spike: bool,
    pub requested_lot_size: Decimal,
    /// Window mean, 2 decimal places
    pub avg_lot_size: Decimal,
    /// Largest size that is not a spike, truncated to 2 decimal places
    pub max_allowed_lot_size: Decimal,
    /// Requested size as a whole percentage of the window mean
    pub spike_percentage: i64,
    pub message: Option<String>,
    pub recommendation: Option<String>,
    /// Number of allocations in the window
    pub trades_analyzed: usize,
    /// Account running average after this request, 4 decimal places
    pub running_avg_lot_size: Decimal,
}

/// Typed outcome of a consistency check.
#[derive(Debug, Clone)]
pub enum ConsistencyOutcome {
    /// Baseline established and the request compared against it
    Evaluated(LotSizeCheck),
    /// Cold start: too few allocations to judge
    InsufficientHistory {
        requested_lot_size: Decimal,
        trades_found: usize,
        trades_required: usize,
    },
    /// History could not be read; the order is let through
    SourceUnavailable {
        requested_lot_size: Decimal,
        reason: String,
    },
}

impl ConsistencyOutcome {
    pub fn allowed(&self) -> bool {
        match self {
            ConsistencyOutcome::Evaluated(check) => check.allowed,
            _ => true,
        }
    }

    pub fn is_spike(&self) -> bool {
        matches!(self, ConsistencyOutcome::Evaluated(check) if check.is_spike)
    }

    pub fn status(&self) -> &'static str {
        match self {
            ConsistencyOutcome::Evaluated(_) => "evaluated",
            ConsistencyOutcome::InsufficientHistory { .. } => "insufficient_history",
            ConsistencyOutcome::SourceUnavailable { .. } => "source_unavailable",
        }
    }

    pub fn requested_lot_size(&self) -> Decimal {
        match self {
            ConsistencyOutcome::Evaluated(check) => check.requested_lot_size,
            ConsistencyOutcome::InsufficientHistory { requested_lot_size, .. }
            | ConsistencyOutcome::SourceUnavailable { requested_lot_size, .. } => {
                *requested_lot_size
            }
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            ConsistencyOutcome::Evaluated(check) => check.message.clone(),
            ConsistencyOutcome::InsufficientHistory {
                trades_found,
                trades_required,
                ..
            } => Some(format!(
                "Not enough trade history to establish a lot size baseline ({}/{} trades, {} more needed)",
                trades_found,
                trades_required,
                trades_required.saturating_sub(*trades_found)
            )),
            ConsistencyOutcome::SourceUnavailable { reason, .. } => Some(format!(
                "Lot size consistency could not be evaluated: {}",
                reason
            )),
        }
    }

    pub fn check(&self) -> Option<&LotSizeCheck> {
        match self {
            ConsistencyOutcome::Evaluated(check) => Some(check),
            _ => None,
        }
    }
}

/// Arithmetic mean at full precision. Zero for an empty slice.
pub fn window_mean(history: &[Decimal]) -> Decimal {
    if history.is_empty() {
        return Decimal::ZERO;
    }
    let n = Decimal::from(history.len() as u64);

    let sum = history
        .iter()
        .try_fold(Decimal::ZERO, |total, lot| total.checked_add(*lot));
    match sum {
        Some(sum) => sum / n,
        // Sizes near Decimal::MAX: average the shares instead
        None => history.iter().map(|lot| *lot / n).sum(),
    }
}

/// `(previous * n + requested) / (n + 1)`, 4 decimal places.
///
/// Computed as `previous + (requested - previous) / (n + 1)`, which stays in
/// range for any positive sizes.
pub fn next_running_average(previous: Decimal, n: usize, requested: Decimal) -> Decimal {
    let weight = Decimal::from(n as u64) + Decimal::ONE;
    requested
        .checked_sub(previous)
        .and_then(|delta| delta.checked_div(weight))
        .and_then(|step| previous.checked_add(step))
        .unwrap_or(requested)
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

/// Evaluate a request against lot-size history (newest first).
///
/// `previous_running_avg` is the account's stored running average; when absent
/// the window mean seeds it.
pub fn evaluate(
    config: &LotSizeConfig,
    history: &[Decimal],
    previous_running_avg: Option<Decimal>,
    request: &LotSizeRequest,
) -> ConsistencyOutcome {
    let requested = request.requested_lot_size;

    if history.len() < config.min_history as usize {
        return ConsistencyOutcome::InsufficientHistory {
            requested_lot_size: requested,
            trades_found: history.len(),
            trades_required: config.min_history as usize,
        };
    }

    let mean = window_mean(history);
    let max_allowed = mean.checked_mul(config.spike_multiplier).unwrap_or(Decimal::MAX);
    // Saturates for sizes too far above the mean to express
    let spike_percentage = if mean.is_zero() {
        0
    } else {
        requested
            .checked_div(mean)
            .and_then(|ratio| ratio.checked_mul(dec!(100)))
            .and_then(|pct| {
                pct.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                    .to_i64()
            })
            .unwrap_or(i64::MAX)
    };

    let avg_display = mean.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let max_display = max_allowed.round_dp_with_strategy(2, RoundingStrategy::ToZero);
    let is_spike = requested > max_allowed;
    let allowed = !(is_spike && request.hard_block);

    let (message, recommendation) = if is_spike {
        let prefix = if allowed { "" } else { "Order blocked: " };
        (
            Some(format!(
                "{}Lot size {} is {}% of your recent average of {} lots, above the {}% consistency limit",
                prefix,
                requested.normalize(),
                spike_percentage,
                avg_display.normalize(),
                config.threshold_pct().normalize()
            )),
            Some(format!(
                "Reduce your position to {} lots or less to stay consistent with your last {} trades",
                max_display.normalize(),
                history.len()
            )),
        )
    } else {
        (None, None)
    };

    let previous = previous_running_avg.unwrap_or(avg_display);

    ConsistencyOutcome::Evaluated(LotSizeCheck {
        allowed,
        is_spike,
        requested_lot_size: requested,
        avg_lot_size: avg_display,
        max_allowed_lot_size: max_display,
        spike_percentage,
        message,
        recommendation,
        trades_analyzed: history.len(),
        running_avg_lot_size: next_running_average(previous, history.len(), requested),
    })
}

/// Consistency check service backed by the allocation history in the database.
#[derive(Clone)]
pub struct LotSizeGuard {
    db: Database,
    config: LotSizeConfig,
}

impl LotSizeGuard {
    pub fn new(db: Database, config: LotSizeConfig) -> Self {
        Self { db, config }
    }

    /// Run the consistency check for one requested order.
    ///
    /// Side effects past cold start: the account's running average is
    /// rewritten (last writer wins), and a spike appends one alert. Failures of
    /// either write are logged and do not change the decision.
    pub async fn check(&self, request: &LotSizeRequest) -> RiskResult<ConsistencyOutcome> {
        let account = match self.db.get_account(&request.account_id).await {
            Ok(Some(account)) if account.is_owned_by(&request.user_id) => account,
            Ok(_) => {
                return Err(RiskError::AccountNotFound {
                    account_id: request.account_id.clone(),
                    user_id: request.user_id.clone(),
                })
            }
            Err(e) => {
                warn!(account_id = %request.account_id, error = %e, "Account lookup failed, allowing order");
                return Ok(ConsistencyOutcome::SourceUnavailable {
                    requested_lot_size: request.requested_lot_size,
                    reason: e.to_string(),
                });
            }
        };

        let history = match self
            .db
            .recent_lot_sizes(&request.user_id, &request.account_id, self.config.history_window)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(account_id = %request.account_id, error = %e, "Lot size history unavailable, allowing order");
                return Ok(ConsistencyOutcome::SourceUnavailable {
                    requested_lot_size: request.requested_lot_size,
                    reason: e.to_string(),
                });
            }
        };

        let outcome = evaluate(&self.config, &history, account.avg_lot_size, request);

        let ConsistencyOutcome::Evaluated(check) = &outcome else {
            info!(
                account_id = %request.account_id,
                trades = history.len(),
                required = self.config.min_history,
                "Insufficient lot size history"
            );
            return Ok(outcome);
        };

        if check.is_spike {
            warn!(
                account_id = %request.account_id,
                requested = %check.requested_lot_size,
                average = %check.avg_lot_size,
                spike_pct = check.spike_percentage,
                blocked = !check.allowed,
                "Lot size spike detected"
            );

            let alert = ConsistencyAlert::lot_size_spike(
                &request.user_id,
                &request.account_id,
                check.requested_lot_size,
                check.avg_lot_size,
                self.config.threshold_pct(),
                !check.allowed,
                check.message.clone().unwrap_or_default(),
            );
            if let Err(e) = self.db.insert_consistency_alert(&alert).await {
                warn!(account_id = %request.account_id, error = %e, "Failed to record consistency alert");
            }
        } else {
            debug!(
                account_id = %request.account_id,
                requested = %check.requested_lot_size,
                average = %check.avg_lot_size,
                "Lot size consistent with history"
            );
        }

        if let Err(e) = self
            .db
            .update_account_avg_lot_size(&request.account_id, check.running_avg_lot_size)
            .await
        {
            warn!(account_id = %request.account_id, error = %e, "Failed to update running lot size average");
        }

        Ok(outcome)
    }
}
