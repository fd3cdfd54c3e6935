//! Unrealized P&L and progress-to-target for a single allocation.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::models::AllocationWithSignal;

use super::pip::{pip_size, PipValueModel};

/// P&L figures for one allocation at one price.
#[derive(Debug, Clone, PartialEq)]
pub struct PnlSnapshot {
    /// Signed pips in the position's favour
    pub pips: Decimal,
    pub unrealized_pnl: Decimal,
    pub pips_to_stop: Decimal,
    pub pips_to_target: Decimal,
    /// 0 at stop-loss, 100 at take-profit
    pub progress_pct: Decimal,
}

impl PnlSnapshot {
    /// Persisted precision: pips 1dp, money 2dp, progress 2dp.
    pub fn rounded(&self) -> Self {
        let round = |v: Decimal, dp: u32| v.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
        Self {
            pips: round(self.pips, 1),
            unrealized_pnl: round(self.unrealized_pnl, 2),
            pips_to_stop: round(self.pips_to_stop, 1),
            pips_to_target: round(self.pips_to_target, 1),
            progress_pct: round(self.progress_pct, 2),
        }
    }
}

/// Computes P&L with a pluggable pip value model.
#[derive(Debug, Clone)]
pub struct PnlCalculator<M: PipValueModel> {
    model: M,
}

impl<M: PipValueModel> PnlCalculator<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// P&L of `position` marked at `current_price`, full precision.
    ///
    /// `None` when a figure overflows `Decimal`, i.e. the price or the
    /// position size is out of any tradeable range.
    pub fn evaluate(&self, position: &AllocationWithSignal, current_price: Decimal) -> Option<PnlSnapshot> {
        let allocation = &position.allocation;
        let signal = &position.signal;

        let pip = pip_size(&signal.symbol);
        let entry = allocation.entry_price;

        let pips = current_price
            .checked_sub(entry)?
            .checked_mul(signal.direction.sign())?
            .checked_div(pip)?;
        let unrealized_pnl = pips.checked_mul(
            self.model.pip_value_usd(&signal.symbol, allocation.lot_size)?,
        )?;

        let pips_to_stop = entry.checked_sub(signal.stop_loss)?.abs().checked_div(pip)?;
        let pips_to_target = signal.take_profit.checked_sub(entry)?.abs().checked_div(pip)?;

        Some(PnlSnapshot {
            pips,
            unrealized_pnl,
            pips_to_stop,
            pips_to_target,
            progress_pct: progress(pips, pips_to_stop, pips_to_target),
        })
    }
}

/// Position of `pips` on the stop-to-target range as a percentage, clamped.
fn progress(pips: Decimal, pips_to_stop: Decimal, pips_to_target: Decimal) -> Decimal {
    let ratio = pips_to_stop
        .checked_add(pips_to_target)
        .filter(|range| !range.is_zero())
        .and_then(|range| pips.checked_add(pips_to_stop)?.checked_div(range));

    match ratio {
        Some(ratio) => ratio
            .checked_mul(dec!(100))
            .unwrap_or(if ratio.is_sign_negative() { Decimal::ZERO } else { dec!(100) })
            .clamp(Decimal::ZERO, dec!(100)),
        None if pips_to_stop.is_zero() && pips_to_target.is_zero() => dec!(50),
        // Out of range on either side
        None if pips.is_sign_negative() => Decimal::ZERO,
        None => dec!(100),
    }
}
