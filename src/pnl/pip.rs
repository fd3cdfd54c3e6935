//! Pip sizes and pip values.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Pip size for symbols missing from the table.
pub const DEFAULT_PIP_SIZE: Decimal = dec!(0.0001);

/// Price increment of one pip for a symbol.
///
/// Accepts `EURUSD`, `eur/usd` and `EUR_USD` alike.
pub fn pip_size(symbol: &str) -> Decimal {
    let normalized: String = symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();

    match normalized.as_str() {
        // JPY-quoted pairs
        "USDJPY" | "EURJPY" | "GBPJPY" | "AUDJPY" | "NZDJPY" | "CADJPY" | "CHFJPY"
        | "SGDJPY" => dec!(0.01),

        // Metals
        "XAUUSD" | "XAGUSD" => dec!(0.01),

        // Majors and crosses
        "EURUSD" | "GBPUSD" | "AUDUSD" | "NZDUSD" | "USDCAD" | "USDCHF" | "EURGBP"
        | "EURAUD" | "EURCAD" | "EURCHF" | "GBPAUD" | "GBPCAD" | "GBPCHF" | "AUDCAD"
        | "AUDNZD" | "NZDCAD" => dec!(0.0001),

        _ => DEFAULT_PIP_SIZE,
    }
}

/// Converts a pip count into money for a position size.
pub trait PipValueModel: Send + Sync {
    /// USD value of one pip for `lot_size` lots of `symbol`, `None` if it
    /// does not fit in a `Decimal`.
    fn pip_value_usd(&self, symbol: &str, lot_size: Decimal) -> Option<Decimal>;
}

/// Same USD amount per pip per lot for every instrument.
///
/// An approximation: the true pip value depends on the quote currency
/// and contract size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatPipValue {
    pub usd_per_pip_per_lot: Decimal,
}

impl Default for FlatPipValue {
    fn default() -> Self {
        Self {
            usd_per_pip_per_lot: dec!(10),
        }
    }
}

impl PipValueModel for FlatPipValue {
    fn pip_value_usd(&self, _symbol: &str, lot_size: Decimal) -> Option<Decimal> {
        lot_size.checked_mul(self.usd_per_pip_per_lot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pip_sizes() {
        assert_eq!(pip_size("EURUSD"), dec!(0.0001));
        assert_eq!(pip_size("USDJPY"), dec!(0.01));
        assert_eq!(pip_size("gbp/jpy"), dec!(0.01));
        assert_eq!(pip_size("XAUUSD"), dec!(0.01));
        assert_eq!(pip_size("EUR_GBP"), dec!(0.0001));
        assert_eq!(pip_size("USDSEK"), DEFAULT_PIP_SIZE);
    }

    #[test]
    fn test_flat_pip_value() {
        let model = FlatPipValue::default();
        assert_eq!(model.pip_value_usd("EURUSD", dec!(0.5)), Some(dec!(5)));
        assert_eq!(model.pip_value_usd("XAUUSD", dec!(2)), Some(dec!(20)));
        assert_eq!(model.pip_value_usd("EURUSD", Decimal::MAX), None);
    }
}
