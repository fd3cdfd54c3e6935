//! Live price sources for P&L recalculation.
//!
//! A missing symbol in the returned map is a normal answer, not an error.

mod http_source;

use std::collections::HashMap;

use anyhow::Result;
use futures::future::{self, BoxFuture};
use rust_decimal::Decimal;

pub use http_source::HttpPriceSource;

/// Anything that can quote current prices for a set of symbols.
pub trait PriceSource: Send + Sync {
    fn fetch_prices<'a>(
        &'a self,
        symbols: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, Decimal>>>;
}

/// Fixed price map, used for manual runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceSource {
    prices: HashMap<String, Decimal>,
}

impl StaticPriceSource {
    pub fn new(prices: HashMap<String, Decimal>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(symbol, price)| (symbol.to_uppercase(), price))
            .collect();
        Self { prices }
    }

    /// Parse `SYMBOL=PRICE` pairs.
    pub fn from_pairs(pairs: &[String]) -> Result<Self> {
        let mut prices = HashMap::new();
        for pair in pairs {
            let (symbol, price) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Expected SYMBOL=PRICE, got '{}'", pair))?;
            let price: Decimal = price
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid price for {}: {}", symbol, e))?;
            prices.insert(symbol.trim().to_string(), price);
        }
        Ok(Self::new(prices))
    }
}

impl PriceSource for StaticPriceSource {
    fn fetch_prices<'a>(
        &'a self,
        symbols: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, Decimal>>> {
        let found: HashMap<String, Decimal> = symbols
            .iter()
            .filter_map(|s| self.prices.get(s).map(|p| (s.clone(), *p)))
            .collect();
        Box::pin(future::ready(Ok(found)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_source_omits_unknown_symbols() {
        let source =
            StaticPriceSource::from_pairs(&["eurusd=1.1050".to_string(), "USDJPY = 151.20".to_string()])
                .unwrap();

        let prices = source
            .fetch_prices(&["EURUSD".to_string(), "GBPUSD".to_string(), "USDJPY".to_string()])
            .await
            .unwrap();

        assert_eq!(prices.len(), 2);
        assert_eq!(prices["EURUSD"], dec!(1.1050));
        assert_eq!(prices["USDJPY"], dec!(151.20));
        assert!(!prices.contains_key("GBPUSD"));
    }

    #[test]
    fn test_malformed_pairs_rejected() {
        assert!(StaticPriceSource::from_pairs(&["EURUSD".to_string()]).is_err());
        assert!(StaticPriceSource::from_pairs(&["EURUSD=abc".to_string()]).is_err());
    }
}
