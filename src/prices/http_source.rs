//! HTTP price feed client.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use super::PriceSource;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from `GET /prices?symbols=...`.
#[derive(Debug, Clone, Deserialize)]
struct PricesResponse {
    #[serde(default)]
    prices: HashMap<String, Option<Decimal>>,
}

/// Client for a live price endpoint.
pub struct HttpPriceSource {
    client: Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch current prices for the given symbols.
    pub async fn get_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/prices", self.base_url);
        let joined = symbols.join(",");

        debug!(url = %url, symbols = %joined, "Fetching live prices");

        let response = self
            .client
            .get(&url)
            .query(&[("symbols", joined.as_str())])
            .send()
            .await
            .context("Failed to fetch prices")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Price request failed: {} - {}", status, body);
        }

        let parsed: PricesResponse = response
            .json()
            .await
            .context("Failed to parse price response")?;

        Ok(parsed
            .prices
            .into_iter()
            .filter_map(|(symbol, price)| {
                price
                    .filter(|p| *p > Decimal::ZERO)
                    .map(|p| (symbol.to_uppercase(), p))
            })
            .collect())
    }
}

impl PriceSource for HttpPriceSource {
    fn fetch_prices<'a>(
        &'a self,
        symbols: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, Decimal>>> {
        Box::pin(self.get_prices(symbols))
    }
}
