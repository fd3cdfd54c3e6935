//! Effective runtime configuration.

use std::fmt;
use std::net::SocketAddr;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::pnl::FlatPipValue;
use crate::risk::LotSizeConfig;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:./traderedge.db?mode=rwc";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Everything the service needs, after env and CLI overrides are applied.
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub database_url: String,

    /// Live price endpoint; `None` means prices must be given by hand
    pub price_api_url: Option<String>,

    pub bind_addr: SocketAddr,

    pub lot_size: LotSizeConfig,

    pub pip_value: FlatPipValue,
}

/// Optional overrides of the lot-size policy.
#[derive(Debug, Clone, Default)]
pub struct LotSizeOverrides {
    pub history_window: Option<u32>,
    pub min_history: Option<u32>,
    pub spike_multiplier: Option<Decimal>,
}

impl LotSizeOverrides {
    /// Apply on top of the defaults, rejecting policies that cannot work.
    pub fn resolve(&self) -> Result<LotSizeConfig> {
        let defaults = LotSizeConfig::default();
        let config = LotSizeConfig {
            history_window: self.history_window.unwrap_or(defaults.history_window),
            min_history: self.min_history.unwrap_or(defaults.min_history),
            spike_multiplier: self.spike_multiplier.unwrap_or(defaults.spike_multiplier),
        };

        if config.history_window == 0 {
            bail!("Lot size history window must be at least 1");
        }
        if config.min_history == 0 || config.min_history > config.history_window {
            bail!(
                "Lot size minimum history must be between 1 and the window size ({})",
                config.history_window
            );
        }
        if config.spike_multiplier <= Decimal::ONE {
            bail!("Spike multiplier must be greater than 1, got {}", config.spike_multiplier);
        }

        Ok(config)
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Service Configuration ===\n")?;
        writeln!(f, "  Database:             {}", self.database_url)?;
        writeln!(
            f,
            "  Price API:            {}",
            self.price_api_url.as_deref().unwrap_or("(not set)")
        )?;
        writeln!(f, "  Bind Address:         {}", self.bind_addr)?;

        writeln!(f, "\nLot Size Consistency:")?;
        writeln!(f, "  History Window:       {} allocations", self.lot_size.history_window)?;
        writeln!(f, "  Min History:          {} allocations", self.lot_size.min_history)?;
        writeln!(
            f,
            "  Spike Threshold:      {}% of average",
            self.lot_size.threshold_pct().normalize()
        )?;

        writeln!(f, "\nP&L:")?;
        write!(
            f,
            "  Pip Value:            ${} per pip per lot",
            self.pip_value.usd_per_pip_per_lot
        )
    }
}
