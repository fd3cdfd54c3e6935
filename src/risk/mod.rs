//! Position-size risk checks: lot-size baseline and spike detection.

mod config;
mod consistency;
mod error;

pub use config::LotSizeConfig;
pub use consistency::{ConsistencyOutcome, LotSizeGuard, LotSizeRequest};
pub use error::RiskError;
