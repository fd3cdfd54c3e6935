//! Unrealized P&L: pip math, per-allocation figures, and the sync pass.

mod calculator;
mod pip;
mod sync;

pub use pip::FlatPipValue;
pub use sync::{PnlSynchronizer, SyncReport, SyncScope};
