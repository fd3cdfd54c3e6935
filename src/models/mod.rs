//! Data models for accounts, signals, allocations, and consistency alerts.

mod account;
mod alert;
mod allocation;
mod signal;

pub use account::Account;
pub use alert::{AlertSeverity, ConsistencyAlert, LOT_SIZE_SPIKE};
pub use allocation::{AllocationStatus, AllocationWithSignal, TradeAllocation};
pub use signal::{Direction, Signal};
