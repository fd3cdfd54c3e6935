//! Risk error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid requested_lot_size: {0}")]
    InvalidLotSize(String),

    #[error("Account {account_id} not found for user {user_id}")]
    AccountNotFound { account_id: String, user_id: String },
}

pub type RiskResult<T> = Result<T, RiskError>;
