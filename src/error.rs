//! Error types for kindness-ledger

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Insufficient balance for {user_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        user_id: String,
        balance: i64,
        requested: i64,
    },

    #[error("Lock wait exceeded: {0}")]
    ConcurrencyTimeout(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Whether the caller may blindly retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyTimeout(_))
    }
}
