use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// Second deposit for the same (order, depositor)
    #[error("Escrow deposit already exists for this order and depositor")]
    DuplicateDeposit,

    /// Buyer already holds an open trade on the order
    #[error("Buyer already has an open trade on this order")]
    DuplicateOpenTrade,

    /// Stored row could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
