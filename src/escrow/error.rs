use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::{OrderId, UserId};
use crate::funding::GatewayError;
use crate::persistence::StoreError;

#[derive(Error, Debug, Clone)]
pub enum EscrowError {
    #[error("No escrow deposit for order {order_id} by user {user_id}")]
    NotFound { order_id: OrderId, user_id: UserId },

    #[error("Escrow deposit already released")]
    AlreadyReleased,

    #[error("Insufficient escrow: requested {requested}, available {available}")]
    InsufficientEscrow {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Escrow amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("Transfer failed: {0}")]
    TransferFailed(#[from] GatewayError),

    /// Store failed before any value moved
    #[error("Escrow persistence error: {0}")]
    Persistence(String),

    /// Value moved but the escrow records do not show it; a reconcile event was filed
    #[error("Transfer not recorded: {0}")]
    NotRecorded(String),
}

impl From<StoreError> for EscrowError {
    fn from(e: StoreError) -> Self {
        EscrowError::Persistence(e.to_string())
    }
}
