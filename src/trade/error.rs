//! Workflow error types
//!
//! Every rejection carries the specific reason; idempotent repeats are not errors
//! (see [`super::state::Transition`]).

use rust_decimal::Decimal;
use thiserror::Error;

use crate::escrow::EscrowError;
use crate::funding::GatewayError;
use crate::persistence::StoreError;

#[derive(Error, Debug, Clone)]
pub enum TradeError {
    // === Caller errors (no side effects) ===
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Not allowed: {0}")]
    Unauthorized(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    // === Escrow ===
    #[error("Insufficient escrow: requested {requested}, available {available}")]
    InsufficientEscrow {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Escrow already released")]
    AlreadyReleased,

    #[error("Transfer failed: {0}")]
    TransferFailed(GatewayError),

    // === System ===
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl TradeError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::Validation(_) => "VALIDATION_ERROR",
            TradeError::NotFound(_) => "NOT_FOUND",
            TradeError::Unauthorized(_) => "UNAUTHORIZED",
            TradeError::InvalidState(_) => "INVALID_STATE",
            TradeError::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            TradeError::InsufficientEscrow { .. } => "INSUFFICIENT_ESCROW",
            TradeError::AlreadyReleased => "ALREADY_RELEASED",
            TradeError::TransferFailed(_) => "TRANSFER_FAILED",
            TradeError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TradeError::Validation(_) => 400,
            TradeError::Unauthorized(_) => 403,
            TradeError::NotFound(_) => 404,
            TradeError::InvalidState(_) | TradeError::AlreadyReleased => 409,
            TradeError::InsufficientFunds(_) | TradeError::InsufficientEscrow { .. } => 422,
            TradeError::TransferFailed(_) => 502,
            TradeError::Persistence(_) => 500,
        }
    }
}

impl From<StoreError> for TradeError {
    fn from(e: StoreError) -> Self {
        TradeError::Persistence(e.to_string())
    }
}

impl From<EscrowError> for TradeError {
    fn from(e: EscrowError) -> Self {
        match e {
            EscrowError::NotFound { order_id, user_id } => TradeError::NotFound(format!(
                "Escrow deposit for order {} by user {}",
                order_id, user_id
            )),
            EscrowError::AlreadyReleased => TradeError::AlreadyReleased,
            EscrowError::InsufficientEscrow {
                requested,
                available,
            } => TradeError::InsufficientEscrow {
                requested,
                available,
            },
            EscrowError::InvalidAmount(amount) => {
                TradeError::Validation(format!("escrow amount must be positive, got {}", amount))
            }
            EscrowError::TransferFailed(e) => TradeError::TransferFailed(e),
            EscrowError::Persistence(msg) | EscrowError::NotRecorded(msg) => {
                TradeError::Persistence(msg)
            }
        }
    }
}
