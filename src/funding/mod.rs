//! Funds transfer gateway client
//!
//! The only way value moves: one synchronous call per transfer to the external
//! wallet service. Everything else in the crate records what this module reports.

pub mod gateway;
pub mod error;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use gateway::{HttpTransferGateway, TransferGateway};
pub use error::GatewayError;
pub use types::{TransferPayload, TransferReceipt, WalletTransfer, format_amount};
