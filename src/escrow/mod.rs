//! Escrow ledger: deposits into, releases out of and reversals from the escrow wallet.

pub mod error;
pub mod ledger;
pub mod types;

pub use error::EscrowError;
pub use ledger::EscrowLedger;
pub use types::{Disbursement, EscrowDeposit, EscrowRelease};
