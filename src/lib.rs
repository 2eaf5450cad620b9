//! Escrow Desk - peer-to-peer sell orders with escrowed settlement
//!
//! A seller escrows the full amount of a sell order up front; buyers open trades
//! against it and the seller's confirmation releases the trade amount from escrow
//! to the buyer. Value moves only through an external funds transfer service.
//!
//! # Modules
//!
//! - [`core_types`] - ULID-backed identifiers
//! - [`config`] - YAML configuration with environment overrides
//! - [`logging`] - tracing subscriber setup
//! - [`funding`] - Funds transfer gateway client
//! - [`escrow`] - Escrow ledger (deposit / release / reverse)
//! - [`persistence`] - Repository traits, in-memory and PostgreSQL stores
//! - [`reconcile`] - Records of value moved without matching local state
//! - [`trade`] - Order/trade workflow and the stale-trade reaper
//! - [`notify`] - Outbound notification queue and dispatcher
//! - [`shutdown`] - Cooperative shutdown signal

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod logging;
pub mod shutdown;

pub mod escrow;
pub mod funding;
pub mod notify;
pub mod persistence;
pub mod reconcile;
pub mod trade;

// Convenient re-exports at crate root
pub use core_types::{ChatId, DepositId, OrderId, ReleaseId, TradeId, UserId};
pub use escrow::{EscrowError, EscrowLedger};
pub use funding::{GatewayError, HttpTransferGateway, TransferGateway};
pub use notify::{NotificationQueue, notification_channel};
pub use persistence::{MemoryStore, PgStore, Repositories};
pub use shutdown::ShutdownSignal;
pub use trade::{TradeCoordinator, TradeError, TradeReaper, Transition};
