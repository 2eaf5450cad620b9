//! Order/Trade Workflow
//!
//! Sell orders backed by an escrow deposit, buy trades against them, and the
//! reaper that expires trades nobody acted on.
//!
//! # Trade lifecycle
//!
//! ```text
//! in-progress ──confirm──▶ pending ──release ok──▶ processed
//!      │                      └──release failed──▶ in-progress
//!      ├──buyer cancel──▶ cancelled (manual)
//!      └──reaper────────▶ cancelled (auto)
//! ```
//!
//! # Rules
//!
//! 1. **Escrow first**: an order is listed only after its full amount is in escrow
//! 2. **Conditional writes**: every status change names the status it expects
//! 3. **Reconcile, don't hide**: a write that fails after value moved leaves a
//!    reconcile event

pub mod coordinator;
pub mod error;
pub mod reaper;
pub mod state;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use coordinator::TradeCoordinator;
pub use error::TradeError;
pub use reaper::{ReapSummary, TradeReaper};
pub use state::{CancelReason, OrderStatus, TradeStatus, Transition};
pub use types::{
    ANY_CURRENCY, BuyTrade, CreateBuyTradeRequest, CreateSellOrderRequest, OrderCancellation,
    OrderQuery, SellOrder, TradeChange, TradeChat, TradeQuery,
};
