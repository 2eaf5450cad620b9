//! Repository traits, one per record family
//!
//! Listings come back newest first unless noted. Every status change is a
//! conditional write returning `false` when the stored state no longer matches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use super::error::StoreResult;
use crate::core_types::{DepositId, OrderId, TradeId, UserId};
use crate::escrow::{EscrowDeposit, EscrowRelease};
use crate::reconcile::ReconcileEvent;
use crate::trade::{
    BuyTrade, OrderQuery, OrderStatus, SellOrder, TradeChange, TradeChat, TradeQuery, TradeStatus,
};

// ============================================================================
// Orders
// ============================================================================

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert_order(&self, order: &SellOrder) -> StoreResult<()>;

    async fn get_order(&self, id: OrderId) -> StoreResult<Option<SellOrder>>;

    async fn find_orders(&self, query: &OrderQuery) -> StoreResult<Vec<SellOrder>>;

    /// CAS on order status
    async fn update_order_status_if(
        &self,
        id: OrderId,
        expected: OrderStatus,
        new: OrderStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Atomically add `amount` to `amount_sold` and recompute `amount_left`.
    ///
    /// Returns the updated order, `None` if it does not exist.
    async fn record_sale(
        &self,
        id: OrderId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<SellOrder>>;
}

// ============================================================================
// Trades
// ============================================================================

#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Fails with `DuplicateOpenTrade` if the buyer already has an open trade on the order
    async fn insert_trade(&self, trade: &BuyTrade) -> StoreResult<()>;

    async fn get_trade(&self, id: TradeId) -> StoreResult<Option<BuyTrade>>;

    async fn find_trades(&self, query: &TradeQuery) -> StoreResult<Vec<BuyTrade>>;

    /// CAS on trade status; applies `change` only if the status is still `expected`
    async fn transition_trade(
        &self,
        id: TradeId,
        expected: TradeStatus,
        change: &TradeChange,
    ) -> StoreResult<bool>;

    /// Set `mark_paid` if it is unset and the trade is still open
    async fn set_mark_paid_if_open(&self, id: TradeId, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Trades in `status` with `lock_time <= cutoff`, oldest first
    async fn find_stale(
        &self,
        status: TradeStatus,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<BuyTrade>>;
}

// ============================================================================
// Escrow
// ============================================================================

#[async_trait]
pub trait EscrowRepository: Send + Sync {
    /// Fails with `DuplicateDeposit` for a second deposit on the same (order, depositor)
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> StoreResult<()>;

    async fn find_deposit(
        &self,
        order_id: OrderId,
        user_id: UserId,
    ) -> StoreResult<Option<EscrowDeposit>>;

    /// Write `deposit` and append `release` in one step, only if the stored deposit
    /// is unreleased with `released_amount == expected_released_amount`.
    async fn apply_disbursement(
        &self,
        deposit: &EscrowDeposit,
        expected_released_amount: Decimal,
        release: &EscrowRelease,
    ) -> StoreResult<bool>;

    /// Release entries of a deposit, oldest first
    async fn releases_for(&self, deposit_id: DepositId) -> StoreResult<Vec<EscrowRelease>>;
}

// ============================================================================
// Chats, counters, reconcile
// ============================================================================

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn insert_chat(&self, chat: &TradeChat) -> StoreResult<()>;

    async fn chats_for_trade(&self, trade_id: TradeId) -> StoreResult<Vec<TradeChat>>;
}

#[async_trait]
pub trait UserStatsRepository: Send + Sync {
    /// Returns the new count
    async fn increment_completed_trades(&self, user_id: UserId) -> StoreResult<u64>;

    async fn completed_trades(&self, user_id: UserId) -> StoreResult<u64>;
}

#[async_trait]
pub trait ReconcileRepository: Send + Sync {
    async fn insert_reconcile(&self, event: &ReconcileEvent) -> StoreResult<()>;

    /// Oldest first
    async fn list_reconcile(&self) -> StoreResult<Vec<ReconcileEvent>>;
}

/// Typed handles for every record family
#[derive(Clone)]
pub struct Repositories {
    pub orders: Arc<dyn OrderRepository>,
    pub trades: Arc<dyn TradeRepository>,
    pub escrow: Arc<dyn EscrowRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub stats: Arc<dyn UserStatsRepository>,
    pub reconcile: Arc<dyn ReconcileRepository>,
}

impl Repositories {
    /// All handles backed by one store
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: OrderRepository
            + TradeRepository
            + EscrowRepository
            + ChatRepository
            + UserStatsRepository
            + ReconcileRepository
            + 'static,
    {
        Self {
            orders: store.clone(),
            trades: store.clone(),
            escrow: store.clone(),
            chats: store.clone(),
            stats: store.clone(),
            reconcile: store,
        }
    }
}
