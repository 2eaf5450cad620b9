//! In-process store
//!
//! One mutex over every table, so multi-record writes (disbursement + release entry)
//! are atomic the same way a database transaction makes them. Suitable for tests and
//! single-instance deployments; nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::error::{StoreError, StoreResult};
use super::repository::{
    ChatRepository, EscrowRepository, OrderRepository, ReconcileRepository, TradeRepository,
    UserStatsRepository,
};
use crate::core_types::{DepositId, OrderId, TradeId, UserId};
use crate::escrow::{EscrowDeposit, EscrowRelease};
use crate::reconcile::ReconcileEvent;
use crate::trade::{
    BuyTrade, OrderQuery, OrderStatus, SellOrder, TradeChange, TradeChat, TradeQuery, TradeStatus,
};

#[derive(Default)]
struct Tables {
    /// Insertion order; listings walk it backwards for newest first
    orders: Vec<SellOrder>,
    order_index: HashMap<OrderId, usize>,
    trades: Vec<BuyTrade>,
    trade_index: HashMap<TradeId, usize>,
    deposits: HashMap<(OrderId, UserId), EscrowDeposit>,
    releases: Vec<EscrowRelease>,
    chats: Vec<TradeChat>,
    completed_trades: HashMap<UserId, u64>,
    reconcile: Vec<ReconcileEvent>,
}

impl Tables {
    fn order_mut(&mut self, id: OrderId) -> Option<&mut SellOrder> {
        let idx = *self.order_index.get(&id)?;
        self.orders.get_mut(idx)
    }

    fn trade_mut(&mut self, id: TradeId) -> Option<&mut BuyTrade> {
        let idx = *self.trade_index.get(&id)?;
        self.trades.get_mut(idx)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert_order(&self, order: &SellOrder) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.order_index.contains_key(&order.id) {
            return Err(StoreError::Database(format!("order {} exists", order.id)));
        }
        let idx = t.orders.len();
        t.orders.push(order.clone());
        t.order_index.insert(order.id, idx);
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> StoreResult<Option<SellOrder>> {
        let t = self.tables()?;
        Ok(t.order_index.get(&id).map(|&idx| t.orders[idx].clone()))
    }

    async fn find_orders(&self, query: &OrderQuery) -> StoreResult<Vec<SellOrder>> {
        let t = self.tables()?;
        Ok(t.orders
            .iter()
            .rev()
            .filter(|o| query.matches(o))
            .cloned()
            .collect())
    }

    async fn update_order_status_if(
        &self,
        id: OrderId,
        expected: OrderStatus,
        new: OrderStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut t = self.tables()?;
        match t.order_mut(id) {
            Some(order) if order.status == expected => {
                order.status = new;
                order.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_sale(
        &self,
        id: OrderId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<SellOrder>> {
        let mut t = self.tables()?;
        Ok(t.order_mut(id).map(|order| {
            order.apply_sale(amount, at);
            order.clone()
        }))
    }
}

#[async_trait]
impl TradeRepository for MemoryStore {
    async fn insert_trade(&self, trade: &BuyTrade) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.trade_index.contains_key(&trade.id) {
            return Err(StoreError::Database(format!("trade {} exists", trade.id)));
        }
        let open_exists = t.trades.iter().any(|existing| {
            existing.order_id == trade.order_id
                && existing.buyer_id == trade.buyer_id
                && existing.status.is_open()
        });
        if trade.status.is_open() && open_exists {
            return Err(StoreError::DuplicateOpenTrade);
        }
        let idx = t.trades.len();
        t.trades.push(trade.clone());
        t.trade_index.insert(trade.id, idx);
        Ok(())
    }

    async fn get_trade(&self, id: TradeId) -> StoreResult<Option<BuyTrade>> {
        let t = self.tables()?;
        Ok(t.trade_index.get(&id).map(|&idx| t.trades[idx].clone()))
    }

    async fn find_trades(&self, query: &TradeQuery) -> StoreResult<Vec<BuyTrade>> {
        let t = self.tables()?;
        Ok(t.trades
            .iter()
            .rev()
            .filter(|tr| query.matches(tr))
            .cloned()
            .collect())
    }

    async fn transition_trade(
        &self,
        id: TradeId,
        expected: TradeStatus,
        change: &TradeChange,
    ) -> StoreResult<bool> {
        let mut t = self.tables()?;
        match t.trade_mut(id) {
            Some(trade) if trade.status == expected => {
                trade.apply(change);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_mark_paid_if_open(&self, id: TradeId, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut t = self.tables()?;
        match t.trade_mut(id) {
            Some(trade) if !trade.mark_paid && !trade.status.is_terminal() => {
                trade.mark_paid = true;
                trade.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale(
        &self,
        status: TradeStatus,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<BuyTrade>> {
        let t = self.tables()?;
        let mut stale: Vec<BuyTrade> = t
            .trades
            .iter()
            .filter(|tr| tr.status == status && tr.lock_time <= cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|tr| tr.lock_time);
        Ok(stale)
    }
}

#[async_trait]
impl EscrowRepository for MemoryStore {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> StoreResult<()> {
        let mut t = self.tables()?;
        let key = (deposit.order_id, deposit.user_id);
        if t.deposits.contains_key(&key) {
            return Err(StoreError::DuplicateDeposit);
        }
        t.deposits.insert(key, deposit.clone());
        Ok(())
    }

    async fn find_deposit(
        &self,
        order_id: OrderId,
        user_id: UserId,
    ) -> StoreResult<Option<EscrowDeposit>> {
        let t = self.tables()?;
        Ok(t.deposits.get(&(order_id, user_id)).cloned())
    }

    async fn apply_disbursement(
        &self,
        deposit: &EscrowDeposit,
        expected_released_amount: Decimal,
        release: &EscrowRelease,
    ) -> StoreResult<bool> {
        let mut t = self.tables()?;
        let key = (deposit.order_id, deposit.user_id);
        match t.deposits.get_mut(&key) {
            Some(stored)
                if stored.id == deposit.id
                    && !stored.released
                    && stored.released_amount == expected_released_amount =>
            {
                *stored = deposit.clone();
            }
            _ => return Ok(false),
        }
        t.releases.push(release.clone());
        Ok(true)
    }

    async fn releases_for(&self, deposit_id: DepositId) -> StoreResult<Vec<EscrowRelease>> {
        let t = self.tables()?;
        Ok(t.releases
            .iter()
            .filter(|r| r.parent_id == deposit_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn insert_chat(&self, chat: &TradeChat) -> StoreResult<()> {
        self.tables()?.chats.push(chat.clone());
        Ok(())
    }

    async fn chats_for_trade(&self, trade_id: TradeId) -> StoreResult<Vec<TradeChat>> {
        let t = self.tables()?;
        Ok(t.chats
            .iter()
            .rev()
            .filter(|c| c.trade_id == trade_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserStatsRepository for MemoryStore {
    async fn increment_completed_trades(&self, user_id: UserId) -> StoreResult<u64> {
        let mut t = self.tables()?;
        let count = t.completed_trades.entry(user_id).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn completed_trades(&self, user_id: UserId) -> StoreResult<u64> {
        let t = self.tables()?;
        Ok(t.completed_trades.get(&user_id).copied().unwrap_or(0))
    }
}

#[async_trait]
impl ReconcileRepository for MemoryStore {
    async fn insert_reconcile(&self, event: &ReconcileEvent) -> StoreResult<()> {
        self.tables()?.reconcile.push(event.clone());
        Ok(())
    }

    async fn list_reconcile(&self) -> StoreResult<Vec<ReconcileEvent>> {
        Ok(self.tables()?.reconcile.clone())
    }
}
