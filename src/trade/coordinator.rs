//! Trade Coordinator
//!
//! Order and trade lifecycle. Every operation follows the same shape:
//!
//! ```text
//! validate against stored state -> escrow call (if any) -> conditional write -> notify
//! ```
//!
//! Rejections happen before anything moves. Status changes are compare-and-swap
//! writes on the expected current status, so a concurrent reaper cycle or a second
//! request for the same trade loses cleanly instead of overwriting.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::TradeError;
use super::state::{CancelReason, OrderStatus, Transition, TradeStatus};
use super::types::{
    BuyTrade, CreateBuyTradeRequest, CreateSellOrderRequest, OrderCancellation, OrderQuery,
    SellOrder, TradeChange, TradeChat, TradeQuery,
};
use crate::config::TradeRules;
use crate::core_types::{OrderId, TradeId, UserId};
use crate::escrow::{EscrowError, EscrowLedger};
use crate::notify::{Notification, NotificationQueue};
use crate::persistence::Repositories;
use crate::reconcile::{self, ReconcileEvent, ReconcileKind};

pub struct TradeCoordinator {
    repos: Repositories,
    ledger: Arc<EscrowLedger>,
    notifications: NotificationQueue,
    rules: TradeRules,
}

impl TradeCoordinator {
    pub fn new(
        repos: Repositories,
        ledger: Arc<EscrowLedger>,
        notifications: NotificationQueue,
        rules: TradeRules,
    ) -> Self {
        Self {
            repos,
            ledger,
            notifications,
            rules,
        }
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Escrow the full amount from the seller's wallet, then list the order.
    ///
    /// Nothing is stored if the deposit fails.
    pub async fn create_sell_order(
        &self,
        creator: UserId,
        req: CreateSellOrderRequest,
    ) -> Result<SellOrder, TradeError> {
        req.validate().map_err(TradeError::Validation)?;

        let order = SellOrder::new(creator, &req, Utc::now());
        let deposit = self
            .ledger
            .deposit(
                order.id,
                creator,
                order.amount,
                &req.wallet_id,
                &req.wallet_secret,
            )
            .await?;

        if let Err(e) = self.repos.orders.insert_order(&order).await {
            let event = ReconcileEvent::new(
                ReconcileKind::OrderNotUpdated,
                format!("escrow deposit taken but the order was not stored: {}", e),
            )
            .order(order.id)
            .deposit(deposit.id)
            .amount(order.amount);
            reconcile::report(self.repos.reconcile.as_ref(), event).await;
            return Err(e.into());
        }

        info!(
            order_id = %order.id,
            user_id = %creator,
            amount = %order.amount,
            currency = %order.currency,
            "Sell order created"
        );
        self.notifications.push(Notification::order_created(&order));
        Ok(order)
    }

    /// Cancel an open order and refund what is left in escrow.
    ///
    /// A failed refund does not undo the cancellation; it is reported as
    /// [`OrderCancellation::RefundPending`] and left for reconciliation.
    pub async fn cancel_order(
        &self,
        actor: UserId,
        order_id: OrderId,
    ) -> Result<OrderCancellation, TradeError> {
        let order = self.load_order(order_id).await?;
        if actor != order.created_by {
            return Err(TradeError::Unauthorized(
                "only the order creator can cancel it".into(),
            ));
        }
        match order.status {
            OrderStatus::Cancelled => return Ok(OrderCancellation::AlreadyCancelled),
            OrderStatus::Completed => {
                return Err(TradeError::InvalidState("order is completed".into()));
            }
            OrderStatus::Pending => {}
        }

        let swapped = self
            .repos
            .orders
            .update_order_status_if(
                order_id,
                OrderStatus::Pending,
                OrderStatus::Cancelled,
                Utc::now(),
            )
            .await?;
        if !swapped {
            let current = self.load_order(order_id).await?;
            return match current.status {
                OrderStatus::Cancelled => Ok(OrderCancellation::AlreadyCancelled),
                status => Err(TradeError::InvalidState(format!("order is {}", status))),
            };
        }
        info!(order_id = %order_id, "Order cancelled");

        match self
            .ledger
            .reverse(order_id, order.created_by, &order.wallet_id)
            .await
        {
            Ok(done) => Ok(OrderCancellation::Refunded {
                amount: done.release.amount,
            }),
            Err(EscrowError::AlreadyReleased) => {
                debug!(order_id = %order_id, "Nothing left in escrow to refund");
                Ok(OrderCancellation::NothingToRefund)
            }
            // Refund went through; the ledger already filed the reconcile event
            Err(EscrowError::NotRecorded(reason)) => {
                Ok(OrderCancellation::RefundPending { reason })
            }
            Err(e) => {
                error!(
                    order_id = %order_id,
                    wallet = %order.wallet_id,
                    error = %e,
                    "Refund failed for cancelled order"
                );
                let mut event = ReconcileEvent::new(
                    ReconcileKind::ReversalFailed,
                    format!("order cancelled but refund to {} failed: {}", order.wallet_id, e),
                )
                .order(order_id);
                // Best effort: the lookup fails too when the store is what broke
                if let Ok(Some(deposit)) =
                    self.ledger.find_deposit(order_id, order.created_by).await
                {
                    event = event.deposit(deposit.id).amount(deposit.remainder());
                }
                reconcile::report(self.repos.reconcile.as_ref(), event).await;
                Ok(OrderCancellation::RefundPending {
                    reason: e.to_string(),
                })
            }
        }
    }

    // ========================================================================
    // Trades
    // ========================================================================

    pub async fn create_buy_trade(
        &self,
        buyer: UserId,
        req: CreateBuyTradeRequest,
    ) -> Result<BuyTrade, TradeError> {
        req.validate().map_err(TradeError::Validation)?;
        let order = self.load_order(req.order_id).await?;

        let existing = self
            .repos
            .trades
            .find_trades(&TradeQuery {
                order_id: Some(order.id),
                buyer_id: Some(buyer),
                status: None,
            })
            .await?;
        if existing.iter().any(|t| t.status.is_open()) {
            return Err(TradeError::InvalidState(
                "you already have an open trade on this order".into(),
            ));
        }

        if order.status != OrderStatus::Pending {
            return Err(TradeError::InvalidState(format!(
                "order is {}",
                order.status
            )));
        }
        if buyer == order.created_by {
            return Err(TradeError::Unauthorized(
                "cannot open a trade on your own order".into(),
            ));
        }
        check_trade_amount(&order, req.amount, self.rules.enforce_sold_cap)?;

        let trade = BuyTrade::open(&order, buyer, &req, Utc::now());
        match self.repos.trades.insert_trade(&trade).await {
            Ok(()) => {}
            Err(crate::persistence::StoreError::DuplicateOpenTrade) => {
                return Err(TradeError::InvalidState(
                    "you already have an open trade on this order".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            trade_id = %trade.id,
            order_id = %order.id,
            buyer_id = %buyer,
            amount = %trade.amount,
            "Buy trade opened"
        );
        self.notifications.push(Notification::trade_opened(&trade));
        Ok(trade)
    }

    /// Seller confirms fiat was received: release the trade amount from escrow to the
    /// buyer and book the sale.
    pub async fn confirm_trade(
        &self,
        actor: UserId,
        trade_id: TradeId,
    ) -> Result<Transition, TradeError> {
        let trade = self.load_trade(trade_id).await?;
        let order = self.load_order(trade.order_id).await?;
        if actor != order.created_by {
            return Err(TradeError::Unauthorized(
                "only the order creator can confirm a trade".into(),
            ));
        }
        match trade.status {
            TradeStatus::Processed => return Ok(Transition::AlreadyApplied),
            TradeStatus::InProgress => {}
            status => {
                return Err(TradeError::InvalidState(format!("trade is {}", status)));
            }
        }

        // Claim: keeps the reaper and a buyer cancel off the trade while escrow moves
        let claimed = self
            .repos
            .trades
            .transition_trade(trade_id, TradeStatus::InProgress, &TradeChange::claim(Utc::now()))
            .await?;
        if !claimed {
            let current = self.load_trade(trade_id).await?;
            debug!(trade_id = %trade_id, status = %current.status, "Lost confirm claim");
            return match current.status {
                TradeStatus::Processed => Ok(Transition::AlreadyApplied),
                status => Err(TradeError::InvalidState(format!("trade is {}", status))),
            };
        }

        let released = self
            .ledger
            .release(
                trade.id,
                order.id,
                order.created_by,
                trade.amount,
                &trade.buyer_wallet,
                trade.buyer_id,
            )
            .await;
        if let Err(e) = released {
            // The buyer was paid without a record: keep the claim
            if !matches!(e, EscrowError::NotRecorded(_)) {
                self.unclaim(trade_id).await;
            }
            return Err(e.into());
        }

        let now = Utc::now();
        let mut failures = Vec::new();

        match self
            .repos
            .trades
            .transition_trade(trade_id, TradeStatus::Pending, &TradeChange::processed(now))
            .await
        {
            Ok(true) => {}
            Ok(false) => failures.push((
                ReconcileKind::TradeNotUpdated,
                "trade left the confirmation claim while escrow was released".to_string(),
            )),
            Err(e) => failures.push((ReconcileKind::TradeNotUpdated, e.to_string())),
        }

        match self
            .repos
            .orders
            .record_sale(order.id, trade.amount, now)
            .await
        {
            Ok(Some(updated)) => debug!(
                order_id = %order.id,
                amount_sold = %updated.amount_sold,
                amount_left = %updated.amount_left,
                "Sale recorded"
            ),
            Ok(None) => failures.push((
                ReconcileKind::OrderNotUpdated,
                "order disappeared before the sale was recorded".to_string(),
            )),
            Err(e) => failures.push((ReconcileKind::OrderNotUpdated, e.to_string())),
        }

        if let Err(e) = self
            .repos
            .stats
            .increment_completed_trades(order.created_by)
            .await
        {
            failures.push((
                ReconcileKind::UserNotUpdated,
                format!("seller completed-trade counter not incremented: {}", e),
            ));
        }

        self.notifications.push(Notification::trade_confirmed(&trade));

        if failures.is_empty() {
            info!(
                trade_id = %trade_id,
                order_id = %order.id,
                amount = %trade.amount,
                "Trade confirmed"
            );
            return Ok(Transition::Applied);
        }

        let mut reasons = Vec::with_capacity(failures.len());
        for (kind, reason) in failures {
            let event = ReconcileEvent::new(
                kind,
                format!("escrow released to {} but {}", trade.buyer_wallet, reason),
            )
            .order(order.id)
            .trade(trade_id)
            .amount(trade.amount);
            reconcile::report(self.repos.reconcile.as_ref(), event).await;
            reasons.push(reason);
        }
        Err(TradeError::Persistence(reasons.join("; ")))
    }

    /// Buyer reports the fiat payment as sent. The trade status does not change.
    pub async fn mark_trade_paid(
        &self,
        actor: UserId,
        trade_id: TradeId,
    ) -> Result<Transition, TradeError> {
        let trade = self.load_trade(trade_id).await?;
        if actor != trade.buyer_id {
            return Err(TradeError::Unauthorized(
                "only the buyer can mark a trade as paid".into(),
            ));
        }
        if trade.mark_paid {
            return Ok(Transition::AlreadyApplied);
        }
        if trade.status.is_terminal() {
            return Err(TradeError::InvalidState(format!("trade is {}", trade.status)));
        }

        if !self
            .repos
            .trades
            .set_mark_paid_if_open(trade_id, Utc::now())
            .await?
        {
            let current = self.load_trade(trade_id).await?;
            if current.mark_paid {
                return Ok(Transition::AlreadyApplied);
            }
            return Err(TradeError::InvalidState(format!(
                "trade is {}",
                current.status
            )));
        }

        info!(trade_id = %trade_id, "Trade marked paid");
        self.notifications
            .push(Notification::trade_marked_paid(&trade));
        Ok(Transition::Applied)
    }

    /// Buyer withdraws. Escrow is untouched: the seller's deposit stays with the order.
    pub async fn cancel_trade(
        &self,
        actor: UserId,
        trade_id: TradeId,
    ) -> Result<Transition, TradeError> {
        let trade = self.load_trade(trade_id).await?;
        if actor != trade.buyer_id {
            return Err(TradeError::Unauthorized(
                "only the buyer can cancel a trade".into(),
            ));
        }
        match trade.status {
            TradeStatus::Cancelled => return Ok(Transition::AlreadyApplied),
            TradeStatus::InProgress => {}
            status => {
                return Err(TradeError::InvalidState(format!("trade is {}", status)));
            }
        }

        let change = TradeChange::cancelled(CancelReason::Manual, Utc::now());
        if !self
            .repos
            .trades
            .transition_trade(trade_id, TradeStatus::InProgress, &change)
            .await?
        {
            let current = self.load_trade(trade_id).await?;
            return match current.status {
                TradeStatus::Cancelled => Ok(Transition::AlreadyApplied),
                status => Err(TradeError::InvalidState(format!("trade is {}", status))),
            };
        }

        info!(trade_id = %trade_id, order_id = %trade.order_id, "Trade cancelled by buyer");
        Ok(Transition::Applied)
    }

    /// Append a chat message and notify the other side
    pub async fn post_message(
        &self,
        actor: UserId,
        trade_id: TradeId,
        message: &str,
    ) -> Result<TradeChat, TradeError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(TradeError::Validation("message is empty".into()));
        }
        let trade = self.load_trade(trade_id).await?;
        if actor != trade.buyer_id && actor != trade.seller_id {
            return Err(TradeError::Unauthorized(
                "only the buyer and seller can post on a trade".into(),
            ));
        }

        let chat = TradeChat::new(trade_id, actor, message.to_string(), Utc::now());
        self.repos.chats.insert_chat(&chat).await?;

        self.notifications
            .push(Notification::trade_message(&trade, actor, message));
        Ok(chat)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_order(&self, order_id: OrderId) -> Result<SellOrder, TradeError> {
        self.load_order(order_id).await
    }

    pub async fn get_trade(&self, trade_id: TradeId) -> Result<BuyTrade, TradeError> {
        self.load_trade(trade_id).await
    }

    /// Open orders, newest first. `currency` of `"any"` or `None` lists every currency.
    pub async fn pending_orders(
        &self,
        currency: Option<&str>,
        min_amount: Option<Decimal>,
    ) -> Result<Vec<SellOrder>, TradeError> {
        let query = OrderQuery::pending(currency, min_amount);
        Ok(self.repos.orders.find_orders(&query).await?)
    }

    pub async fn user_orders(
        &self,
        user_id: UserId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<SellOrder>, TradeError> {
        let query = OrderQuery::by_creator(user_id, status);
        Ok(self.repos.orders.find_orders(&query).await?)
    }

    pub async fn buyer_trades(
        &self,
        user_id: UserId,
        status: Option<TradeStatus>,
    ) -> Result<Vec<BuyTrade>, TradeError> {
        let query = TradeQuery::by_buyer(user_id, status);
        Ok(self.repos.trades.find_trades(&query).await?)
    }

    pub async fn order_trades(&self, order_id: OrderId) -> Result<Vec<BuyTrade>, TradeError> {
        Ok(self
            .repos
            .trades
            .find_trades(&TradeQuery::by_order(order_id))
            .await?)
    }

    /// Newest first
    pub async fn trade_messages(&self, trade_id: TradeId) -> Result<Vec<TradeChat>, TradeError> {
        Ok(self.repos.chats.chats_for_trade(trade_id).await?)
    }

    pub async fn completed_trades(&self, user_id: UserId) -> Result<u64, TradeError> {
        Ok(self.repos.stats.completed_trades(user_id).await?)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load_order(&self, order_id: OrderId) -> Result<SellOrder, TradeError> {
        self.repos
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| TradeError::NotFound("Order".into()))
    }

    async fn load_trade(&self, trade_id: TradeId) -> Result<BuyTrade, TradeError> {
        self.repos
            .trades
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| TradeError::NotFound("Trade".into()))
    }

    /// Hand a claimed trade back after a release that moved nothing
    async fn unclaim(&self, trade_id: TradeId) {
        match self
            .repos
            .trades
            .transition_trade(trade_id, TradeStatus::Pending, &TradeChange::unclaim(Utc::now()))
            .await
        {
            Ok(true) => debug!(trade_id = %trade_id, "Confirm claim released"),
            Ok(false) => warn!(trade_id = %trade_id, "Confirm claim already gone"),
            Err(e) => error!(
                trade_id = %trade_id,
                error = %e,
                "Could not release confirm claim; trade stays pending"
            ),
        }
    }
}

/// Amount rules for a new trade against `order`
fn check_trade_amount(
    order: &SellOrder,
    amount: Decimal,
    enforce_sold_cap: bool,
) -> Result<(), TradeError> {
    // Rationale unknown; it blocks e.g. a 60 trade on a 100 order with 40 sold
    if enforce_sold_cap && order.amount_sold > Decimal::ZERO && amount > order.amount_sold {
        return Err(TradeError::InsufficientFunds(format!(
            "requested {} exceeds {} already sold on this order",
            amount, order.amount_sold
        )));
    }
    if amount > order.amount {
        return Err(TradeError::InsufficientFunds(format!(
            "requested {} exceeds order amount {}",
            amount, order.amount
        )));
    }
    if order.amount_left > Decimal::ZERO && amount > order.amount_left {
        return Err(TradeError::InsufficientFunds(format!(
            "requested {} exceeds {} left on this order",
            amount, order.amount_left
        )));
    }
    Ok(())
}
