//! Order/trade records and request types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::{CancelReason, OrderStatus, TradeStatus};
use crate::core_types::{ChatId, OrderId, TradeId, UserId};

/// Currency filter value meaning "no filter"
pub const ANY_CURRENCY: &str = "any";

/// An offer to sell `amount` of the asset for fiat at `ex_rate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellOrder {
    pub id: OrderId,
    pub created_by: UserId,
    pub ex_rate: Decimal,
    pub amount: Decimal,
    pub amount_sold: Decimal,
    /// Always `amount - amount_sold`
    pub amount_left: Decimal,
    pub currency: String,
    pub phone_number: String,
    /// Settlement wallet; the escrow deposit came from here and refunds go back here
    pub wallet_id: String,
    pub payment_option: i32,
    pub payment_option_id: String,
    pub note: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SellOrder {
    pub fn new(created_by: UserId, req: &CreateSellOrderRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::new(),
            created_by,
            ex_rate: req.ex_rate,
            amount: req.amount,
            amount_sold: Decimal::ZERO,
            amount_left: req.amount,
            currency: req.currency.clone(),
            phone_number: req.phone_number.clone(),
            wallet_id: req.wallet_id.clone(),
            payment_option: req.payment_option,
            payment_option_id: req.payment_option_id.clone(),
            note: req.note.clone(),
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Book a confirmed trade against this order
    pub fn apply_sale(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.amount_sold += amount;
        self.amount_left = self.amount - self.amount_sold;
        self.updated_at = now;
    }
}

/// A buyer's claim on part of a sell order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyTrade {
    pub id: TradeId,
    /// Copied from the order's creator
    pub seller_id: UserId,
    pub buyer_id: UserId,
    pub order_id: OrderId,
    pub buyer_wallet: String,
    pub amount: Decimal,
    pub confirmed: bool,
    pub mark_paid: bool,
    /// When the buyer showed interest; the reaper measures staleness from here
    pub lock_time: DateTime<Utc>,
    pub status: TradeStatus,
    pub cancel_reason: Option<CancelReason>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuyTrade {
    pub fn open(
        order: &SellOrder,
        buyer_id: UserId,
        req: &CreateBuyTradeRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TradeId::new(),
            seller_id: order.created_by,
            buyer_id,
            order_id: order.id,
            buyer_wallet: req.wallet_id.clone(),
            amount: req.amount,
            confirmed: false,
            mark_paid: false,
            lock_time: now,
            status: TradeStatus::InProgress,
            cancel_reason: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change as the stores persist it
    pub fn apply(&mut self, change: &TradeChange) {
        self.status = change.status;
        if let Some(confirmed) = change.confirmed {
            self.confirmed = confirmed;
        }
        if change.processed_at.is_some() {
            self.processed_at = change.processed_at;
        }
        if change.cancel_reason.is_some() {
            self.cancel_reason = change.cancel_reason;
        }
        self.updated_at = change.at;
    }
}

/// Message between the two sides of a trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeChat {
    pub id: ChatId,
    pub trade_id: TradeId,
    pub user_id: UserId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TradeChat {
    pub fn new(trade_id: TradeId, user_id: UserId, message: String, now: DateTime<Utc>) -> Self {
        Self {
            id: ChatId::new(),
            trade_id,
            user_id,
            message,
            created_at: now,
        }
    }
}

/// Status change written by a conditional trade update
#[derive(Debug, Clone, PartialEq)]
pub struct TradeChange {
    pub status: TradeStatus,
    pub confirmed: Option<bool>,
    pub processed_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<CancelReason>,
    pub at: DateTime<Utc>,
}

impl TradeChange {
    fn to(status: TradeStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            confirmed: None,
            processed_at: None,
            cancel_reason: None,
            at,
        }
    }

    /// Confirmation in flight: `in-progress -> pending`
    pub fn claim(at: DateTime<Utc>) -> Self {
        Self::to(TradeStatus::Pending, at)
    }

    /// Release failed: `pending -> in-progress`
    pub fn unclaim(at: DateTime<Utc>) -> Self {
        Self::to(TradeStatus::InProgress, at)
    }

    pub fn processed(at: DateTime<Utc>) -> Self {
        Self {
            confirmed: Some(true),
            processed_at: Some(at),
            ..Self::to(TradeStatus::Processed, at)
        }
    }

    pub fn cancelled(reason: CancelReason, at: DateTime<Utc>) -> Self {
        Self {
            cancel_reason: Some(reason),
            ..Self::to(TradeStatus::Cancelled, at)
        }
    }
}

/// Sell order submission
#[derive(Clone, Default, Deserialize)]
pub struct CreateSellOrderRequest {
    pub ex_rate: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub phone_number: String,
    pub wallet_id: String,
    #[serde(default)]
    pub payment_option: i32,
    #[serde(default)]
    pub payment_option_id: String,
    /// Signing secret for `wallet_id`; used once for the deposit and never stored
    #[serde(rename = "wallet_private_key")]
    pub wallet_secret: String,
    #[serde(default)]
    pub note: String,
}

impl CreateSellOrderRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.phone_number.trim().is_empty() {
            return Err("phone number is required".to_string());
        }
        if self.amount <= Decimal::ZERO {
            return Err("amount must be greater than zero".to_string());
        }
        if self.ex_rate < Decimal::ZERO {
            return Err("exchange rate cannot be negative".to_string());
        }
        if self.currency.trim().is_empty() {
            return Err("currency is required".to_string());
        }
        if self.wallet_id.trim().is_empty() {
            return Err("wallet id is required".to_string());
        }
        if self.wallet_secret.is_empty() {
            return Err("wallet private key is required".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for CreateSellOrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateSellOrderRequest")
            .field("ex_rate", &self.ex_rate)
            .field("amount", &self.amount)
            .field("currency", &self.currency)
            .field("phone_number", &self.phone_number)
            .field("wallet_id", &self.wallet_id)
            .field("payment_option", &self.payment_option)
            .field("payment_option_id", &self.payment_option_id)
            .field("wallet_secret", &"<redacted>")
            .field("note", &self.note)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBuyTradeRequest {
    pub order_id: OrderId,
    pub amount: Decimal,
    pub wallet_id: String,
}

impl CreateBuyTradeRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= Decimal::ZERO {
            return Err("amount must be greater than zero".to_string());
        }
        if self.wallet_id.trim().is_empty() {
            return Err("wallet id is required".to_string());
        }
        Ok(())
    }
}

/// Order filter; every `Some` field must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderQuery {
    pub created_by: Option<UserId>,
    pub status: Option<OrderStatus>,
    /// Case-insensitive substring of the order currency
    pub currency: Option<String>,
    pub min_amount: Option<Decimal>,
}

impl OrderQuery {
    /// Open orders for the market listing. `"any"` or an empty currency means all.
    pub fn pending(currency: Option<&str>, min_amount: Option<Decimal>) -> Self {
        let currency = currency
            .map(str::trim)
            .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case(ANY_CURRENCY))
            .map(str::to_string);
        Self {
            status: Some(OrderStatus::Pending),
            currency,
            min_amount,
            ..Self::default()
        }
    }

    pub fn by_creator(user_id: UserId, status: Option<OrderStatus>) -> Self {
        Self {
            created_by: Some(user_id),
            status,
            ..Self::default()
        }
    }

    pub fn matches(&self, order: &SellOrder) -> bool {
        if self.created_by.is_some_and(|u| u != order.created_by) {
            return false;
        }
        if self.status.is_some_and(|s| s != order.status) {
            return false;
        }
        if let Some(currency) = &self.currency
            && !order
                .currency
                .to_lowercase()
                .contains(&currency.to_lowercase())
        {
            return false;
        }
        if self.min_amount.is_some_and(|min| order.amount < min) {
            return false;
        }
        true
    }
}

/// Trade filter; every `Some` field must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeQuery {
    pub order_id: Option<OrderId>,
    pub buyer_id: Option<UserId>,
    pub status: Option<TradeStatus>,
}

impl TradeQuery {
    pub fn by_order(order_id: OrderId) -> Self {
        Self {
            order_id: Some(order_id),
            ..Self::default()
        }
    }

    pub fn by_buyer(buyer_id: UserId, status: Option<TradeStatus>) -> Self {
        Self {
            buyer_id: Some(buyer_id),
            status,
            ..Self::default()
        }
    }

    pub fn matches(&self, trade: &BuyTrade) -> bool {
        self.order_id.is_none_or(|o| o == trade.order_id)
            && self.buyer_id.is_none_or(|b| b == trade.buyer_id)
            && self.status.is_none_or(|s| s == trade.status)
    }
}

/// How a successful order cancellation left the escrow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCancellation {
    /// Remaining escrow went back to the seller's wallet
    Refunded { amount: Decimal },
    /// Escrow was already fully disposed of by confirmed trades
    NothingToRefund,
    /// Order is cancelled but the refund failed; a reconcile event was recorded
    RefundPending { reason: String },
    /// Order was cancelled before; nothing ran
    AlreadyCancelled,
}
