use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::fmt;

use crate::core_types::{OrderId, TradeId, UserId};
use crate::trade::{BuyTrade, SellOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OrderCreated,
    TradeOpened,
    TradeConfirmed,
    Generic,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderCreated => "order_created",
            NotificationKind::TradeOpened => "trade_opened",
            NotificationKind::TradeConfirmed => "trade_confirmed",
            NotificationKind::Generic => "generic",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured payload for templated channels, plain text otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum NotificationBody {
    Data(serde_json::Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient: UserId,
    pub subject: String,
    pub kind: NotificationKind,
    pub body: NotificationBody,
    pub order_id: Option<OrderId>,
    pub trade_id: Option<TradeId>,
}

impl Notification {
    /// To the seller, once the deposit is in and the order is listed
    pub fn order_created(order: &SellOrder) -> Self {
        Self {
            recipient: order.created_by,
            subject: "Sell Order Created".to_string(),
            kind: NotificationKind::OrderCreated,
            body: NotificationBody::Data(json!({
                "message": format!("Order #{} has been created", order.id),
                "order_id": order.id,
                "amount": order.amount,
                "ex_rate": order.ex_rate,
                "currency": order.currency,
            })),
            order_id: Some(order.id),
            trade_id: None,
        }
    }

    /// To the seller
    pub fn trade_opened(trade: &BuyTrade) -> Self {
        Self {
            recipient: trade.seller_id,
            subject: "Buy Trade Initiated".to_string(),
            kind: NotificationKind::TradeOpened,
            body: NotificationBody::Text(format!(
                "@{} has initiated a buy trade for {}",
                trade.buyer_id, trade.amount
            )),
            order_id: Some(trade.order_id),
            trade_id: Some(trade.id),
        }
    }

    /// To the buyer
    pub fn trade_confirmed(trade: &BuyTrade) -> Self {
        Self {
            recipient: trade.buyer_id,
            subject: "Your buy order has been confirmed".to_string(),
            kind: NotificationKind::TradeConfirmed,
            body: NotificationBody::Text(format!(
                "Your trade for {} has been marked as confirmed",
                trade.amount
            )),
            order_id: Some(trade.order_id),
            trade_id: Some(trade.id),
        }
    }

    /// To the seller
    pub fn trade_marked_paid(trade: &BuyTrade) -> Self {
        Self::generic(
            trade.seller_id,
            "[Action Needed] Order marked paid",
            format!(
                "Order for {} has been marked as paid by @{}",
                trade.amount, trade.buyer_id
            ),
        )
        .for_trade(trade)
    }

    /// To whichever side of the trade did not write the message
    pub fn trade_message(trade: &BuyTrade, author: UserId, message: &str) -> Self {
        let (recipient, subject) = if author == trade.seller_id {
            (trade.buyer_id, "New message from seller")
        } else {
            (trade.seller_id, "Trade message from buyer")
        };
        Self::generic(recipient, subject, message.to_string()).for_trade(trade)
    }

    pub fn generic(recipient: UserId, subject: &str, text: String) -> Self {
        Self {
            recipient,
            subject: subject.to_string(),
            kind: NotificationKind::Generic,
            body: NotificationBody::Text(text),
            order_id: None,
            trade_id: None,
        }
    }

    fn for_trade(mut self, trade: &BuyTrade) -> Self {
        self.order_id = Some(trade.order_id);
        self.trade_id = Some(trade.id);
        self
    }

    /// Amount mentioned by a structured body, if any
    pub fn amount(&self) -> Option<Decimal> {
        match &self.body {
            NotificationBody::Data(v) => v
                .get("amount")
                .and_then(|a| serde_json::from_value(a.clone()).ok()),
            NotificationBody::Text(_) => None,
        }
    }
}
