//! Reconciliation events
//!
//! Written whenever value may have moved through the transfer service without the
//! local records reflecting it, or a refund failed after an order was cancelled.
//! Operators work these by hand; nothing retries them automatically.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::error;

use crate::core_types::{DepositId, OrderId, ReconcileId, TradeId};
use crate::logging::RECONCILE_TARGET;
use crate::persistence::ReconcileRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileKind {
    /// Deposit transfer succeeded, deposit row missing
    DepositNotRecorded,
    /// Release transfer succeeded, deposit/release rows not updated
    ReleaseNotRecorded,
    /// Refund transfer succeeded, deposit/release rows not updated
    ReversalNotRecorded,
    /// Order cancelled but the refund transfer failed
    ReversalFailed,
    /// Escrow released but the trade is not marked processed
    TradeNotUpdated,
    /// Escrow released but the sale is not booked on the order
    OrderNotUpdated,
    /// Escrow released but the seller's completed-trade counter was not incremented
    UserNotUpdated,
}

impl ReconcileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileKind::DepositNotRecorded => "deposit_not_recorded",
            ReconcileKind::ReleaseNotRecorded => "release_not_recorded",
            ReconcileKind::ReversalNotRecorded => "reversal_not_recorded",
            ReconcileKind::ReversalFailed => "reversal_failed",
            ReconcileKind::TradeNotUpdated => "trade_not_updated",
            ReconcileKind::OrderNotUpdated => "order_not_updated",
            ReconcileKind::UserNotUpdated => "user_not_updated",
        }
    }
}

impl fmt::Display for ReconcileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReconcileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit_not_recorded" => Ok(ReconcileKind::DepositNotRecorded),
            "release_not_recorded" => Ok(ReconcileKind::ReleaseNotRecorded),
            "reversal_not_recorded" => Ok(ReconcileKind::ReversalNotRecorded),
            "reversal_failed" => Ok(ReconcileKind::ReversalFailed),
            "trade_not_updated" => Ok(ReconcileKind::TradeNotUpdated),
            "order_not_updated" => Ok(ReconcileKind::OrderNotUpdated),
            "user_not_updated" => Ok(ReconcileKind::UserNotUpdated),
            _ => Err(format!("Invalid reconcile kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileEvent {
    pub id: ReconcileId,
    pub kind: ReconcileKind,
    pub order_id: Option<OrderId>,
    pub trade_id: Option<TradeId>,
    pub deposit_id: Option<DepositId>,
    pub amount: Option<Decimal>,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl ReconcileEvent {
    pub fn new(kind: ReconcileKind, detail: impl Into<String>) -> Self {
        Self {
            id: ReconcileId::new(),
            kind,
            order_id: None,
            trade_id: None,
            deposit_id: None,
            amount: None,
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }

    pub fn order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn trade(mut self, trade_id: TradeId) -> Self {
        self.trade_id = Some(trade_id);
        self
    }

    pub fn deposit(mut self, deposit_id: DepositId) -> Self {
        self.deposit_id = Some(deposit_id);
        self
    }

    pub fn amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// Log and persist a reconcile event.
///
/// Never fails: if the store is down as well, the error log line is the record.
pub async fn report(repo: &dyn ReconcileRepository, event: ReconcileEvent) {
    error!(
        target: RECONCILE_TARGET,
        reconcile_id = %event.id,
        kind = %event.kind,
        order_id = ?event.order_id.map(|id| id.to_string()),
        trade_id = ?event.trade_id.map(|id| id.to_string()),
        deposit_id = ?event.deposit_id.map(|id| id.to_string()),
        amount = ?event.amount,
        detail = %event.detail,
        "Reconciliation required"
    );

    if let Err(e) = repo.insert_reconcile(&event).await {
        let record = serde_json::to_string(&event).unwrap_or_else(|_| event.detail.clone());
        error!(
            target: RECONCILE_TARGET,
            reconcile_id = %event.id,
            error = %e,
            record = %record,
            "Failed to persist reconcile event"
        );
    }
}
