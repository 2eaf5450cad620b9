use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{DepositId, OrderId, ReleaseId, TradeId, UserId};

/// Value held in the escrow wallet on behalf of one order's creator.
///
/// `released_amount` only grows and never exceeds `amount`; `released` is true
/// exactly when `released_amount == amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowDeposit {
    pub id: DepositId,
    pub order_id: OrderId,
    /// Depositor
    pub user_id: UserId,
    pub source_wallet: String,
    pub amount: Decimal,
    pub released_amount: Decimal,
    pub released: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowDeposit {
    pub fn new(
        order_id: OrderId,
        user_id: UserId,
        source_wallet: impl Into<String>,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DepositId::new(),
            order_id,
            user_id,
            source_wallet: source_wallet.into(),
            amount,
            released_amount: Decimal::ZERO,
            released: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount still held
    #[inline]
    pub fn remainder(&self) -> Decimal {
        self.amount - self.released_amount
    }

    /// Deposit state after paying out `amount` more
    pub fn after_disbursing(&self, amount: Decimal, now: DateTime<Utc>) -> Self {
        let released_amount = self.released_amount + amount;
        Self {
            released_amount,
            released: released_amount == self.amount,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// Append-only record of value leaving escrow.
///
/// `trade_id` is `None` for a reversal back to the depositor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRelease {
    pub id: ReleaseId,
    /// Deposit this was paid out of
    pub parent_id: DepositId,
    pub trade_id: Option<TradeId>,
    pub recipient_id: UserId,
    pub amount: Decimal,
    pub wallet_address: String,
    pub created_at: DateTime<Utc>,
}

impl EscrowRelease {
    pub fn new(
        deposit: &EscrowDeposit,
        trade_id: Option<TradeId>,
        recipient_id: UserId,
        amount: Decimal,
        wallet_address: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReleaseId::new(),
            parent_id: deposit.id,
            trade_id,
            recipient_id,
            amount,
            wallet_address: wallet_address.into(),
            created_at: now,
        }
    }

    #[inline]
    pub fn is_reversal(&self) -> bool {
        self.trade_id.is_none()
    }
}

/// Successful release or reversal: the deposit as written and its audit entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disbursement {
    pub deposit: EscrowDeposit,
    pub release: EscrowRelease,
}
