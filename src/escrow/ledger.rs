//! Escrow Ledger
//!
//! Moves value between user wallets and the escrow wallet through the transfer
//! gateway and keeps the deposit/release records in step with it.
//!
//! Every operation is: read deposit -> call gateway -> conditional write. The
//! gateway is called before anything is written, so a failed transfer leaves no
//! trace. A write that fails after a successful transfer cannot be rolled back and
//! becomes a reconcile event.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::error::EscrowError;
use super::types::{Disbursement, EscrowDeposit, EscrowRelease};
use crate::config::EscrowConfig;
use crate::core_types::{DepositId, OrderId, TradeId, UserId};
use crate::funding::{TransferGateway, WalletTransfer};
use crate::persistence::{EscrowRepository, ReconcileRepository, Repositories};
use crate::reconcile::{self, ReconcileEvent, ReconcileKind};

type DepositKey = (OrderId, UserId);

pub struct EscrowLedger {
    config: EscrowConfig,
    gateway: Arc<dyn TransferGateway>,
    deposits: Arc<dyn EscrowRepository>,
    reconcile: Arc<dyn ReconcileRepository>,
    /// One async lock per deposit, held for read -> transfer -> write.
    /// Only serializes this process; the conditional write covers other instances.
    locks: DashMap<DepositKey, Arc<Mutex<()>>>,
}

impl EscrowLedger {
    pub fn new(
        config: EscrowConfig,
        gateway: Arc<dyn TransferGateway>,
        repos: &Repositories,
    ) -> Self {
        Self {
            config,
            gateway,
            deposits: repos.escrow.clone(),
            reconcile: repos.reconcile.clone(),
            locks: DashMap::new(),
        }
    }

    /// Move `amount` from the depositor's wallet into escrow and record the deposit.
    ///
    /// The caller guarantees one deposit per (order, depositor); a second one for the
    /// same pair moves value and then fails to record.
    pub async fn deposit(
        &self,
        order_id: OrderId,
        depositor_id: UserId,
        amount: Decimal,
        source_wallet: &str,
        source_secret: &str,
    ) -> Result<EscrowDeposit, EscrowError> {
        if amount <= Decimal::ZERO {
            return Err(EscrowError::InvalidAmount(amount));
        }

        let transfer = WalletTransfer::new(
            source_wallet,
            &self.config.escrow_wallet,
            amount,
            source_secret,
        );
        self.transfer(&transfer, "deposit").await?;

        let deposit = EscrowDeposit::new(order_id, depositor_id, source_wallet, amount, Utc::now());
        if let Err(e) = self.deposits.insert_deposit(&deposit).await {
            let event = ReconcileEvent::new(
                ReconcileKind::DepositNotRecorded,
                format!(
                    "deposit of {} from {} reached escrow but was not recorded: {}",
                    amount, source_wallet, e
                ),
            )
            .order(order_id)
            .deposit(deposit.id)
            .amount(amount);
            reconcile::report(self.reconcile.as_ref(), event).await;
            return Err(EscrowError::NotRecorded(e.to_string()));
        }

        info!(
            order_id = %order_id,
            deposit_id = %deposit.id,
            amount = %amount,
            "Escrow deposit recorded"
        );
        Ok(deposit)
    }

    /// Pay `amount` out of the seller's deposit on `order_id` to a buyer.
    pub async fn release(
        &self,
        trade_id: TradeId,
        order_id: OrderId,
        seller_id: UserId,
        amount: Decimal,
        recipient_wallet: &str,
        recipient_id: UserId,
    ) -> Result<Disbursement, EscrowError> {
        if amount <= Decimal::ZERO {
            return Err(EscrowError::InvalidAmount(amount));
        }

        let key = (order_id, seller_id);
        let result = {
            let _guard = self.lock_deposit(key).await;

            let deposit = self.load_unreleased(order_id, seller_id).await?;
            let available = deposit.remainder();
            if amount > available {
                return Err(EscrowError::InsufficientEscrow {
                    requested: amount,
                    available,
                });
            }

            let transfer = WalletTransfer::new(
                &self.config.escrow_wallet,
                recipient_wallet,
                amount,
                &self.config.escrow_wallet_secret,
            );
            self.transfer(&transfer, "release").await?;

            let now = Utc::now();
            let entry = EscrowRelease::new(
                &deposit,
                Some(trade_id),
                recipient_id,
                amount,
                recipient_wallet,
                now,
            );
            let updated = deposit.after_disbursing(amount, now);
            self.commit(&deposit, updated, entry, ReconcileKind::ReleaseNotRecorded)
                .await
        };

        if let Ok(done) = &result {
            info!(
                trade_id = %trade_id,
                order_id = %order_id,
                amount = %amount,
                released_amount = %done.deposit.released_amount,
                fully_released = done.deposit.released,
                "Escrow released"
            );
            if done.deposit.released {
                self.forget_lock(key);
            }
        }
        result
    }

    /// Return whatever is still held back to the depositor. Terminal for the deposit.
    pub async fn reverse(
        &self,
        order_id: OrderId,
        depositor_id: UserId,
        depositor_wallet: &str,
    ) -> Result<Disbursement, EscrowError> {
        let key = (order_id, depositor_id);
        let result = {
            let _guard = self.lock_deposit(key).await;

            let deposit = self.load_unreleased(order_id, depositor_id).await?;
            let remainder = deposit.remainder();

            let transfer = WalletTransfer::new(
                &self.config.escrow_wallet,
                depositor_wallet,
                remainder,
                &self.config.escrow_wallet_secret,
            );
            self.transfer(&transfer, "reversal").await?;

            let now = Utc::now();
            let entry = EscrowRelease::new(
                &deposit,
                None,
                depositor_id,
                remainder,
                depositor_wallet,
                now,
            );
            let updated = deposit.after_disbursing(remainder, now);
            self.commit(&deposit, updated, entry, ReconcileKind::ReversalNotRecorded)
                .await
        };

        if let Ok(done) = &result {
            info!(
                order_id = %order_id,
                amount = %done.release.amount,
                "Escrow reversed to depositor"
            );
            self.forget_lock(key);
        }
        result
    }

    pub async fn find_deposit(
        &self,
        order_id: OrderId,
        depositor_id: UserId,
    ) -> Result<Option<EscrowDeposit>, EscrowError> {
        Ok(self.deposits.find_deposit(order_id, depositor_id).await?)
    }

    pub async fn releases(&self, deposit_id: DepositId) -> Result<Vec<EscrowRelease>, EscrowError> {
        Ok(self.deposits.releases_for(deposit_id).await?)
    }

    async fn load_unreleased(
        &self,
        order_id: OrderId,
        user_id: UserId,
    ) -> Result<EscrowDeposit, EscrowError> {
        let deposit = self
            .deposits
            .find_deposit(order_id, user_id)
            .await?
            .ok_or(EscrowError::NotFound { order_id, user_id })?;

        if deposit.released || deposit.remainder() <= Decimal::ZERO {
            return Err(EscrowError::AlreadyReleased);
        }
        Ok(deposit)
    }

    async fn transfer(&self, transfer: &WalletTransfer, purpose: &str) -> Result<(), EscrowError> {
        match self.gateway.transfer(transfer).await {
            Ok(receipt) => {
                debug!(
                    purpose,
                    gateway = self.gateway.name(),
                    status = receipt.status,
                    "Transfer accepted"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    purpose,
                    gateway = self.gateway.name(),
                    to = %transfer.to_wallet,
                    amount = %transfer.amount,
                    code = e.code(),
                    error = %e,
                    "Transfer failed"
                );
                Err(e.into())
            }
        }
    }

    /// Conditional write of a disbursement whose transfer already happened
    async fn commit(
        &self,
        before: &EscrowDeposit,
        after: EscrowDeposit,
        entry: EscrowRelease,
        kind: ReconcileKind,
    ) -> Result<Disbursement, EscrowError> {
        let reason = match self
            .deposits
            .apply_disbursement(&after, before.released_amount, &entry)
            .await
        {
            Ok(true) => {
                return Ok(Disbursement {
                    deposit: after,
                    release: entry,
                });
            }
            Ok(false) => "deposit changed while the transfer was in flight".to_string(),
            Err(e) => e.to_string(),
        };

        let mut event = ReconcileEvent::new(
            kind,
            format!(
                "transfer of {} to {} succeeded but was not recorded: {}",
                entry.amount, entry.wallet_address, reason
            ),
        )
        .order(before.order_id)
        .deposit(before.id)
        .amount(entry.amount);
        if let Some(trade_id) = entry.trade_id {
            event = event.trade(trade_id);
        }
        reconcile::report(self.reconcile.as_ref(), event).await;

        Err(EscrowError::NotRecorded(reason))
    }

    async fn lock_deposit(&self, key: DepositKey) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await
        let lock = self.locks.entry(key).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the lock of a fully disposed deposit if nobody is waiting on it
    fn forget_lock(&self, key: DepositKey) {
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
