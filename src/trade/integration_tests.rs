//! Integration Tests for the order/trade workflow
//!
//! Full coordinator + ledger + reaper flows against the in-memory store and a
//! scripted gateway.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::coordinator::TradeCoordinator;
use super::error::TradeError;
use super::reaper::TradeReaper;
use super::state::{CancelReason, OrderStatus, Transition, TradeStatus};
use super::types::{
    BuyTrade, CreateBuyTradeRequest, CreateSellOrderRequest, OrderCancellation, OrderQuery,
    SellOrder, TradeChange, TradeQuery,
};
use crate::config::{EscrowConfig, ReaperConfig, TradeRules};
use crate::core_types::{DepositId, OrderId, TradeId, UserId};
use crate::escrow::{EscrowDeposit, EscrowError, EscrowLedger, EscrowRelease};
use crate::funding::GatewayError;
use crate::funding::mock::MockGateway;
use crate::notify::{Notification, NotificationKind, NotificationReceiver, notification_channel};
use crate::persistence::{
    EscrowRepository, MemoryStore, OrderRepository, ReconcileRepository, Repositories,
    StoreError, StoreResult, TradeRepository, UserStatsRepository,
};
use crate::reconcile::ReconcileKind;

const SELLER_WALLET: &str = "seller-wallet";
const BUYER_WALLET: &str = "buyer-wallet";
const ESCROW_WALLET: &str = "escrow-wallet";

/// Memory store whose individual calls can be switched to fail
#[derive(Default)]
struct FaultyStore {
    inner: Arc<MemoryStore>,
    deposit_reads: AtomicBool,
    lost_disbursements: AtomicBool,
    order_inserts: AtomicBool,
    sales: AtomicBool,
    processed_writes: AtomicBool,
    counters: AtomicBool,
}

fn broken(flag: &AtomicBool) -> StoreResult<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(StoreError::Database("connection reset".into()));
    }
    Ok(())
}

#[async_trait]
impl OrderRepository for FaultyStore {
    async fn insert_order(&self, order: &SellOrder) -> StoreResult<()> {
        broken(&self.order_inserts)?;
        self.inner.insert_order(order).await
    }

    async fn get_order(&self, id: OrderId) -> StoreResult<Option<SellOrder>> {
        self.inner.get_order(id).await
    }

    async fn find_orders(&self, query: &OrderQuery) -> StoreResult<Vec<SellOrder>> {
        self.inner.find_orders(query).await
    }

    async fn update_order_status_if(
        &self,
        id: OrderId,
        expected: OrderStatus,
        new: OrderStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.update_order_status_if(id, expected, new, at).await
    }

    async fn record_sale(
        &self,
        id: OrderId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<SellOrder>> {
        broken(&self.sales)?;
        self.inner.record_sale(id, amount, at).await
    }
}

#[async_trait]
impl TradeRepository for FaultyStore {
    async fn insert_trade(&self, trade: &BuyTrade) -> StoreResult<()> {
        self.inner.insert_trade(trade).await
    }

    async fn get_trade(&self, id: TradeId) -> StoreResult<Option<BuyTrade>> {
        self.inner.get_trade(id).await
    }

    async fn find_trades(&self, query: &TradeQuery) -> StoreResult<Vec<BuyTrade>> {
        self.inner.find_trades(query).await
    }

    async fn transition_trade(
        &self,
        id: TradeId,
        expected: TradeStatus,
        change: &TradeChange,
    ) -> StoreResult<bool> {
        // Only the write that leaves the confirmation claim
        if expected == TradeStatus::Pending && change.status == TradeStatus::Processed {
            broken(&self.processed_writes)?;
        }
        self.inner.transition_trade(id, expected, change).await
    }

    async fn set_mark_paid_if_open(&self, id: TradeId, at: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.set_mark_paid_if_open(id, at).await
    }

    async fn find_stale(
        &self,
        status: TradeStatus,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<BuyTrade>> {
        self.inner.find_stale(status, cutoff).await
    }
}

#[async_trait]
impl EscrowRepository for FaultyStore {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> StoreResult<()> {
        self.inner.insert_deposit(deposit).await
    }

    async fn find_deposit(
        &self,
        order_id: OrderId,
        user_id: UserId,
    ) -> StoreResult<Option<EscrowDeposit>> {
        broken(&self.deposit_reads)?;
        self.inner.find_deposit(order_id, user_id).await
    }

    async fn apply_disbursement(
        &self,
        deposit: &EscrowDeposit,
        expected_released_amount: Decimal,
        release: &EscrowRelease,
    ) -> StoreResult<bool> {
        if self.lost_disbursements.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner
            .apply_disbursement(deposit, expected_released_amount, release)
            .await
    }

    async fn releases_for(&self, deposit_id: DepositId) -> StoreResult<Vec<EscrowRelease>> {
        self.inner.releases_for(deposit_id).await
    }
}

#[async_trait]
impl UserStatsRepository for FaultyStore {
    async fn increment_completed_trades(&self, user_id: UserId) -> StoreResult<u64> {
        broken(&self.counters)?;
        self.inner.increment_completed_trades(user_id).await
    }

    async fn completed_trades(&self, user_id: UserId) -> StoreResult<u64> {
        self.inner.completed_trades(user_id).await
    }
}

struct TestHarness {
    coordinator: Arc<TradeCoordinator>,
    ledger: Arc<EscrowLedger>,
    reaper: TradeReaper,
    gateway: Arc<MockGateway>,
    store: Arc<MemoryStore>,
    faults: Arc<FaultyStore>,
    outbox: NotificationReceiver,
    seller: UserId,
    buyer: UserId,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_rules(TradeRules::default())
    }

    fn with_rules(rules: TradeRules) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let faults = Arc::new(FaultyStore {
            inner: store.clone(),
            ..Default::default()
        });
        let mut repos = Repositories::from_store(store.clone());
        repos.orders = faults.clone();
        repos.trades = faults.clone();
        repos.escrow = faults.clone();
        repos.stats = faults.clone();
        let config = EscrowConfig {
            transfer_base_url: "http://localhost:9".to_string(),
            escrow_wallet: ESCROW_WALLET.to_string(),
            escrow_wallet_secret: "escrow-secret".to_string(),
            transfer_timeout_ms: 1_000,
        };
        let ledger = Arc::new(EscrowLedger::new(config, gateway.clone(), &repos));
        let (queue, outbox) = notification_channel(64);
        let coordinator = Arc::new(TradeCoordinator::new(
            repos.clone(),
            ledger.clone(),
            queue,
            rules,
        ));
        let reaper = TradeReaper::new(
            repos.trades.clone(),
            &ReaperConfig {
                poll_interval_secs: 60,
                stale_after_secs: 600,
            },
        );

        Self {
            coordinator,
            ledger,
            reaper,
            gateway,
            store,
            faults,
            outbox,
            seller: UserId::new(),
            buyer: UserId::new(),
        }
    }

    async fn sell(&self, amount: i64) -> SellOrder {
        self.coordinator
            .create_sell_order(self.seller, sell_request(amount))
            .await
            .unwrap()
    }

    async fn buy(&self, order: &SellOrder, amount: i64) -> BuyTrade {
        self.buy_as(self.buyer, order, amount).await.unwrap()
    }

    async fn buy_as(
        &self,
        buyer: UserId,
        order: &SellOrder,
        amount: i64,
    ) -> Result<BuyTrade, TradeError> {
        self.coordinator
            .create_buy_trade(
                buyer,
                CreateBuyTradeRequest {
                    order_id: order.id,
                    amount: dec(amount),
                    wallet_id: BUYER_WALLET.to_string(),
                },
            )
            .await
    }

    fn drain_outbox(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Some(n) = self.outbox.try_recv() {
            out.push(n);
        }
        out
    }

    async fn reconcile_kinds(&self) -> Vec<ReconcileKind> {
        self.store
            .list_reconcile()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }
}

fn sell_request(amount: i64) -> CreateSellOrderRequest {
    CreateSellOrderRequest {
        ex_rate: dec(1500),
        amount: dec(amount),
        currency: "NGN".to_string(),
        phone_number: "+2348000000000".to_string(),
        wallet_id: SELLER_WALLET.to_string(),
        wallet_secret: "seller-secret".to_string(),
        ..Default::default()
    }
}

fn dec(v: i64) -> Decimal {
    Decimal::from(v)
}

// ============================================================================
// Lifecycle scenarios
// ============================================================================

/// 100 sold as 40 then 60: partial release, then full release.
/// A 60 trade after 40 sold needs the sold cap off.
#[tokio::test]
async fn test_partial_then_full_sale() {
    let h = TestHarness::with_rules(TradeRules {
        enforce_sold_cap: false,
    });
    let order = h.sell(100).await;

    let first = h.buy(&order, 40).await;
    assert_eq!(
        h.coordinator.confirm_trade(h.seller, first.id).await.unwrap(),
        Transition::Applied
    );

    let order_now = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order_now.amount_sold, dec(40));
    assert_eq!(order_now.amount_left, dec(60));
    let deposit = h.ledger.find_deposit(order.id, h.seller).await.unwrap().unwrap();
    assert_eq!(deposit.released_amount, dec(40));
    assert!(!deposit.released);

    let trade = h.coordinator.get_trade(first.id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Processed);
    assert!(trade.confirmed);
    assert!(trade.processed_at.is_some());

    let second = h.buy(&order, 60).await;
    assert_eq!(second.status, TradeStatus::InProgress);
    h.coordinator.confirm_trade(h.seller, second.id).await.unwrap();

    let order_now = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order_now.amount_sold, dec(100));
    assert_eq!(order_now.amount_left, Decimal::ZERO);
    assert_eq!(order_now.status, OrderStatus::Pending);

    let deposit = h.ledger.find_deposit(order.id, h.seller).await.unwrap().unwrap();
    assert_eq!(deposit.released_amount, dec(100));
    assert!(deposit.released);

    let releases = h.ledger.releases(deposit.id).await.unwrap();
    assert_eq!(releases.len(), 2);
    assert_eq!(releases[0].trade_id, Some(first.id));
    assert_eq!(releases[1].trade_id, Some(second.id));
    assert!(releases.iter().all(|r| r.recipient_id == h.buyer));

    assert_eq!(h.coordinator.completed_trades(h.seller).await.unwrap(), 2);
}

#[tokio::test]
async fn test_sold_cap_blocks_larger_follow_up_trade() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let first = h.buy(&order, 40).await;
    h.coordinator.confirm_trade(h.seller, first.id).await.unwrap();

    let err = h.buy_as(h.buyer, &order, 60).await.unwrap_err();
    assert!(matches!(err, TradeError::InsufficientFunds(_)));
    assert!(h.buy_as(UserId::new(), &order, 40).await.is_ok());
}

/// Cancelling an untouched 50 order refunds the full deposit in one entry
#[tokio::test]
async fn test_cancel_order_refunds_deposit() {
    let h = TestHarness::new();
    let order = h.sell(50).await;

    let outcome = h.coordinator.cancel_order(h.seller, order.id).await.unwrap();
    assert_eq!(outcome, OrderCancellation::Refunded { amount: dec(50) });

    let deposit = h.ledger.find_deposit(order.id, h.seller).await.unwrap().unwrap();
    assert!(deposit.released);
    assert_eq!(deposit.released_amount, dec(50));

    let releases = h.ledger.releases(deposit.id).await.unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].trade_id, None);
    assert_eq!(releases[0].recipient_id, h.seller);
    assert_eq!(releases[0].amount, dec(50));
    assert_eq!(releases[0].wallet_address, SELLER_WALLET);

    let order = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);

    let sent = h.gateway.accepted();
    assert_eq!(sent.last().unwrap().to_wallet, SELLER_WALLET);

    // Repeat is a no-op
    let again = h.coordinator.cancel_order(h.seller, order.id).await.unwrap();
    assert_eq!(again, OrderCancellation::AlreadyCancelled);
    assert_eq!(h.gateway.call_count(), 2);
}

/// Reaper cancels at T+11 min; a confirm right after is rejected
#[tokio::test]
async fn test_reaped_trade_cannot_be_confirmed() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;

    let summary = h
        .reaper
        .scan_once_at(trade.lock_time + TimeDelta::minutes(11))
        .await
        .unwrap();
    assert_eq!(summary.cancelled, 1);

    let reaped = h.coordinator.get_trade(trade.id).await.unwrap();
    assert_eq!(reaped.status, TradeStatus::Cancelled);
    assert_eq!(reaped.cancel_reason, Some(CancelReason::Auto));

    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));

    // Only the deposit ever reached the gateway
    assert_eq!(h.gateway.call_count(), 1);
}

// ============================================================================
// Confirmation
// ============================================================================

#[tokio::test]
async fn test_confirm_twice_releases_once() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 25).await;

    assert_eq!(
        h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap(),
        Transition::Applied
    );
    assert_eq!(
        h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap(),
        Transition::AlreadyApplied
    );

    // deposit + one release
    assert_eq!(h.gateway.call_count(), 2);
    let order = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order.amount_sold, dec(25));
}

#[tokio::test]
async fn test_concurrent_confirms_release_once() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 30).await;
    h.gateway
        .set_delay(Some(std::time::Duration::from_millis(20)));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let coordinator = h.coordinator.clone();
        let (seller, trade_id) = (h.seller, trade.id);
        handles.push(tokio::spawn(async move {
            coordinator.confirm_trade(seller, trade_id).await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Transition::Applied) => applied += 1,
            Ok(Transition::AlreadyApplied) => {}
            // Lost the claim while the winner was still releasing
            Err(TradeError::InvalidState(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(applied, 1);

    let deposit = h.ledger.find_deposit(order.id, h.seller).await.unwrap().unwrap();
    assert_eq!(deposit.released_amount, dec(30));
    assert_eq!(h.ledger.releases(deposit.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_release_failure_rolls_back_claim() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;

    h.gateway.fail_transfers_to(Some(BUYER_WALLET));
    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert_eq!(err.code(), "TRANSFER_FAILED");

    let trade_now = h.coordinator.get_trade(trade.id).await.unwrap();
    assert_eq!(trade_now.status, TradeStatus::InProgress);
    assert!(!trade_now.confirmed);
    let order_now = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order_now.amount_sold, Decimal::ZERO);

    // Gateway recovers, the same trade confirms
    h.gateway.fail_transfers_to(None);
    assert_eq!(
        h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap(),
        Transition::Applied
    );
}

#[tokio::test]
async fn test_store_outage_before_release_rolls_back_claim() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 30).await;

    h.faults.deposit_reads.store(true, Ordering::SeqCst);
    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Persistence(_)));

    // Nothing moved: the trade is open again and nothing is filed
    assert_eq!(h.gateway.call_count(), 1);
    let trade_now = h.coordinator.get_trade(trade.id).await.unwrap();
    assert_eq!(trade_now.status, TradeStatus::InProgress);
    assert!(h.reconcile_kinds().await.is_empty());

    h.faults.deposit_reads.store(false, Ordering::SeqCst);
    assert_eq!(
        h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap(),
        Transition::Applied
    );
}

#[tokio::test]
async fn test_unrecorded_release_keeps_claim() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 30).await;

    h.faults.lost_disbursements.store(true, Ordering::SeqCst);
    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Persistence(_)));

    // The buyer was paid: the claim stays so neither a retry nor the reaper can pay again
    assert_eq!(h.gateway.call_count(), 2);
    let trade_now = h.coordinator.get_trade(trade.id).await.unwrap();
    assert_eq!(trade_now.status, TradeStatus::Pending);
    assert_eq!(h.reconcile_kinds().await, vec![ReconcileKind::ReleaseNotRecorded]);

    h.faults.lost_disbursements.store(false, Ordering::SeqCst);
    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));
    assert_eq!(h.gateway.call_count(), 2);
}

#[tokio::test]
async fn test_trade_write_failure_after_release_is_reconciled() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 30).await;

    h.faults.processed_writes.store(true, Ordering::SeqCst);
    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Persistence(_)));

    assert_eq!(h.gateway.call_count(), 2);
    // The other writes still landed
    let order_now = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order_now.amount_sold, dec(30));
    assert_eq!(h.store.completed_trades(h.seller).await.unwrap(), 1);

    let events = h.store.list_reconcile().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ReconcileKind::TradeNotUpdated);
    assert_eq!(events[0].trade_id, Some(trade.id));
    assert_eq!(events[0].amount, Some(dec(30)));
}

#[tokio::test]
async fn test_sale_not_booked_after_release_is_reconciled() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 30).await;

    h.faults.sales.store(true, Ordering::SeqCst);
    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Persistence(_)));

    let trade_now = h.coordinator.get_trade(trade.id).await.unwrap();
    assert_eq!(trade_now.status, TradeStatus::Processed);
    let order_now = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order_now.amount_sold, Decimal::ZERO);
    assert_eq!(h.reconcile_kinds().await, vec![ReconcileKind::OrderNotUpdated]);
}

#[tokio::test]
async fn test_counter_failure_after_release_is_reconciled() {
    let mut h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 30).await;
    h.drain_outbox();

    h.faults.counters.store(true, Ordering::SeqCst);
    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Persistence(_)));

    let trade_now = h.coordinator.get_trade(trade.id).await.unwrap();
    assert_eq!(trade_now.status, TradeStatus::Processed);
    assert_eq!(h.store.completed_trades(h.seller).await.unwrap(), 0);
    assert_eq!(h.reconcile_kinds().await, vec![ReconcileKind::UserNotUpdated]);

    // The buyer was paid, so the buyer still hears about it
    let sent = h.drain_outbox();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::TradeConfirmed);
}

#[tokio::test]
async fn test_only_creator_confirms() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;

    let err = h.coordinator.confirm_trade(h.buyer, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Unauthorized(_)));
    assert_eq!(h.gateway.call_count(), 1);

    let err = h
        .coordinator
        .confirm_trade(h.seller, crate::core_types::TradeId::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Trade not found");
}

// ============================================================================
// Trade creation rules
// ============================================================================

#[tokio::test]
async fn test_one_open_trade_per_buyer_per_order() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;

    let err = h.buy_as(h.buyer, &order, 5).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));

    // Another buyer is fine
    assert!(h.buy_as(UserId::new(), &order, 5).await.is_ok());

    // After cancelling, the same buyer may try again
    h.coordinator.cancel_trade(h.buyer, trade.id).await.unwrap();
    assert!(h.buy_as(h.buyer, &order, 5).await.is_ok());
}

#[tokio::test]
async fn test_trade_amount_above_amount_left_rejected() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let first = h.buy(&order, 70).await;
    h.coordinator.confirm_trade(h.seller, first.id).await.unwrap();

    let err = h.buy_as(UserId::new(), &order, 31).await.unwrap_err();
    assert!(matches!(err, TradeError::InsufficientFunds(_)));
    assert!(h.buy_as(UserId::new(), &order, 30).await.is_ok());

    let err = h.buy_as(UserId::new(), &order, 101).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
}

#[tokio::test]
async fn test_trade_creation_rejections() {
    let h = TestHarness::new();
    let order = h.sell(100).await;

    let err = h.buy_as(h.seller, &order, 10).await.unwrap_err();
    assert!(matches!(err, TradeError::Unauthorized(_)));

    let err = h.buy_as(h.buyer, &order, 0).await.unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));

    let mut missing = order.clone();
    missing.id = crate::core_types::OrderId::new();
    let err = h.buy_as(h.buyer, &missing, 10).await.unwrap_err();
    assert!(matches!(err, TradeError::NotFound(_)));

    h.coordinator.cancel_order(h.seller, order.id).await.unwrap();
    let err = h.buy_as(h.buyer, &order, 10).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));
}

// ============================================================================
// Cancellation and payment marking
// ============================================================================

#[tokio::test]
async fn test_cancel_trade_is_idempotent_and_blocks_confirm() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;

    let err = h.coordinator.cancel_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Unauthorized(_)));

    assert_eq!(
        h.coordinator.cancel_trade(h.buyer, trade.id).await.unwrap(),
        Transition::Applied
    );
    assert_eq!(
        h.coordinator.cancel_trade(h.buyer, trade.id).await.unwrap(),
        Transition::AlreadyApplied
    );

    let trade_now = h.coordinator.get_trade(trade.id).await.unwrap();
    assert_eq!(trade_now.cancel_reason, Some(CancelReason::Manual));

    let err = h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));

    // Escrow untouched by a buyer cancel
    let deposit = h.ledger.find_deposit(order.id, h.seller).await.unwrap().unwrap();
    assert_eq!(deposit.released_amount, Decimal::ZERO);
}

#[tokio::test]
async fn test_processed_trade_cannot_be_cancelled() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;
    h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap();

    let err = h.coordinator.cancel_trade(h.buyer, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));
}

#[tokio::test]
async fn test_mark_paid_notifies_seller_once() {
    let mut h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;
    h.drain_outbox();

    let err = h.coordinator.mark_trade_paid(h.seller, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Unauthorized(_)));

    assert_eq!(
        h.coordinator.mark_trade_paid(h.buyer, trade.id).await.unwrap(),
        Transition::Applied
    );
    assert_eq!(
        h.coordinator.mark_trade_paid(h.buyer, trade.id).await.unwrap(),
        Transition::AlreadyApplied
    );

    let trade_now = h.coordinator.get_trade(trade.id).await.unwrap();
    assert!(trade_now.mark_paid);
    assert_eq!(trade_now.status, TradeStatus::InProgress);

    let sent = h.drain_outbox();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, h.seller);
    assert_eq!(sent[0].subject, "[Action Needed] Order marked paid");
}

#[tokio::test]
async fn test_mark_paid_on_cancelled_trade_rejected() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;
    h.coordinator.cancel_trade(h.buyer, trade.id).await.unwrap();

    let err = h.coordinator.mark_trade_paid(h.buyer, trade.id).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));
}

#[tokio::test]
async fn test_cancel_after_full_sale_has_nothing_to_refund() {
    let h = TestHarness::new();
    let order = h.sell(40).await;
    let trade = h.buy(&order, 40).await;
    h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap();

    let err = h
        .ledger
        .reverse(order.id, h.seller, SELLER_WALLET)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::AlreadyReleased));

    let outcome = h.coordinator.cancel_order(h.seller, order.id).await.unwrap();
    assert_eq!(outcome, OrderCancellation::NothingToRefund);
    let order = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_failed_refund_keeps_cancellation() {
    let h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 40).await;
    h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap();
    h.gateway.fail_transfers_to(Some(SELLER_WALLET));

    let outcome = h.coordinator.cancel_order(h.seller, order.id).await.unwrap();
    assert!(matches!(outcome, OrderCancellation::RefundPending { .. }));

    let order_now = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order_now.status, OrderStatus::Cancelled);

    let deposit = h.ledger.find_deposit(order.id, h.seller).await.unwrap().unwrap();
    assert!(!deposit.released);

    // The event says what is still owed and from which deposit
    let events = h.store.list_reconcile().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ReconcileKind::ReversalFailed);
    assert_eq!(events[0].order_id, Some(order.id));
    assert_eq!(events[0].deposit_id, Some(deposit.id));
    assert_eq!(events[0].amount, Some(dec(60)));
}

#[tokio::test]
async fn test_store_outage_before_refund_is_reconciled() {
    let h = TestHarness::new();
    let order = h.sell(50).await;
    h.faults.deposit_reads.store(true, Ordering::SeqCst);

    let outcome = h.coordinator.cancel_order(h.seller, order.id).await.unwrap();
    assert!(matches!(outcome, OrderCancellation::RefundPending { .. }));

    let order_now = h.coordinator.get_order(order.id).await.unwrap();
    assert_eq!(order_now.status, OrderStatus::Cancelled);
    // No refund went out, and an operator has it on the list
    assert_eq!(h.gateway.call_count(), 1);
    assert_eq!(h.reconcile_kinds().await, vec![ReconcileKind::ReversalFailed]);
}

#[tokio::test]
async fn test_unrecorded_refund_is_filed_once() {
    let h = TestHarness::new();
    let order = h.sell(50).await;
    h.faults.lost_disbursements.store(true, Ordering::SeqCst);

    let outcome = h.coordinator.cancel_order(h.seller, order.id).await.unwrap();
    assert!(matches!(outcome, OrderCancellation::RefundPending { .. }));

    assert_eq!(h.gateway.call_count(), 2);
    let events = h.store.list_reconcile().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ReconcileKind::ReversalNotRecorded);
    assert_eq!(events[0].amount, Some(dec(50)));
}

#[tokio::test]
async fn test_only_creator_cancels_order() {
    let h = TestHarness::new();
    let order = h.sell(50).await;
    let err = h.coordinator.cancel_order(h.buyer, order.id).await.unwrap_err();
    assert!(matches!(err, TradeError::Unauthorized(_)));
    assert_eq!(h.gateway.call_count(), 1);
}

// ============================================================================
// Order creation
// ============================================================================

#[tokio::test]
async fn test_failed_deposit_lists_nothing() {
    let h = TestHarness::new();
    h.gateway.set_failure(Some(GatewayError::Rejected {
        status: 400,
        message: "insufficient balance".into(),
    }));

    let err = h
        .coordinator
        .create_sell_order(h.seller, sell_request(100))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("insufficient balance"));
    assert!(h.coordinator.user_orders(h.seller, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_order_write_failure_after_deposit_is_reconciled() {
    let h = TestHarness::new();
    h.faults.order_inserts.store(true, Ordering::SeqCst);

    let err = h
        .coordinator
        .create_sell_order(h.seller, sell_request(50))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Persistence(_)));

    assert_eq!(h.gateway.call_count(), 1);
    assert!(h.coordinator.pending_orders(None, None).await.unwrap().is_empty());

    let events = h.store.list_reconcile().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ReconcileKind::OrderNotUpdated);
    assert_eq!(events[0].amount, Some(dec(50)));
    let order_id = events[0].order_id.unwrap();
    let deposit = h.ledger.find_deposit(order_id, h.seller).await.unwrap().unwrap();
    assert_eq!(events[0].deposit_id, Some(deposit.id));
}

#[tokio::test]
async fn test_invalid_order_never_reaches_gateway() {
    let h = TestHarness::new();
    let mut req = sell_request(100);
    req.wallet_secret.clear();

    let err = h.coordinator.create_sell_order(h.seller, req).await.unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));
    assert_eq!(h.gateway.call_count(), 0);
}

#[tokio::test]
async fn test_workflow_notifications() {
    let mut h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;
    h.coordinator.confirm_trade(h.seller, trade.id).await.unwrap();

    let sent = h.drain_outbox();
    let kinds: Vec<_> = sent.iter().map(|n| (n.kind, n.recipient)).collect();
    assert_eq!(
        kinds,
        vec![
            (NotificationKind::OrderCreated, h.seller),
            (NotificationKind::TradeOpened, h.seller),
            (NotificationKind::TradeConfirmed, h.buyer),
        ]
    );
}

// ============================================================================
// Messages and queries
// ============================================================================

#[tokio::test]
async fn test_trade_messages() {
    let mut h = TestHarness::new();
    let order = h.sell(100).await;
    let trade = h.buy(&order, 10).await;
    h.drain_outbox();

    h.coordinator
        .post_message(h.buyer, trade.id, "sent the transfer")
        .await
        .unwrap();
    h.coordinator
        .post_message(h.seller, trade.id, "received, releasing")
        .await
        .unwrap();

    let err = h
        .coordinator
        .post_message(UserId::new(), trade.id, "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Unauthorized(_)));
    let err = h
        .coordinator
        .post_message(h.buyer, trade.id, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));

    let messages = h.coordinator.trade_messages(trade.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message, "received, releasing");
    assert_eq!(messages[1].user_id, h.buyer);

    let sent = h.drain_outbox();
    assert_eq!(sent[0].recipient, h.seller);
    assert_eq!(sent[0].subject, "Trade message from buyer");
    assert_eq!(sent[1].recipient, h.buyer);
    assert_eq!(sent[1].subject, "New message from seller");
}

#[tokio::test]
async fn test_listing_queries() {
    let h = TestHarness::new();
    let small = h.sell(20).await;
    let mut usd = sell_request(200);
    usd.currency = "USD".to_string();
    let large = h.coordinator.create_sell_order(h.seller, usd).await.unwrap();
    let cancelled = h.sell(30).await;
    h.coordinator.cancel_order(h.seller, cancelled.id).await.unwrap();

    let all = h.coordinator.pending_orders(Some("any"), None).await.unwrap();
    assert_eq!(all.iter().map(|o| o.id).collect::<Vec<_>>(), vec![large.id, small.id]);

    let usd = h.coordinator.pending_orders(Some("us"), None).await.unwrap();
    assert_eq!(usd.len(), 1);
    assert_eq!(usd[0].id, large.id);

    let big = h.coordinator.pending_orders(None, Some(dec(100))).await.unwrap();
    assert_eq!(big.len(), 1);

    let mine = h
        .coordinator
        .user_orders(h.seller, Some(OrderStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, cancelled.id);

    let trade = h.buy(&small, 5).await;
    let by_order = h.coordinator.order_trades(small.id).await.unwrap();
    assert_eq!(by_order.len(), 1);
    let open = h
        .coordinator
        .buyer_trades(h.buyer, Some(TradeStatus::InProgress))
        .await
        .unwrap();
    assert_eq!(open[0].id, trade.id);
    assert!(
        h.coordinator
            .buyer_trades(h.buyer, Some(TradeStatus::Processed))
            .await
            .unwrap()
            .is_empty()
    );
}
