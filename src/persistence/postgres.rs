//! PostgreSQL store
//!
//! Ids are stored as ULID text, amounts as NUMERIC. All status changes are
//! `UPDATE ... WHERE status = $expected` so several instances can share the tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::str::FromStr;

use super::error::{StoreError, StoreResult};
use super::repository::{
    ChatRepository, EscrowRepository, OrderRepository, ReconcileRepository, TradeRepository,
    UserStatsRepository,
};
use crate::core_types::{DepositId, OrderId, TradeId, UserId};
use crate::escrow::{EscrowDeposit, EscrowRelease};
use crate::reconcile::ReconcileEvent;
use crate::trade::{
    BuyTrade, CancelReason, OrderQuery, OrderStatus, SellOrder, TradeChange, TradeChat,
    TradeQuery, TradeStatus,
};

const ORDER_COLUMNS: &str = "order_id, created_by, ex_rate, amount, amount_sold, amount_left, \
     currency, phone_number, wallet_id, payment_option, payment_option_id, note, status, \
     created_at, updated_at";

const TRADE_COLUMNS: &str = "trade_id, seller_id, buyer_id, order_id, buyer_wallet, amount, \
     confirmed, mark_paid, lock_time, status, cancel_reason, processed_at, created_at, updated_at";

const DEPOSIT_COLUMNS: &str = "deposit_id, order_id, user_id, source_wallet, amount, \
     released_amount, released, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        super::schema::init_schema(&self.pool).await
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn parse_col<T: FromStr>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{} = {:?}: {}", column, raw, e)))
}

fn parse_opt_col<T: FromStr>(row: &PgRow, column: &str) -> StoreResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| StoreError::Corrupt(format!("{} = {:?}: {}", column, s, e)))
    })
    .transpose()
}

fn row_to_order(row: &PgRow) -> StoreResult<SellOrder> {
    Ok(SellOrder {
        id: parse_col(row, "order_id")?,
        created_by: parse_col(row, "created_by")?,
        ex_rate: row.try_get("ex_rate")?,
        amount: row.try_get("amount")?,
        amount_sold: row.try_get("amount_sold")?,
        amount_left: row.try_get("amount_left")?,
        currency: row.try_get("currency")?,
        phone_number: row.try_get("phone_number")?,
        wallet_id: row.try_get("wallet_id")?,
        payment_option: row.try_get("payment_option")?,
        payment_option_id: row.try_get("payment_option_id")?,
        note: row.try_get("note")?,
        status: parse_col::<OrderStatus>(row, "status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_trade(row: &PgRow) -> StoreResult<BuyTrade> {
    let cancel_reason = row
        .try_get::<Option<i16>, _>("cancel_reason")?
        .map(|id| {
            CancelReason::from_id(id)
                .ok_or_else(|| StoreError::Corrupt(format!("cancel_reason = {}", id)))
        })
        .transpose()?;

    Ok(BuyTrade {
        id: parse_col(row, "trade_id")?,
        seller_id: parse_col(row, "seller_id")?,
        buyer_id: parse_col(row, "buyer_id")?,
        order_id: parse_col(row, "order_id")?,
        buyer_wallet: row.try_get("buyer_wallet")?,
        amount: row.try_get("amount")?,
        confirmed: row.try_get("confirmed")?,
        mark_paid: row.try_get("mark_paid")?,
        lock_time: row.try_get("lock_time")?,
        status: parse_col::<TradeStatus>(row, "status")?,
        cancel_reason,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_deposit(row: &PgRow) -> StoreResult<EscrowDeposit> {
    Ok(EscrowDeposit {
        id: parse_col(row, "deposit_id")?,
        order_id: parse_col(row, "order_id")?,
        user_id: parse_col(row, "user_id")?,
        source_wallet: row.try_get("source_wallet")?,
        amount: row.try_get("amount")?,
        released_amount: row.try_get("released_amount")?,
        released: row.try_get("released")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_release(row: &PgRow) -> StoreResult<EscrowRelease> {
    Ok(EscrowRelease {
        id: parse_col(row, "release_id")?,
        parent_id: parse_col(row, "parent_id")?,
        trade_id: parse_opt_col(row, "trade_id")?,
        recipient_id: parse_col(row, "recipient_id")?,
        amount: row.try_get("amount")?,
        wallet_address: row.try_get("wallet_address")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_chat(row: &PgRow) -> StoreResult<TradeChat> {
    Ok(TradeChat {
        id: parse_col(row, "chat_id")?,
        trade_id: parse_col(row, "trade_id")?,
        user_id: parse_col(row, "user_id")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_reconcile(row: &PgRow) -> StoreResult<ReconcileEvent> {
    Ok(ReconcileEvent {
        id: parse_col(row, "reconcile_id")?,
        kind: parse_col(row, "kind")?,
        order_id: parse_opt_col(row, "order_id")?,
        trade_id: parse_opt_col(row, "trade_id")?,
        deposit_id: parse_opt_col(row, "deposit_id")?,
        amount: row.try_get("amount")?,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn insert_order(&self, order: &SellOrder) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sell_orders_tb
                (order_id, created_by, ex_rate, amount, amount_sold, amount_left, currency,
                 phone_number, wallet_id, payment_option, payment_option_id, note, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(order.id.to_string())
        .bind(order.created_by.to_string())
        .bind(order.ex_rate)
        .bind(order.amount)
        .bind(order.amount_sold)
        .bind(order.amount_left)
        .bind(&order.currency)
        .bind(&order.phone_number)
        .bind(&order.wallet_id)
        .bind(order.payment_option)
        .bind(&order.payment_option_id)
        .bind(&order.note)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> StoreResult<Option<SellOrder>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sell_orders_tb WHERE order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_order).transpose()
    }

    async fn find_orders(&self, query: &OrderQuery) -> StoreResult<Vec<SellOrder>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM sell_orders_tb WHERE TRUE",
            ORDER_COLUMNS
        ));
        if let Some(created_by) = query.created_by {
            qb.push(" AND created_by = ").push_bind(created_by.to_string());
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(currency) = &query.currency {
            // Literal substring, not a pattern
            qb.push(" AND strpos(lower(currency), lower(")
                .push_bind(currency.clone())
                .push(")) > 0");
        }
        if let Some(min_amount) = query.min_amount {
            qb.push(" AND amount >= ").push_bind(min_amount);
        }
        qb.push(" ORDER BY created_at DESC, order_id DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_order).collect()
    }

    async fn update_order_status_if(
        &self,
        id: OrderId,
        expected: OrderStatus,
        new: OrderStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sell_orders_tb
            SET status = $1, updated_at = $2
            WHERE order_id = $3 AND status = $4
            "#,
        )
        .bind(new.as_str())
        .bind(at)
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_sale(
        &self,
        id: OrderId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<SellOrder>> {
        // SET expressions read the pre-update row
        let row = sqlx::query(&format!(
            r#"
            UPDATE sell_orders_tb
            SET amount_sold = amount_sold + $1,
                amount_left = amount - (amount_sold + $1),
                updated_at = $2
            WHERE order_id = $3
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(amount)
        .bind(at)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_order).transpose()
    }
}

#[async_trait]
impl TradeRepository for PgStore {
    async fn insert_trade(&self, trade: &BuyTrade) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO buy_trades_tb
                (trade_id, seller_id, buyer_id, order_id, buyer_wallet, amount, confirmed,
                 mark_paid, lock_time, status, cancel_reason, processed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(trade.id.to_string())
        .bind(trade.seller_id.to_string())
        .bind(trade.buyer_id.to_string())
        .bind(trade.order_id.to_string())
        .bind(&trade.buyer_wallet)
        .bind(trade.amount)
        .bind(trade.confirmed)
        .bind(trade.mark_paid)
        .bind(trade.lock_time)
        .bind(trade.status.as_str())
        .bind(trade.cancel_reason.map(|r| r.id()))
        .bind(trade.processed_at)
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateOpenTrade
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_trade(&self, id: TradeId) -> StoreResult<Option<BuyTrade>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM buy_trades_tb WHERE trade_id = $1",
            TRADE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_trade).transpose()
    }

    async fn find_trades(&self, query: &TradeQuery) -> StoreResult<Vec<BuyTrade>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM buy_trades_tb WHERE TRUE",
            TRADE_COLUMNS
        ));
        if let Some(order_id) = query.order_id {
            qb.push(" AND order_id = ").push_bind(order_id.to_string());
        }
        if let Some(buyer_id) = query.buyer_id {
            qb.push(" AND buyer_id = ").push_bind(buyer_id.to_string());
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC, trade_id DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_trade).collect()
    }

    async fn transition_trade(
        &self,
        id: TradeId,
        expected: TradeStatus,
        change: &TradeChange,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE buy_trades_tb
            SET status = $1,
                confirmed = COALESCE($2, confirmed),
                processed_at = COALESCE($3, processed_at),
                cancel_reason = COALESCE($4, cancel_reason),
                updated_at = $5
            WHERE trade_id = $6 AND status = $7
            "#,
        )
        .bind(change.status.as_str())
        .bind(change.confirmed)
        .bind(change.processed_at)
        .bind(change.cancel_reason.map(|r| r.id()))
        .bind(change.at)
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_mark_paid_if_open(&self, id: TradeId, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE buy_trades_tb
            SET mark_paid = TRUE, updated_at = $1
            WHERE trade_id = $2 AND mark_paid = FALSE AND status IN ($3, $4)
            "#,
        )
        .bind(at)
        .bind(id.to_string())
        .bind(TradeStatus::InProgress.as_str())
        .bind(TradeStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale(
        &self,
        status: TradeStatus,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<BuyTrade>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM buy_trades_tb
            WHERE status = $1 AND lock_time <= $2
            ORDER BY lock_time ASC
            "#,
            TRADE_COLUMNS
        ))
        .bind(status.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trade).collect()
    }
}

#[async_trait]
impl EscrowRepository for PgStore {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_deposits_tb
                (deposit_id, order_id, user_id, source_wallet, amount, released_amount,
                 released, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(deposit.id.to_string())
        .bind(deposit.order_id.to_string())
        .bind(deposit.user_id.to_string())
        .bind(&deposit.source_wallet)
        .bind(deposit.amount)
        .bind(deposit.released_amount)
        .bind(deposit.released)
        .bind(deposit.created_at)
        .bind(deposit.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateDeposit
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn find_deposit(
        &self,
        order_id: OrderId,
        user_id: UserId,
    ) -> StoreResult<Option<EscrowDeposit>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_deposits_tb WHERE order_id = $1 AND user_id = $2",
            DEPOSIT_COLUMNS
        ))
        .bind(order_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_deposit).transpose()
    }

    async fn apply_disbursement(
        &self,
        deposit: &EscrowDeposit,
        expected_released_amount: Decimal,
        release: &EscrowRelease,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE escrow_deposits_tb
            SET released_amount = $1, released = $2, updated_at = $3
            WHERE deposit_id = $4 AND released = FALSE AND released_amount = $5
            "#,
        )
        .bind(deposit.released_amount)
        .bind(deposit.released)
        .bind(deposit.updated_at)
        .bind(deposit.id.to_string())
        .bind(expected_released_amount)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO escrow_releases_tb
                (release_id, parent_id, trade_id, recipient_id, amount, wallet_address, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(release.id.to_string())
        .bind(release.parent_id.to_string())
        .bind(release.trade_id.map(|id| id.to_string()))
        .bind(release.recipient_id.to_string())
        .bind(release.amount)
        .bind(&release.wallet_address)
        .bind(release.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn releases_for(&self, deposit_id: DepositId) -> StoreResult<Vec<EscrowRelease>> {
        let rows = sqlx::query(
            r#"
            SELECT release_id, parent_id, trade_id, recipient_id, amount, wallet_address, created_at
            FROM escrow_releases_tb
            WHERE parent_id = $1
            ORDER BY created_at ASC, release_id ASC
            "#,
        )
        .bind(deposit_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_release).collect()
    }
}

#[async_trait]
impl ChatRepository for PgStore {
    async fn insert_chat(&self, chat: &TradeChat) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_chats_tb (chat_id, trade_id, user_id, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(chat.id.to_string())
        .bind(chat.trade_id.to_string())
        .bind(chat.user_id.to_string())
        .bind(&chat.message)
        .bind(chat.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn chats_for_trade(&self, trade_id: TradeId) -> StoreResult<Vec<TradeChat>> {
        let rows = sqlx::query(
            r#"
            SELECT chat_id, trade_id, user_id, message, created_at
            FROM trade_chats_tb
            WHERE trade_id = $1
            ORDER BY created_at DESC, chat_id DESC
            "#,
        )
        .bind(trade_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_chat).collect()
    }
}

#[async_trait]
impl UserStatsRepository for PgStore {
    async fn increment_completed_trades(&self, user_id: UserId) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO user_stats_tb (user_id, num_transactions)
            VALUES ($1, 1)
            ON CONFLICT (user_id)
            DO UPDATE SET num_transactions = user_stats_tb.num_transactions + 1
            RETURNING num_transactions
            "#,
        )
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn completed_trades(&self, user_id: UserId) -> StoreResult<u64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT num_transactions FROM user_stats_tb WHERE user_id = $1")
                .bind(user_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl ReconcileRepository for PgStore {
    async fn insert_reconcile(&self, event: &ReconcileEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconcile_events_tb
                (reconcile_id, kind, order_id, trade_id, deposit_id, amount, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.kind.as_str())
        .bind(event.order_id.map(|id| id.to_string()))
        .bind(event.trade_id.map(|id| id.to_string()))
        .bind(event.deposit_id.map(|id| id.to_string()))
        .bind(event.amount)
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_reconcile(&self) -> StoreResult<Vec<ReconcileEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT reconcile_id, kind, order_id, trade_id, deposit_id, amount, detail, created_at
            FROM reconcile_events_tb
            ORDER BY created_at ASC, reconcile_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_reconcile).collect()
    }
}
