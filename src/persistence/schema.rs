use sqlx::PgPool;

use super::error::StoreResult;

const CREATE_SELL_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sell_orders_tb (
    order_id          TEXT PRIMARY KEY,
    created_by        TEXT NOT NULL,
    ex_rate           NUMERIC NOT NULL,
    amount            NUMERIC NOT NULL CHECK (amount > 0),
    amount_sold       NUMERIC NOT NULL DEFAULT 0,
    amount_left       NUMERIC NOT NULL,
    currency          TEXT NOT NULL,
    phone_number      TEXT NOT NULL,
    wallet_id         TEXT NOT NULL,
    payment_option    INTEGER NOT NULL DEFAULT 0,
    payment_option_id TEXT NOT NULL DEFAULT '',
    note              TEXT NOT NULL DEFAULT '',
    status            TEXT NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    CHECK (amount_left = amount - amount_sold)
)
"#;

const CREATE_SELL_ORDERS_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_sell_orders_status ON sell_orders_tb (status, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_sell_orders_creator ON sell_orders_tb (created_by, created_at DESC)
"#;

const CREATE_BUY_TRADES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS buy_trades_tb (
    trade_id      TEXT PRIMARY KEY,
    seller_id     TEXT NOT NULL,
    buyer_id      TEXT NOT NULL,
    order_id      TEXT NOT NULL REFERENCES sell_orders_tb (order_id),
    buyer_wallet  TEXT NOT NULL,
    amount        NUMERIC NOT NULL CHECK (amount > 0),
    confirmed     BOOLEAN NOT NULL DEFAULT FALSE,
    mark_paid     BOOLEAN NOT NULL DEFAULT FALSE,
    lock_time     TIMESTAMPTZ NOT NULL,
    status        TEXT NOT NULL,
    cancel_reason SMALLINT,
    processed_at  TIMESTAMPTZ,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL
)
"#;

// One open trade per buyer per order, enforced across process instances
const CREATE_BUY_TRADES_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS uq_buy_trades_open
    ON buy_trades_tb (order_id, buyer_id)
    WHERE status IN ('in-progress', 'pending');
CREATE INDEX IF NOT EXISTS idx_buy_trades_stale ON buy_trades_tb (status, lock_time);
CREATE INDEX IF NOT EXISTS idx_buy_trades_order ON buy_trades_tb (order_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_buy_trades_buyer ON buy_trades_tb (buyer_id, created_at DESC)
"#;

const CREATE_ESCROW_DEPOSITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS escrow_deposits_tb (
    deposit_id      TEXT PRIMARY KEY,
    order_id        TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    source_wallet   TEXT NOT NULL,
    amount          NUMERIC NOT NULL CHECK (amount > 0),
    released_amount NUMERIC NOT NULL DEFAULT 0,
    released        BOOLEAN NOT NULL DEFAULT FALSE,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    UNIQUE (order_id, user_id),
    CHECK (released_amount >= 0 AND released_amount <= amount),
    CHECK (released = (released_amount = amount))
)
"#;

const CREATE_ESCROW_RELEASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS escrow_releases_tb (
    release_id     TEXT PRIMARY KEY,
    parent_id      TEXT NOT NULL REFERENCES escrow_deposits_tb (deposit_id),
    trade_id       TEXT,
    recipient_id   TEXT NOT NULL,
    amount         NUMERIC NOT NULL,
    wallet_address TEXT NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_TRADE_CHATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS trade_chats_tb (
    chat_id    TEXT PRIMARY KEY,
    trade_id   TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_USER_STATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_stats_tb (
    user_id          TEXT PRIMARY KEY,
    num_transactions BIGINT NOT NULL DEFAULT 0
)
"#;

const CREATE_RECONCILE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reconcile_events_tb (
    reconcile_id TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    order_id     TEXT,
    trade_id     TEXT,
    deposit_id   TEXT,
    amount       NUMERIC,
    detail       TEXT NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL
)
"#;

/// Create tables and indexes if missing
pub async fn init_schema(pool: &PgPool) -> StoreResult<()> {
    tracing::info!("Initializing PostgreSQL schema...");

    for statement in [
        CREATE_SELL_ORDERS_TABLE,
        CREATE_SELL_ORDERS_INDEXES,
        CREATE_BUY_TRADES_TABLE,
        CREATE_BUY_TRADES_INDEXES,
        CREATE_ESCROW_DEPOSITS_TABLE,
        CREATE_ESCROW_RELEASES_TABLE,
        CREATE_TRADE_CHATS_TABLE,
        CREATE_USER_STATS_TABLE,
        CREATE_RECONCILE_EVENTS_TABLE,
    ] {
        // raw_sql: the index constants hold several statements
        sqlx::raw_sql(statement).execute(pool).await?;
    }

    tracing::info!("PostgreSQL schema ready");
    Ok(())
}
