//! Record storage
//!
//! Business code only sees the repository traits; [`MemoryStore`] and [`PgStore`]
//! implement all of them.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repository::{
    ChatRepository, EscrowRepository, OrderRepository, ReconcileRepository, Repositories,
    TradeRepository, UserStatsRepository,
};
