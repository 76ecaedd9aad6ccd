//! Storage layer: the `ResourceStore` abstraction, its Postgres and
//! in-memory implementations, and search-index extraction/maintenance.

pub mod extract;
pub mod index;
pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{HistoryQuery, ResourceStore, TransactionContext};
