//! Transactional store boundary.
//!
//! The dispatch layer only needs three things from persistence: open a
//! transaction, commit it, roll it back. Everything else (schemas, queries)
//! belongs to the command handlers that receive the transaction handle.
//!
//! Stores that also implement [`OutboxStore`] keep integration messages in
//! the same transaction as the command's writes, for publishing after commit.

pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, InMemoryTransaction};
pub use outbox::{OutboxRecord, OutboxStore};
pub use postgres::PostgresStore;
pub use store::Store;
