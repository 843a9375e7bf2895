pub mod memory;
pub mod postgres;

pub use memory::{InMemoryOrderLedger, InMemoryTransactionStore};
pub use postgres::{PostgresOrderLedger, PostgresTransactionStore};
