pub mod order;
pub mod refund;
pub mod transaction;

pub use order::{ContactInfo, OrderPaymentStatus, OrderSummary};
pub use refund::{Refund, RefundStatus};
pub use transaction::{Gateway, Transaction, TransactionStatus};
