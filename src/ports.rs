//! Ports the engine depends on: transaction/refund persistence and the
//! order ledger bridge. Handlers and the engine only ever see these traits;
//! concrete backends live in `adapters`.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    OrderPaymentStatus, OrderSummary, Refund, RefundStatus, Transaction, TransactionStatus,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("refund parent not refundable: {0}")]
    InvalidRefundParent(String),

    #[error("refund bound exceeded: {0}")]
    RefundBoundExceeded(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A conditional terminal transition. The store applies it atomically:
/// status moves to `new_status` only if it still equals `expected` at the
/// moment of the write. Every settlement in the system funnels through this.
#[derive(Debug, Clone)]
pub struct SettlementUpdate {
    pub transaction_id: String,
    /// Status the row must still hold for the write to apply. Always
    /// `Pending` today; terminal rows are never rewritten.
    pub expected: TransactionStatus,
    pub new_status: TransactionStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
}

/// Persistence for transactions and refunds.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persist a new transaction. `Duplicate` if the id already exists.
    async fn insert(&self, tx: &Transaction) -> StoreResult<()>;

    async fn find_by_transaction_id(&self, transaction_id: &str)
        -> StoreResult<Option<Transaction>>;

    /// Compare-and-set a terminal status. Returns `true` iff this call
    /// performed the transition; `false` means the row was no longer in the
    /// expected status (or does not exist) and nothing was written. Exactly
    /// one of any set of concurrent callers gets `true`.
    async fn compare_and_set_status(&self, update: SettlementUpdate) -> StoreResult<bool>;

    /// Refresh the audit snapshot of the last gateway payload. Fills the
    /// gateway reference only when it is still unset and never touches
    /// `status` or the poll schedule, so it is safe on terminal rows.
    async fn record_gateway_response(
        &self,
        transaction_id: &str,
        gateway_transaction_id: Option<&str>,
        raw: &serde_json::Value,
    ) -> StoreResult<()>;

    /// Insert a refund, atomically validating that the parent transaction is
    /// completed (`InvalidRefundParent`) and that the reserved refund total
    /// (pending + completed) stays within the parent amount
    /// (`RefundBoundExceeded`).
    async fn insert_refund(&self, refund: &Refund) -> StoreResult<()>;

    async fn update_refund(
        &self,
        refund_id: &str,
        status: RefundStatus,
        gateway_refund_id: Option<&str>,
        failure_reason: Option<&str>,
    ) -> StoreResult<()>;

    async fn find_refund(&self, refund_id: &str) -> StoreResult<Option<Refund>>;

    async fn list_refunds(&self, transaction_id: &str) -> StoreResult<Vec<Refund>>;

    async fn sum_completed_refunds(&self, transaction_id: &str) -> StoreResult<BigDecimal>;

    /// Pending transactions whose next poll is due, oldest first.
    async fn list_due_for_poll(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>>;

    /// Bump the poll counter and reschedule (or stop scheduling with
    /// `None`). Written before the remote call so a crashed poll still
    /// consumed its attempt.
    async fn record_poll_attempt(
        &self,
        transaction_id: &str,
        polled_at: DateTime<Utc>,
        next_poll_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Connectivity probe for the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}

/// Bridge to the storefront's order state. The engine calls
/// `on_transaction_settled` at most once per settled transaction, from the
/// caller that won the status CAS.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<OrderSummary>>;

    async fn on_transaction_settled(
        &self,
        order_id: Uuid,
        status: TransactionStatus,
    ) -> StoreResult<()>;
}

/// Order payment status a settled transaction maps to.
pub fn settled_order_status(status: TransactionStatus) -> Option<OrderPaymentStatus> {
    match status {
        TransactionStatus::Completed => Some(OrderPaymentStatus::Paid),
        TransactionStatus::Failed => Some(OrderPaymentStatus::Failed),
        TransactionStatus::Pending => None,
    }
}
