//! In-memory implementations of `TransactionStore` and `OrderLedger`.
//!
//! Backs the test suites and local development. One `RwLock` guards both the
//! transaction and refund maps so the status compare-and-set and the refund
//! reservation each observe the same atomicity the Postgres adapter gets
//! from row locks.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{OrderSummary, Refund, RefundStatus, Transaction, TransactionStatus};
use crate::ports::{
    OrderLedger, SettlementUpdate, StoreError, StoreResult, TransactionStore,
    settled_order_status,
};

#[derive(Default)]
struct State {
    transactions: HashMap<String, Transaction>,
    refunds: HashMap<String, Refund>,
}

/// A thread-safe in-memory transaction and refund store.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored transaction, oldest first. Lets tests reach
    /// rows whose ids the failing code path never surfaced.
    pub async fn transactions(&self) -> Vec<Transaction> {
        let state = self.state.read().await;
        let mut all: Vec<Transaction> = state.transactions.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        all
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: &Transaction) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&tx.transaction_id) {
            return Err(StoreError::Duplicate(tx.transaction_id.clone()));
        }
        state
            .transactions
            .insert(tx.transaction_id.clone(), tx.clone());
        Ok(())
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> StoreResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(transaction_id).cloned())
    }

    async fn compare_and_set_status(&self, update: SettlementUpdate) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(tx) = state.transactions.get_mut(&update.transaction_id) else {
            return Ok(false);
        };
        if tx.status != update.expected {
            return Ok(false);
        }

        tx.status = update.new_status;
        if tx.gateway_transaction_id.is_none() {
            tx.gateway_transaction_id = update.gateway_transaction_id;
        }
        if let Some(raw) = update.gateway_response {
            tx.gateway_response = Some(raw);
        }
        tx.failure_reason = update.failure_reason;
        tx.next_poll_at = None;
        tx.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_gateway_response(
        &self,
        transaction_id: &str,
        gateway_transaction_id: Option<&str>,
        raw: &serde_json::Value,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(tx) = state.transactions.get_mut(transaction_id) {
            if tx.gateway_transaction_id.is_none() {
                tx.gateway_transaction_id = gateway_transaction_id.map(str::to_string);
            }
            tx.gateway_response = Some(raw.clone());
        }
        Ok(())
    }

    async fn insert_refund(&self, refund: &Refund) -> StoreResult<()> {
        let mut state = self.state.write().await;

        let parent = state
            .transactions
            .get(&refund.transaction_id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", refund.transaction_id)))?;

        if parent.status != TransactionStatus::Completed {
            return Err(StoreError::InvalidRefundParent(format!(
                "transaction {} is {} and cannot be refunded",
                parent.transaction_id, parent.status
            )));
        }

        let reserved = state
            .refunds
            .values()
            .filter(|r| r.transaction_id == refund.transaction_id && r.status.reserves_amount())
            .map(|r| r.amount.clone())
            .fold(BigDecimal::from(0), |acc, x| acc + x);

        let proposed = &reserved + &refund.amount;
        if proposed > parent.amount {
            return Err(StoreError::RefundBoundExceeded(format!(
                "refunds for {} would reach {} against amount {}",
                refund.transaction_id, proposed, parent.amount
            )));
        }

        if state.refunds.contains_key(&refund.refund_id) {
            return Err(StoreError::Duplicate(refund.refund_id.clone()));
        }
        state.refunds.insert(refund.refund_id.clone(), refund.clone());
        Ok(())
    }

    async fn update_refund(
        &self,
        refund_id: &str,
        status: RefundStatus,
        gateway_refund_id: Option<&str>,
        failure_reason: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let refund = state
            .refunds
            .get_mut(refund_id)
            .ok_or_else(|| StoreError::NotFound(format!("refund {refund_id}")))?;

        refund.status = status;
        if let Some(id) = gateway_refund_id {
            refund.gateway_refund_id = Some(id.to_string());
        }
        refund.failure_reason = failure_reason.map(str::to_string);
        refund.updated_at = Utc::now();
        Ok(())
    }

    async fn find_refund(&self, refund_id: &str) -> StoreResult<Option<Refund>> {
        let state = self.state.read().await;
        Ok(state.refunds.get(refund_id).cloned())
    }

    async fn list_refunds(&self, transaction_id: &str) -> StoreResult<Vec<Refund>> {
        let state = self.state.read().await;
        let mut refunds: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect();
        refunds.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.refund_id.cmp(&b.refund_id))
        });
        Ok(refunds)
    }

    async fn sum_completed_refunds(&self, transaction_id: &str) -> StoreResult<BigDecimal> {
        let state = self.state.read().await;
        Ok(state
            .refunds
            .values()
            .filter(|r| r.transaction_id == transaction_id && r.status == RefundStatus::Completed)
            .map(|r| r.amount.clone())
            .fold(BigDecimal::from(0), |acc, x| acc + x))
    }

    async fn list_due_for_poll(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut due: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| {
                tx.status == TransactionStatus::Pending
                    && tx.next_poll_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|tx| tx.next_poll_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn record_poll_attempt(
        &self,
        transaction_id: &str,
        polled_at: DateTime<Utc>,
        next_poll_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let tx = state
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {transaction_id}")))?;

        tx.poll_attempts += 1;
        tx.last_polled_at = Some(polled_at);
        tx.next_poll_at = next_poll_at;
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// In-memory order ledger. Also records every settlement notification it
/// receives so tests can assert the exactly-once bridge property.
#[derive(Default, Clone)]
pub struct InMemoryOrderLedger {
    orders: Arc<RwLock<HashMap<Uuid, OrderSummary>>>,
    notifications: Arc<RwLock<Vec<(Uuid, TransactionStatus)>>>,
}

impl InMemoryOrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_order(&self, order: OrderSummary) {
        self.orders.write().await.insert(order.order_id, order);
    }

    pub async fn order(&self, order_id: Uuid) -> Option<OrderSummary> {
        self.orders.read().await.get(&order_id).cloned()
    }

    /// Settlement notifications received for one order, in arrival order.
    pub async fn notifications_for(&self, order_id: Uuid) -> Vec<TransactionStatus> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id == order_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl OrderLedger for InMemoryOrderLedger {
    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<OrderSummary>> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn on_transaction_settled(
        &self,
        order_id: Uuid,
        status: TransactionStatus,
    ) -> StoreResult<()> {
        let order_status = settled_order_status(status).ok_or_else(|| {
            StoreError::Internal(format!("{status} is not a settled status"))
        })?;

        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;
        order.payment_status = order_status;

        self.notifications.write().await.push((order_id, status));
        Ok(())
    }
}
