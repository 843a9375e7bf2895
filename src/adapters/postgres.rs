//! Postgres implementations of `TransactionStore` and `OrderLedger`.
//!
//! The status compare-and-set is a single conditional UPDATE, so the
//! exactly-once settlement property rides on Postgres row atomicity. Refund
//! reservation takes a row lock on the parent transaction to serialize
//! concurrent reservations against the refundable balance.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{OrderSummary, Refund, RefundStatus, Transaction, TransactionStatus};
use crate::ports::{
    OrderLedger, SettlementUpdate, StoreError, StoreResult, TransactionStore,
    settled_order_status,
};

/// Postgres-backed transaction and refund store.
#[derive(Clone)]
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn insert(&self, tx: &Transaction) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                transaction_id, order_id, gateway, amount, currency, status,
                gateway_transaction_id, gateway_response, failure_reason,
                poll_attempts, last_polled_at, next_poll_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&tx.transaction_id)
        .bind(tx.order_id)
        .bind(tx.gateway.as_str())
        .bind(&tx.amount)
        .bind(&tx.currency)
        .bind(tx.status.as_str())
        .bind(&tx.gateway_transaction_id)
        .bind(&tx.gateway_response)
        .bind(&tx.failure_reason)
        .bind(tx.poll_attempts)
        .bind(tx.last_polled_at)
        .bind(tx.next_poll_at)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Duplicate(tx.transaction_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn compare_and_set_status(&self, update: SettlementUpdate) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $3,
                gateway_transaction_id = COALESCE(gateway_transaction_id, $4),
                gateway_response = COALESCE($5, gateway_response),
                failure_reason = $6,
                next_poll_at = NULL,
                updated_at = NOW()
            WHERE transaction_id = $1 AND status = $2
            "#,
        )
        .bind(&update.transaction_id)
        .bind(update.expected.as_str())
        .bind(update.new_status.as_str())
        .bind(&update.gateway_transaction_id)
        .bind(&update.gateway_response)
        .bind(&update.failure_reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_gateway_response(
        &self,
        transaction_id: &str,
        gateway_transaction_id: Option<&str>,
        raw: &serde_json::Value,
    ) -> StoreResult<()> {
        // No updated_at bump: a redelivered result must leave the row
        // observably unchanged.
        sqlx::query(
            r#"
            UPDATE transactions
            SET gateway_transaction_id = COALESCE(gateway_transaction_id, $2),
                gateway_response = $3
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(gateway_transaction_id)
        .bind(raw)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_refund(&self, refund: &Refund) -> StoreResult<()> {
        let mut dbtx = self.pool.begin().await?;

        // Row lock on the parent serializes concurrent reservations.
        let parent = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE transaction_id = $1 FOR UPDATE",
        )
        .bind(&refund.transaction_id)
        .fetch_optional(&mut *dbtx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("transaction {}", refund.transaction_id)))?
        .into_domain()?;

        if parent.status != TransactionStatus::Completed {
            return Err(StoreError::InvalidRefundParent(format!(
                "transaction {} is {} and cannot be refunded",
                parent.transaction_id, parent.status
            )));
        }

        let reserved: BigDecimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM refunds
            WHERE transaction_id = $1 AND status <> 'failed'
            "#,
        )
        .bind(&refund.transaction_id)
        .fetch_one(&mut *dbtx)
        .await?;

        let proposed = &reserved + &refund.amount;
        if proposed > parent.amount {
            return Err(StoreError::RefundBoundExceeded(format!(
                "refunds for {} would reach {} against amount {}",
                refund.transaction_id, proposed, parent.amount
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO refunds (
                refund_id, transaction_id, amount, reason, status,
                gateway_refund_id, failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&refund.refund_id)
        .bind(&refund.transaction_id)
        .bind(&refund.amount)
        .bind(&refund.reason)
        .bind(refund.status.as_str())
        .bind(&refund.gateway_refund_id)
        .bind(&refund.failure_reason)
        .bind(refund.created_at)
        .bind(refund.updated_at)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn update_refund(
        &self,
        refund_id: &str,
        status: RefundStatus,
        gateway_refund_id: Option<&str>,
        failure_reason: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE refunds
            SET status = $2,
                gateway_refund_id = COALESCE($3, gateway_refund_id),
                failure_reason = $4,
                updated_at = NOW()
            WHERE refund_id = $1
            "#,
        )
        .bind(refund_id)
        .bind(status.as_str())
        .bind(gateway_refund_id)
        .bind(failure_reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("refund {refund_id}")));
        }
        Ok(())
    }

    async fn find_refund(&self, refund_id: &str) -> StoreResult<Option<Refund>> {
        let row = sqlx::query_as::<_, RefundRow>("SELECT * FROM refunds WHERE refund_id = $1")
            .bind(refund_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RefundRow::into_domain).transpose()
    }

    async fn list_refunds(&self, transaction_id: &str) -> StoreResult<Vec<Refund>> {
        let rows = sqlx::query_as::<_, RefundRow>(
            "SELECT * FROM refunds WHERE transaction_id = $1 ORDER BY created_at ASC",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RefundRow::into_domain).collect()
    }

    async fn sum_completed_refunds(&self, transaction_id: &str) -> StoreResult<BigDecimal> {
        let sum: BigDecimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM refunds
            WHERE transaction_id = $1 AND status = 'completed'
            "#,
        )
        .bind(transaction_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(sum)
    }

    async fn list_due_for_poll(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>> {
        // No row lock: the claim is record_poll_attempt pushing next_poll_at
        // forward, and the status CAS dedupes overlapping pollers anyway.
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE status = 'pending'
              AND next_poll_at IS NOT NULL
              AND next_poll_at <= $1
            ORDER BY next_poll_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn record_poll_attempt(
        &self,
        transaction_id: &str,
        polled_at: DateTime<Utc>,
        next_poll_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET poll_attempts = poll_attempts + 1,
                last_polled_at = $2,
                next_poll_at = $3,
                updated_at = NOW()
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(polled_at)
        .bind(next_poll_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("transaction {transaction_id}")));
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

/// Postgres-backed order ledger bridge. Writes are idempotent by value, so a
/// replayed settlement notification cannot corrupt the order row.
#[derive(Clone)]
pub struct PostgresOrderLedger {
    pool: PgPool,
}

impl PostgresOrderLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderLedger for PostgresOrderLedger {
    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<OrderSummary>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT order_id, customer_id, total_amount, currency, payment_status FROM orders WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OrderRow::into_domain).transpose()
    }

    async fn on_transaction_settled(
        &self,
        order_id: Uuid,
        status: TransactionStatus,
    ) -> StoreResult<()> {
        let order_status = settled_order_status(status).ok_or_else(|| {
            StoreError::Internal(format!("{status} is not a settled status"))
        })?;

        let result = sqlx::query(
            "UPDATE orders SET payment_status = $2, updated_at = NOW() WHERE order_id = $1",
        )
        .bind(order_id)
        .bind(order_status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("order {order_id}")));
        }
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    transaction_id: String,
    order_id: Uuid,
    gateway: String,
    amount: BigDecimal,
    currency: String,
    status: String,
    gateway_transaction_id: Option<String>,
    gateway_response: Option<serde_json::Value>,
    failure_reason: Option<String>,
    poll_attempts: i32,
    last_polled_at: Option<DateTime<Utc>>,
    next_poll_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> StoreResult<Transaction> {
        Ok(Transaction {
            gateway: self
                .gateway
                .parse()
                .map_err(StoreError::Internal)?,
            status: self.status.parse().map_err(StoreError::Internal)?,
            transaction_id: self.transaction_id,
            order_id: self.order_id,
            amount: self.amount,
            currency: self.currency,
            gateway_transaction_id: self.gateway_transaction_id,
            gateway_response: self.gateway_response,
            failure_reason: self.failure_reason,
            poll_attempts: self.poll_attempts,
            last_polled_at: self.last_polled_at,
            next_poll_at: self.next_poll_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RefundRow {
    refund_id: String,
    transaction_id: String,
    amount: BigDecimal,
    reason: String,
    status: String,
    gateway_refund_id: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RefundRow {
    fn into_domain(self) -> StoreResult<Refund> {
        Ok(Refund {
            status: self.status.parse().map_err(StoreError::Internal)?,
            refund_id: self.refund_id,
            transaction_id: self.transaction_id,
            amount: self.amount,
            reason: self.reason,
            gateway_refund_id: self.gateway_refund_id,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    order_id: Uuid,
    customer_id: Uuid,
    total_amount: BigDecimal,
    currency: String,
    payment_status: String,
}

impl OrderRow {
    fn into_domain(self) -> StoreResult<OrderSummary> {
        Ok(OrderSummary {
            payment_status: self
                .payment_status
                .parse()
                .map_err(StoreError::Internal)?,
            order_id: self.order_id,
            customer_id: self.customer_id,
            total_amount: self.total_amount,
            currency: self.currency,
        })
    }
}
