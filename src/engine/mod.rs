//! Reconciliation engine. Every status transition in the system funnels
//! through `apply_gateway_result`, whose store-level compare-and-set is what
//! keeps settlement exactly-once no matter how many times the gateway
//! delivers the same result.

pub mod reconciler;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{
    ContactInfo, OrderPaymentStatus, Refund, RefundStatus, Transaction, TransactionStatus,
};
use crate::error::AppError;
use crate::gateway::{CheckoutSession, GatewayAdapter, GatewayError, ParsedCallback,
    PaymentRequest, RefundRequest};
use crate::middleware::auth::Caller;
use crate::ports::{OrderLedger, SettlementUpdate, TransactionStore};
use crate::validation;

/// Tunables the engine reads per operation. Defaults match the documented
/// environment defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum spacing between polls of one transaction; also the base of
    /// the poll backoff and the delay before the first scheduled poll.
    pub poll_interval: Duration,
    pub max_poll_attempts: i32,
    pub max_poll_backoff: Duration,
    /// Wall-clock budget after which a silent transaction stops being
    /// polled and waits for an operator.
    pub max_poll_window: Duration,
    pub gateway_retry_attempts: u32,
    pub gateway_retry_base_ms: u64,
    /// Where the gateway sends the customer after checkout.
    pub return_url: String,
    /// Where the gateway posts server-to-server results.
    pub callback_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::seconds(30),
            max_poll_attempts: 10,
            max_poll_backoff: Duration::seconds(600),
            max_poll_window: Duration::seconds(21_600),
            gateway_retry_attempts: 3,
            gateway_retry_base_ms: 200,
            return_url: "http://localhost:3000/checkout/complete".to_string(),
            callback_url: "http://localhost:3000/callbacks/hosted-checkout".to_string(),
        }
    }
}

/// What applying a gateway result did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// This call performed the PENDING -> terminal transition (and notified
    /// the order ledger).
    Settled(TransactionStatus),
    /// The transaction was already terminal; only the audit snapshot moved.
    AlreadyTerminal,
    /// The gateway still reports the payment as in flight.
    StillPending,
}

#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub transaction: Transaction,
    pub redirect_url: String,
}

pub struct ReconciliationEngine {
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn OrderLedger>,
    gateway: Arc<dyn GatewayAdapter>,
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        ledger: Arc<dyn OrderLedger>,
        gateway: Arc<dyn GatewayAdapter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
            config,
        }
    }

    /// Create a payment transaction for an order and open a checkout session.
    ///
    /// The PENDING row is persisted before the first gateway byte goes out,
    /// so a crash mid-call leaves a record the poll path can reconcile. On a
    /// permanent gateway rejection the transaction fails immediately; on
    /// exhausted transient errors it stays PENDING and the caller is told to
    /// retry later.
    pub async fn create_payment(
        &self,
        caller: &Caller,
        order_id: Uuid,
        contact: ContactInfo,
    ) -> Result<CreatedPayment, AppError> {
        let order = self
            .ledger
            .find_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;

        if !caller.can_access_order(&order) {
            return Err(AppError::Forbidden(
                "order belongs to another customer".to_string(),
            ));
        }
        if order.payment_status == OrderPaymentStatus::Paid {
            return Err(AppError::Conflict(format!("order {order_id} is already paid")));
        }
        validation::validate_positive_amount(&order.total_amount)?;
        validation::validate_currency(&order.currency)?;
        validation::validate_contact(&contact)?;

        let mut tx = Transaction::new(
            order_id,
            self.gateway.id(),
            order.total_amount.clone(),
            order.currency.clone(),
        );
        tx.next_poll_at = Some(Utc::now() + self.config.poll_interval);
        self.store.insert(&tx).await?;

        info!(
            transaction_id = %tx.transaction_id,
            order_id = %order_id,
            amount = %tx.amount,
            currency = %tx.currency,
            "payment transaction created"
        );

        let request = PaymentRequest {
            transaction_id: tx.transaction_id.clone(),
            amount: tx.amount.clone(),
            currency: tx.currency.clone(),
            customer_ref: order.customer_id.to_string(),
            return_url: self.config.return_url.clone(),
            callback_url: self.config.callback_url.clone(),
            contact,
        };

        match self.create_session_with_retry(&request).await {
            Ok(session) => {
                self.store
                    .record_gateway_response(
                        &tx.transaction_id,
                        session.gateway_session_id.as_deref(),
                        &session.raw,
                    )
                    .await?;
                let transaction = self
                    .store
                    .find_by_transaction_id(&tx.transaction_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(format!(
                            "transaction {} missing after insert",
                            tx.transaction_id
                        ))
                    })?;
                Ok(CreatedPayment {
                    transaction,
                    redirect_url: session.redirect_url,
                })
            }
            Err(err) if err.is_transient() => {
                warn!(
                    "gateway unreachable creating session for {}: {}; transaction stays pending",
                    tx.transaction_id, err
                );
                Err(err.into())
            }
            Err(err) => {
                // Rejected outright: fail this transaction, the order itself
                // stays open for a fresh attempt.
                let update = SettlementUpdate {
                    transaction_id: tx.transaction_id.clone(),
                    expected: TransactionStatus::Pending,
                    new_status: TransactionStatus::Failed,
                    gateway_transaction_id: None,
                    gateway_response: None,
                    failure_reason: Some(err.to_string()),
                };
                self.store.compare_and_set_status(update).await?;
                warn!("gateway rejected session for {}: {}", tx.transaction_id, err);
                Err(err.into())
            }
        }
    }

    async fn create_session_with_retry(
        &self,
        request: &PaymentRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.gateway.create_payment(request).await {
                Ok(session) => return Ok(session),
                Err(err) if err.is_transient() && attempt < self.config.gateway_retry_attempts => {
                    let delay = self.config.gateway_retry_base_ms * (1 << (attempt - 1));
                    warn!(
                        "create session attempt {} for {} failed: {}; retrying in {}ms",
                        attempt, request.transaction_id, err, delay
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Apply a verified gateway result, from either the callback or the poll
    /// path. The order ledger is notified iff this call performed the
    /// transition, so redeliveries and poll/callback races settle exactly
    /// once. The first terminal result to arrive wins; a later conflicting
    /// one is a no-op.
    pub async fn apply_gateway_result(
        &self,
        parsed: &ParsedCallback,
    ) -> Result<ApplyOutcome, AppError> {
        let tx = match self
            .store
            .find_by_transaction_id(&parsed.transaction_id)
            .await?
        {
            Some(tx) => tx,
            None => {
                warn!(
                    "gateway result for unknown transaction {}; ignoring",
                    parsed.transaction_id
                );
                return Err(AppError::NotFound(format!(
                    "transaction {}",
                    parsed.transaction_id
                )));
            }
        };

        if tx.is_terminal() {
            self.store
                .record_gateway_response(
                    &tx.transaction_id,
                    parsed.gateway_transaction_id.as_deref(),
                    &parsed.raw,
                )
                .await?;
            return Ok(ApplyOutcome::AlreadyTerminal);
        }

        let new_status = match parsed.status.as_transaction_status() {
            Some(status) => status,
            None => {
                self.store
                    .record_gateway_response(
                        &tx.transaction_id,
                        parsed.gateway_transaction_id.as_deref(),
                        &parsed.raw,
                    )
                    .await?;
                return Ok(ApplyOutcome::StillPending);
            }
        };

        let failure_reason = match new_status {
            TransactionStatus::Failed => Some(
                parsed
                    .message
                    .clone()
                    .unwrap_or_else(|| "payment failed at gateway".to_string()),
            ),
            _ => None,
        };

        let update = SettlementUpdate {
            transaction_id: tx.transaction_id.clone(),
            expected: TransactionStatus::Pending,
            new_status,
            gateway_transaction_id: parsed.gateway_transaction_id.clone(),
            gateway_response: Some(parsed.raw.clone()),
            failure_reason,
        };

        if self.store.compare_and_set_status(update).await? {
            info!(
                transaction_id = %tx.transaction_id,
                order_id = %tx.order_id,
                status = %new_status,
                "transaction settled"
            );
            if let Err(e) = self
                .ledger
                .on_transaction_settled(tx.order_id, new_status)
                .await
            {
                // The settlement stands; the order row needs an operator.
                error!(
                    "order ledger update failed for {} (order {}): {}",
                    tx.transaction_id, tx.order_id, e
                );
            }
            return Ok(ApplyOutcome::Settled(new_status));
        }

        // Lost the race: some other delivery settled this transaction first.
        match self
            .store
            .find_by_transaction_id(&tx.transaction_id)
            .await?
        {
            Some(current) if current.is_terminal() => Ok(ApplyOutcome::AlreadyTerminal),
            _ => Err(AppError::Internal(format!(
                "conditional settle of {} applied nothing",
                tx.transaction_id
            ))),
        }
    }

    /// Poll the gateway for one transaction. The attempt is recorded before
    /// the remote call so a crash mid-poll still consumed it. Poll failures
    /// of either class never fail the transaction.
    pub async fn poll_once(
        &self,
        transaction_id: &str,
        force: bool,
    ) -> Result<ApplyOutcome, AppError> {
        let tx = self
            .store
            .find_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transaction {transaction_id}")))?;

        if tx.is_terminal() {
            return Ok(ApplyOutcome::AlreadyTerminal);
        }

        let now = Utc::now();
        if !force && !poll_due(&tx, now) {
            return Ok(ApplyOutcome::StillPending);
        }

        let attempts = tx.poll_attempts + 1;
        let next = next_poll_at(&self.config, &tx, attempts, now);
        if next.is_none() {
            warn!(
                "transaction {} exhausted its poll budget after {} attempts; left pending for manual reconciliation",
                tx.transaction_id, attempts
            );
        }
        self.store
            .record_poll_attempt(transaction_id, now, next)
            .await?;

        let parsed = match self.gateway.poll_status(transaction_id).await {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("status poll for {} failed: {}", transaction_id, err);
                return Ok(ApplyOutcome::StillPending);
            }
        };

        self.apply_gateway_result(&parsed).await
    }

    /// Ownership-checked status projection. A pending transaction whose poll
    /// is due gets one best-effort inline poll so the storefront sees the
    /// freshest state the gateway will give us.
    pub async fn payment_status(
        &self,
        caller: &Caller,
        transaction_id: &str,
    ) -> Result<Transaction, AppError> {
        let tx = self
            .store
            .find_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transaction {transaction_id}")))?;

        self.authorize_transaction(caller, &tx).await?;

        if tx.status == TransactionStatus::Pending && poll_due(&tx, Utc::now()) {
            if let Err(e) = self.poll_once(transaction_id, false).await {
                warn!("inline poll for {} failed: {}", transaction_id, e);
            }
            if let Some(fresh) = self.store.find_by_transaction_id(transaction_id).await? {
                return Ok(fresh);
            }
        }

        Ok(tx)
    }

    async fn authorize_transaction(
        &self,
        caller: &Caller,
        tx: &Transaction,
    ) -> Result<(), AppError> {
        if caller.is_operator() {
            return Ok(());
        }
        let order = self
            .ledger
            .find_order(tx.order_id)
            .await?
            .ok_or_else(|| {
                AppError::Forbidden("transaction's order is not accessible".to_string())
            })?;
        if !caller.can_access_order(&order) {
            return Err(AppError::Forbidden(
                "transaction belongs to another customer".to_string(),
            ));
        }
        Ok(())
    }

    /// Raise a refund against a completed transaction. The refund row is
    /// reserved (PENDING) before the gateway call; the store guarantees the
    /// reserved total never exceeds the parent amount. A refund failure
    /// never touches the parent transaction.
    pub async fn request_refund(
        &self,
        caller: &Caller,
        transaction_id: &str,
        amount: BigDecimal,
        reason: String,
    ) -> Result<Refund, AppError> {
        if !caller.is_operator() {
            return Err(AppError::Forbidden(
                "refunds require operator access".to_string(),
            ));
        }
        validation::validate_positive_amount(&amount)?;
        validation::validate_refund_reason(&reason)?;
        let reason = validation::sanitize_string(&reason);

        let tx = self
            .store
            .find_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transaction {transaction_id}")))?;

        if !tx.can_refund() {
            return Err(AppError::Conflict(format!(
                "transaction {} is {} and cannot be refunded",
                tx.transaction_id, tx.status
            )));
        }

        let refund = Refund::new(tx.transaction_id.clone(), amount.clone(), reason.clone());
        self.store.insert_refund(&refund).await?;

        info!(
            refund_id = %refund.refund_id,
            transaction_id = %tx.transaction_id,
            amount = %refund.amount,
            "refund reserved"
        );

        let request = RefundRequest {
            refund_id: refund.refund_id.clone(),
            transaction_id: tx.transaction_id.clone(),
            gateway_transaction_id: tx.gateway_transaction_id.clone(),
            amount,
            currency: tx.currency.clone(),
            reason,
        };

        match self.gateway.initiate_refund(&request).await {
            Ok(outcome) => {
                self.store
                    .update_refund(
                        &refund.refund_id,
                        outcome.status.as_refund_status(),
                        outcome.gateway_refund_id.as_deref(),
                        None,
                    )
                    .await?;
            }
            Err(err) if err.is_transient() => {
                // Ambiguous: the gateway may have executed it. The
                // reservation stays until an operator resolves it.
                warn!(
                    "refund {} left pending, gateway unreachable: {}",
                    refund.refund_id, err
                );
            }
            Err(err) => {
                self.store
                    .update_refund(
                        &refund.refund_id,
                        RefundStatus::Failed,
                        None,
                        Some(&err.to_string()),
                    )
                    .await?;
                warn!("refund {} rejected by gateway: {}", refund.refund_id, err);
            }
        }

        self.store
            .find_refund(&refund.refund_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!("refund {} missing after insert", refund.refund_id))
            })
    }

    pub async fn list_refunds(
        &self,
        caller: &Caller,
        transaction_id: &str,
    ) -> Result<Vec<Refund>, AppError> {
        if !caller.is_operator() {
            return Err(AppError::Forbidden(
                "refund listings require operator access".to_string(),
            ));
        }
        if self
            .store
            .find_by_transaction_id(transaction_id)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(format!("transaction {transaction_id}")));
        }
        Ok(self.store.list_refunds(transaction_id).await?)
    }

    /// One reconciliation pass: poll every pending transaction whose
    /// schedule is due. Returns how many were polled.
    pub async fn reconcile_due(&self, batch: i64) -> Result<usize, AppError> {
        let due = self.store.list_due_for_poll(Utc::now(), batch).await?;
        let mut polled = 0usize;
        for tx in due {
            match self.poll_once(&tx.transaction_id, true).await {
                Ok(_) => polled += 1,
                Err(e) => error!("reconcile poll for {} failed: {}", tx.transaction_id, e),
            }
        }
        Ok(polled)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn poll_due(tx: &Transaction, now: DateTime<Utc>) -> bool {
    match tx.next_poll_at {
        Some(at) => at <= now,
        None => false,
    }
}

/// Schedule after the poll numbered `attempts`, or `None` once the attempt
/// or wall-clock budget is spent.
fn next_poll_at(
    config: &EngineConfig,
    tx: &Transaction,
    attempts: i32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if attempts >= config.max_poll_attempts {
        return None;
    }
    if now - tx.created_at >= config.max_poll_window {
        return None;
    }
    Some(now + poll_backoff(config, attempts))
}

/// Exponential backoff: interval doubles per attempt, capped.
fn poll_backoff(config: &EngineConfig, attempts: i32) -> Duration {
    let exp = (attempts - 1).clamp(0, 20) as u32;
    let base_secs = config.poll_interval.num_seconds().max(1);
    let secs = base_secs.saturating_mul(1i64 << exp);
    Duration::seconds(secs.min(config.max_poll_backoff.num_seconds()))
}
