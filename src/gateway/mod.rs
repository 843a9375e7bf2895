//! Gateway adapter port. The engine talks to payment providers only through
//! `GatewayAdapter`; adapters do network I/O and signature checks, never
//! persistence.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ContactInfo, Gateway, RefundStatus, TransactionStatus};

pub mod hosted_checkout;
pub mod mock;

pub use hosted_checkout::HostedCheckoutGateway;
pub use mock::MockGateway;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// The gateway could not be reached or answered ambiguously (timeout,
    /// 5xx, open circuit). The same request may succeed on retry and the
    /// remote side may or may not have acted on it.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// The gateway understood and rejected the request. Retrying the same
    /// request will fail the same way.
    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Why an inbound callback could not be trusted. Unverifiable callbacks are
/// acknowledged and dropped, never applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("callback signature header missing")]
    MissingSignature,

    #[error("callback signature mismatch")]
    InvalidSignature,

    #[error("malformed callback payload: {0}")]
    Malformed(String),
}

/// Status reported by the remote gateway for a payment or refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Pending,
    Completed,
    Failed,
}

impl GatewayStatus {
    /// Terminal transaction status this maps to; `None` while still pending.
    pub fn as_transaction_status(&self) -> Option<TransactionStatus> {
        match self {
            GatewayStatus::Pending => None,
            GatewayStatus::Completed => Some(TransactionStatus::Completed),
            GatewayStatus::Failed => Some(TransactionStatus::Failed),
        }
    }

    pub fn as_refund_status(&self) -> RefundStatus {
        match self {
            GatewayStatus::Pending => RefundStatus::Pending,
            GatewayStatus::Completed => RefundStatus::Completed,
            GatewayStatus::Failed => RefundStatus::Failed,
        }
    }
}

/// Everything a gateway needs to open a hosted checkout session.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub transaction_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    /// Opaque customer reference forwarded to the gateway.
    pub customer_ref: String,
    /// Where the gateway sends the customer after checkout.
    pub return_url: String,
    /// Where the gateway posts the server-to-server result.
    pub callback_url: String,
    pub contact: ContactInfo,
}

/// A successfully created hosted checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    /// Hosted payment page the customer is redirected to.
    pub redirect_url: String,
    /// The gateway's own reference, when it is known at creation time.
    pub gateway_session_id: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    /// Locally minted id, also sent to the gateway as its idempotency key.
    pub refund_id: String,
    pub transaction_id: String,
    pub gateway_transaction_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub gateway_refund_id: Option<String>,
    pub status: GatewayStatus,
}

/// A verified, parsed gateway result — from a signed callback or a status
/// poll. The only shape the engine ever applies.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCallback {
    pub transaction_id: String,
    pub gateway_transaction_id: Option<String>,
    pub status: GatewayStatus,
    pub message: Option<String>,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn id(&self) -> Gateway;

    /// Open a checkout session for a transaction that is already persisted
    /// locally. Callers must not re-invoke this after a first success for
    /// the same `transaction_id`.
    async fn create_payment(&self, request: &PaymentRequest)
        -> Result<CheckoutSession, GatewayError>;

    /// Verify the integrity of an inbound callback and parse it. Pure:
    /// no I/O, fails closed on any signature or shape problem.
    fn verify_callback(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<ParsedCallback, VerificationError>;

    /// Query the gateway for the current status of a payment.
    async fn poll_status(&self, transaction_id: &str) -> Result<ParsedCallback, GatewayError>;

    async fn initiate_refund(&self, request: &RefundRequest)
        -> Result<RefundOutcome, GatewayError>;
}
