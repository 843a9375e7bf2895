//! Scriptable gateway double for test suites and local development.
//! Outcomes are consumed from per-operation queues; when a queue is empty the
//! mock answers with a benign default (session created, payment pending,
//! refund completed).

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    CheckoutSession, GatewayAdapter, GatewayError, GatewayStatus, ParsedCallback, PaymentRequest,
    RefundOutcome, RefundRequest, VerificationError,
};
use crate::domain::Gateway;

/// Signature value `verify_callback` accepts.
pub const VALID_SIGNATURE: &str = "valid-signature";
/// Header the mock reads the signature from.
pub const SIGNATURE_HEADER: &str = "x-callback-signature";

#[derive(Default)]
struct Script {
    create_results: VecDeque<Result<CheckoutSession, GatewayError>>,
    poll_results: VecDeque<Result<ParsedCallback, GatewayError>>,
    refund_results: VecDeque<Result<RefundOutcome, GatewayError>>,
}

#[derive(Default)]
pub struct MockGateway {
    script: Mutex<Script>,
    create_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue_create(&self, result: Result<CheckoutSession, GatewayError>) {
        self.script().create_results.push_back(result);
    }

    pub fn enqueue_poll(&self, result: Result<ParsedCallback, GatewayError>) {
        self.script().poll_results.push_back(result);
    }

    pub fn enqueue_refund(&self, result: Result<RefundOutcome, GatewayError>) {
        self.script().refund_results.push_back(result);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayAdapter for MockGateway {
    fn id(&self) -> Gateway {
        Gateway::HostedCheckout
    }

    async fn create_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.script().create_results.pop_front() {
            return result;
        }
        Ok(CheckoutSession {
            redirect_url: format!("https://pay.mock/session/{}", request.transaction_id),
            gateway_session_id: Some(format!("mock-sess-{}", request.transaction_id)),
            raw: json!({"mock": true, "reference": request.transaction_id}),
        })
    }

    fn verify_callback(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<ParsedCallback, VerificationError> {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(VerificationError::MissingSignature)?;
        if provided != VALID_SIGNATURE {
            return Err(VerificationError::InvalidSignature);
        }

        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;
        let payload: MockCallbackPayload = serde_json::from_value(raw.clone())
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;

        Ok(ParsedCallback {
            transaction_id: payload.transaction_id,
            gateway_transaction_id: payload.gateway_transaction_id,
            status: payload.status,
            message: payload.message,
            raw,
        })
    }

    async fn poll_status(&self, transaction_id: &str) -> Result<ParsedCallback, GatewayError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.script().poll_results.pop_front() {
            return result;
        }
        Ok(ParsedCallback {
            transaction_id: transaction_id.to_string(),
            gateway_transaction_id: None,
            status: GatewayStatus::Pending,
            message: None,
            raw: json!({"mock": true, "status": "pending"}),
        })
    }

    async fn initiate_refund(
        &self,
        request: &RefundRequest,
    ) -> Result<RefundOutcome, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.script().refund_results.pop_front() {
            return result;
        }
        Ok(RefundOutcome {
            gateway_refund_id: Some(format!("mock-rfd-{}", request.refund_id)),
            status: GatewayStatus::Completed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MockCallbackPayload {
    transaction_id: String,
    #[serde(default)]
    gateway_transaction_id: Option<String>,
    status: GatewayStatus,
    #[serde(default)]
    message: Option<String>,
}
