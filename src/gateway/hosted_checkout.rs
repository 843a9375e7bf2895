//! Hosted-checkout gateway adapter.
//! Drives a provider that hosts the payment page itself: we open a session,
//! redirect the customer, and receive the result as an HMAC-signed callback.

use async_trait::async_trait;
use axum::http::HeaderMap;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{Config, Error as FailsafeError, StateMachine, backoff, failure_policy};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use super::{
    CheckoutSession, GatewayAdapter, GatewayError, GatewayStatus, ParsedCallback, PaymentRequest,
    RefundOutcome, RefundRequest, VerificationError,
};
use crate::domain::Gateway;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the exact payload bytes.
pub const SIGNATURE_HEADER: &str = "x-checkout-signature";
pub const MERCHANT_HEADER: &str = "x-merchant-id";

/// Signed client for a hosted-checkout payment provider.
#[derive(Clone)]
pub struct HostedCheckoutGateway {
    client: Client,
    base_url: String,
    merchant_id: String,
    secret: String,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl HostedCheckoutGateway {
    pub fn new(base_url: String, merchant_id: String, secret: String, timeout: Duration) -> Self {
        Self::with_circuit_breaker(base_url, merchant_id, secret, timeout, 3, 60)
    }

    /// Creates a gateway client with custom circuit breaker configuration.
    pub fn with_circuit_breaker(
        base_url: String,
        merchant_id: String,
        secret: String,
        timeout: Duration,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        HostedCheckoutGateway {
            client,
            base_url,
            merchant_id,
            secret,
            circuit_breaker,
        }
    }

    /// Returns the current state of the circuit breaker.
    pub fn circuit_state(&self) -> &'static str {
        if self.circuit_breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail.
        HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key length")
    }

    fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl GatewayAdapter for HostedCheckoutGateway {
    fn id(&self) -> Gateway {
        Gateway::HostedCheckout
    }

    async fn create_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let body = CreateSessionBody {
            reference: &request.transaction_id,
            amount: wire_amount(&request.amount),
            currency: &request.currency,
            customer_ref: &request.customer_ref,
            return_url: &request.return_url,
            callback_url: &request.callback_url,
            email: request.contact.email.as_deref(),
            phone: request.contact.phone.as_deref(),
        };
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| GatewayError::Permanent(format!("request encoding failed: {e}")))?;
        let signature = self.sign(&bytes);
        let url = self.endpoint("/v1/checkout/sessions");
        let client = self.client.clone();
        let merchant = self.merchant_id.clone();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client
                    .post(&url)
                    .header("content-type", "application/json")
                    .header(SIGNATURE_HEADER, signature)
                    .header(MERCHANT_HEADER, merchant)
                    .body(bytes)
                    .send()
                    .await
                    .map_err(transport_error)?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, &text));
                }

                let raw: serde_json::Value = response.json().await.map_err(decode_error)?;
                let session: SessionResponse =
                    serde_json::from_value(raw.clone()).map_err(decode_error)?;

                Ok(CheckoutSession {
                    redirect_url: session.checkout_url,
                    gateway_session_id: session.session_id,
                    raw,
                })
            })
            .await;

        match result {
            Ok(session) => Ok(session),
            Err(FailsafeError::Rejected) => Err(GatewayError::Transient(
                "gateway circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
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

        let sig_bytes =
            hex::decode(provided.trim()).map_err(|_| VerificationError::InvalidSignature)?;

        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&sig_bytes)
            .map_err(|_| VerificationError::InvalidSignature)?;

        // Only parsed after the signature held.
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;
        let payload: CallbackPayload = serde_json::from_value(raw.clone())
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;

        Ok(ParsedCallback {
            transaction_id: payload.reference,
            gateway_transaction_id: payload.gateway_transaction_id,
            status: payload.status,
            message: payload.message,
            raw,
        })
    }

    async fn poll_status(&self, transaction_id: &str) -> Result<ParsedCallback, GatewayError> {
        let url = self.endpoint(&format!("/v1/checkout/payments/{transaction_id}"));
        let signature = self.sign(transaction_id.as_bytes());
        let client = self.client.clone();
        let merchant = self.merchant_id.clone();
        let reference = transaction_id.to_string();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client
                    .get(&url)
                    .header(SIGNATURE_HEADER, signature)
                    .header(MERCHANT_HEADER, merchant)
                    .send()
                    .await
                    .map_err(transport_error)?;

                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(GatewayError::Permanent(format!(
                        "gateway has no payment {reference}"
                    )));
                }
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, &text));
                }

                let raw: serde_json::Value = response.json().await.map_err(decode_error)?;
                let parsed: StatusResponse =
                    serde_json::from_value(raw.clone()).map_err(decode_error)?;
                if parsed.reference != reference {
                    return Err(GatewayError::Permanent(format!(
                        "gateway answered for {} while polling {reference}",
                        parsed.reference
                    )));
                }

                Ok(ParsedCallback {
                    transaction_id: parsed.reference,
                    gateway_transaction_id: parsed.gateway_transaction_id,
                    status: parsed.status,
                    message: parsed.message,
                    raw,
                })
            })
            .await;

        match result {
            Ok(parsed) => Ok(parsed),
            Err(FailsafeError::Rejected) => Err(GatewayError::Transient(
                "gateway circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    async fn initiate_refund(
        &self,
        request: &RefundRequest,
    ) -> Result<RefundOutcome, GatewayError> {
        let body = RefundBody {
            refund_reference: &request.refund_id,
            payment_reference: &request.transaction_id,
            gateway_transaction_id: request.gateway_transaction_id.as_deref(),
            amount: wire_amount(&request.amount),
            currency: &request.currency,
            reason: &request.reason,
        };
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| GatewayError::Permanent(format!("request encoding failed: {e}")))?;
        let signature = self.sign(&bytes);
        let url = self.endpoint("/v1/checkout/refunds");
        let client = self.client.clone();
        let merchant = self.merchant_id.clone();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client
                    .post(&url)
                    .header("content-type", "application/json")
                    .header(SIGNATURE_HEADER, signature)
                    .header(MERCHANT_HEADER, merchant)
                    .body(bytes)
                    .send()
                    .await
                    .map_err(transport_error)?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, &text));
                }

                let parsed: RefundResponse = response.json().await.map_err(decode_error)?;
                Ok(RefundOutcome {
                    gateway_refund_id: parsed.refund_id,
                    status: parsed.status,
                })
            })
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(FailsafeError::Rejected) => Err(GatewayError::Transient(
                "gateway circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

/// Amounts travel as scale-2 decimal strings.
fn wire_amount(amount: &bigdecimal::BigDecimal) -> String {
    amount.with_scale(2).to_string()
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    GatewayError::Transient(format!("gateway unreachable: {err}"))
}

fn decode_error(err: impl std::fmt::Display) -> GatewayError {
    // A 2xx with an unreadable body is ambiguous; a retry may see it intact.
    GatewayError::Transient(format!("gateway response unreadable: {err}"))
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> GatewayError {
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        GatewayError::Transient(format!("gateway returned {status}: {body}"))
    } else {
        GatewayError::Permanent(format!("gateway returned {status}: {body}"))
    }
}

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    reference: &'a str,
    amount: String,
    currency: &'a str,
    customer_ref: &'a str,
    return_url: &'a str,
    callback_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    checkout_url: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    reference: String,
    #[serde(default)]
    gateway_transaction_id: Option<String>,
    status: GatewayStatus,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackPayload {
    reference: String,
    #[serde(default)]
    gateway_transaction_id: Option<String>,
    status: GatewayStatus,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefundBody<'a> {
    refund_reference: &'a str,
    payment_reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway_transaction_id: Option<&'a str>,
    amount: String,
    currency: &'a str,
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    #[serde(default)]
    refund_id: Option<String>,
    status: GatewayStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContactInfo;

    fn test_gateway(base_url: String) -> HostedCheckoutGateway {
        HostedCheckoutGateway::new(
            base_url,
            "merchant-1".to_string(),
            "test-secret".to_string(),
            Duration::from_secs(2),
        )
    }

    fn payment_request() -> PaymentRequest {
        PaymentRequest {
            transaction_id: "txn_0001".to_string(),
            amount: "499.00".parse().unwrap(),
            currency: "INR".to_string(),
            customer_ref: "cust-42".to_string(),
            return_url: "https://shop.example/checkout/complete".to_string(),
            callback_url: "https://shop.example/callbacks/hosted-checkout".to_string(),
            contact: ContactInfo {
                email: Some("buyer@example.com".to_string()),
                phone: None,
            },
        }
    }

    fn sign_with(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn wire_amount_is_scale_two() {
        assert_eq!(wire_amount(&"499".parse().unwrap()), "499.00");
        assert_eq!(wire_amount(&"12.5".parse().unwrap()), "12.50");
        assert_eq!(wire_amount(&"0.99".parse().unwrap()), "0.99");
    }

    #[tokio::test]
    async fn test_create_payment_success() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/checkout/sessions")
            .match_header(
                SIGNATURE_HEADER,
                mockito::Matcher::Regex("^[0-9a-f]{64}$".to_string()),
            )
            .match_header(MERCHANT_HEADER, "merchant-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"checkout_url":"https://pay.example/s/abc","session_id":"sess_abc"}"#,
            )
            .create_async()
            .await;

        let gateway = test_gateway(server.url());
        let session = gateway.create_payment(&payment_request()).await.unwrap();

        assert_eq!(session.redirect_url, "https://pay.example/s/abc");
        assert_eq!(session.gateway_session_id.as_deref(), Some("sess_abc"));
    }

    #[tokio::test]
    async fn test_create_payment_client_error_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/checkout/sessions")
            .with_status(422)
            .with_body(r#"{"error":"unsupported currency"}"#)
            .create_async()
            .await;

        let gateway = test_gateway(server.url());
        let err = gateway.create_payment(&payment_request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_create_payment_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/checkout/sessions")
            .with_status(503)
            .create_async()
            .await;

        let gateway = test_gateway(server.url());
        let err = gateway.create_payment(&payment_request()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_poll_status_completed() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/checkout/payments/txn_0001")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"reference":"txn_0001","gateway_transaction_id":"gw-9","status":"completed"}"#,
            )
            .create_async()
            .await;

        let gateway = test_gateway(server.url());
        let parsed = gateway.poll_status("txn_0001").await.unwrap();

        assert_eq!(parsed.transaction_id, "txn_0001");
        assert_eq!(parsed.status, GatewayStatus::Completed);
        assert_eq!(parsed.gateway_transaction_id.as_deref(), Some("gw-9"));
    }

    #[tokio::test]
    async fn test_poll_status_unknown_reference_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/checkout/payments/txn_missing")
            .with_status(404)
            .create_async()
            .await;

        let gateway = test_gateway(server.url());
        let err = gateway.poll_status("txn_missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_poll_status_reference_mismatch_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/checkout/payments/txn_0001")
            .with_status(200)
            .with_body(r#"{"reference":"txn_other","status":"completed"}"#)
            .create_async()
            .await;

        let gateway = test_gateway(server.url());
        let err = gateway.poll_status("txn_0001").await.unwrap_err();
        assert!(matches!(err, GatewayError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_initiate_refund_success() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/checkout/refunds")
            .match_header(
                SIGNATURE_HEADER,
                mockito::Matcher::Regex("^[0-9a-f]{64}$".to_string()),
            )
            .with_status(200)
            .with_body(r#"{"refund_id":"gwrfd-1","status":"completed"}"#)
            .create_async()
            .await;

        let gateway = test_gateway(server.url());
        let outcome = gateway
            .initiate_refund(&RefundRequest {
                refund_id: "rfd_0001".to_string(),
                transaction_id: "txn_0001".to_string(),
                gateway_transaction_id: Some("gw-9".to_string()),
                amount: "120.00".parse().unwrap(),
                currency: "INR".to_string(),
                reason: "damaged item".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.gateway_refund_id.as_deref(), Some("gwrfd-1"));
        assert_eq!(outcome.status, GatewayStatus::Completed);
    }

    #[test]
    fn test_verify_callback_accepts_signed_body() {
        let gateway = test_gateway("https://pay.example".to_string());
        let body =
            br#"{"reference":"txn_0001","gateway_transaction_id":"gw-9","status":"completed"}"#;
        let sig = sign_with("test-secret", body);

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());

        let parsed = gateway.verify_callback(body, &headers).unwrap();
        assert_eq!(parsed.transaction_id, "txn_0001");
        assert_eq!(parsed.status, GatewayStatus::Completed);
    }

    #[test]
    fn test_verify_callback_rejects_wrong_secret() {
        let gateway = test_gateway("https://pay.example".to_string());
        let body = br#"{"reference":"txn_0001","status":"completed"}"#;
        let sig = sign_with("other-secret", body);

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());

        assert_eq!(
            gateway.verify_callback(body, &headers),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_callback_rejects_missing_header() {
        let gateway = test_gateway("https://pay.example".to_string());
        let body = br#"{"reference":"txn_0001","status":"completed"}"#;

        assert_eq!(
            gateway.verify_callback(body, &HeaderMap::new()),
            Err(VerificationError::MissingSignature)
        );
    }

    #[test]
    fn test_verify_callback_rejects_tampered_body() {
        let gateway = test_gateway("https://pay.example".to_string());
        let body = br#"{"reference":"txn_0001","status":"completed"}"#;
        let sig = sign_with("test-secret", body);

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());

        let tampered = br#"{"reference":"txn_0001","status":"failed"}"#;
        assert_eq!(
            gateway.verify_callback(tampered, &headers),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_callback_flags_malformed_payload() {
        let gateway = test_gateway("https://pay.example".to_string());
        let body = b"not json";
        let sig = sign_with("test-secret", body);

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());

        assert!(matches!(
            gateway.verify_callback(body, &headers),
            Err(VerificationError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Regex(r"/v1/checkout/payments/.*".to_string()))
            .with_status(500)
            .expect_at_least(3)
            .create_async()
            .await;

        let gateway = HostedCheckoutGateway::with_circuit_breaker(
            server.url(),
            "merchant-1".to_string(),
            "test-secret".to_string(),
            Duration::from_secs(2),
            3,
            30,
        );

        for _ in 0..3 {
            let _ = gateway.poll_status("txn_0001").await;
        }

        assert_eq!(gateway.circuit_state(), "open");
        let err = gateway.poll_status("txn_0001").await.unwrap_err();
        assert!(err.is_transient());
    }
}
