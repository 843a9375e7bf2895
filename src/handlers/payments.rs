use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::AppState;
use crate::domain::{ContactInfo, Refund, RefundStatus, Transaction, TransactionStatus};
use crate::error::AppError;
use crate::middleware::auth::Caller;
use crate::validation;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreatePaymentRequest {
    pub order_id: Uuid,
    #[serde(default)]
    pub customer_contact: Option<ContactPayload>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ContactPayload {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl From<ContactPayload> for ContactInfo {
    fn from(payload: ContactPayload) -> Self {
        ContactInfo {
            email: payload.email,
            phone: payload.phone,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentCreated {
    pub transaction_id: String,
    /// Hosted checkout page to send the customer to.
    pub redirect_url: String,
    #[schema(value_type = String, example = "499.00")]
    pub amount: BigDecimal,
    pub currency: String,
    pub status: TransactionStatus,
}

/// Storefront-safe projection of a transaction. The raw gateway payload and
/// the gateway's own reference are operator-only and omitted for customers.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionView {
    pub transaction_id: String,
    pub order_id: Uuid,
    pub status: TransactionStatus,
    #[schema(value_type = String, example = "499.00")]
    pub amount: BigDecimal,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub gateway_response: Option<serde_json::Value>,
}

impl TransactionView {
    pub fn for_caller(tx: Transaction, caller: &Caller) -> Self {
        let operator = caller.is_operator();
        Self {
            transaction_id: tx.transaction_id,
            order_id: tx.order_id,
            status: tx.status,
            amount: tx.amount,
            currency: tx.currency,
            failure_reason: tx.failure_reason,
            created_at: tx.created_at,
            updated_at: tx.updated_at,
            gateway_transaction_id: if operator { tx.gateway_transaction_id } else { None },
            gateway_response: if operator { tx.gateway_response } else { None },
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RefundCreateRequest {
    #[schema(value_type = String, example = "120.00")]
    pub amount: BigDecimal,
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefundView {
    pub refund_id: String,
    pub transaction_id: String,
    #[schema(value_type = String, example = "120.00")]
    pub amount: BigDecimal,
    pub reason: String,
    pub status: RefundStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_refund_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Refund> for RefundView {
    fn from(refund: Refund) -> Self {
        Self {
            refund_id: refund.refund_id,
            transaction_id: refund.transaction_id,
            amount: refund.amount,
            reason: refund.reason,
            status: refund.status,
            gateway_refund_id: refund.gateway_refund_id,
            failure_reason: refund.failure_reason,
            created_at: refund.created_at,
            updated_at: refund.updated_at,
        }
    }
}

#[utoipa::path(
    post,
    path = "/payments",
    request_body = CreatePaymentRequest,
    responses(
        (status = 201, description = "Checkout session opened", body = PaymentCreated),
        (status = 403, description = "Order belongs to another customer"),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Order is already paid"),
        (status = 502, description = "Gateway rejected the request"),
        (status = 503, description = "Gateway unavailable, retry later")
    ),
    tag = "Payments"
)]
pub async fn create_payment(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreatePaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let contact = payload.customer_contact.unwrap_or_default().into();
    let created = state
        .engine
        .create_payment(&caller, payload.order_id, contact)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PaymentCreated {
            transaction_id: created.transaction.transaction_id,
            redirect_url: created.redirect_url,
            amount: created.transaction.amount,
            currency: created.transaction.currency,
            status: created.transaction.status,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/payments/{transaction_id}",
    params(
        ("transaction_id" = String, Path, description = "Transaction reference")
    ),
    responses(
        (status = 200, description = "Current transaction state", body = TransactionView),
        (status = 403, description = "Transaction belongs to another customer"),
        (status = 404, description = "Unknown transaction")
    ),
    tag = "Payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    caller: Caller,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionView>, AppError> {
    validation::validate_transaction_ref("transaction_id", &transaction_id)?;

    let tx = state.engine.payment_status(&caller, &transaction_id).await?;
    Ok(Json(TransactionView::for_caller(tx, &caller)))
}

#[utoipa::path(
    post,
    path = "/payments/{transaction_id}/refunds",
    params(
        ("transaction_id" = String, Path, description = "Parent transaction reference")
    ),
    request_body = RefundCreateRequest,
    responses(
        (status = 201, description = "Refund raised", body = RefundView),
        (status = 403, description = "Operator access required"),
        (status = 404, description = "Unknown transaction"),
        (status = 409, description = "Parent not completed or refund bound exceeded")
    ),
    tag = "Payments"
)]
pub async fn create_refund(
    State(state): State<AppState>,
    caller: Caller,
    Path(transaction_id): Path<String>,
    Json(payload): Json<RefundCreateRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_transaction_ref("transaction_id", &transaction_id)?;

    let refund = state
        .engine
        .request_refund(&caller, &transaction_id, payload.amount, payload.reason)
        .await?;

    Ok((StatusCode::CREATED, Json(RefundView::from(refund))))
}

#[utoipa::path(
    get,
    path = "/payments/{transaction_id}/refunds",
    params(
        ("transaction_id" = String, Path, description = "Parent transaction reference")
    ),
    responses(
        (status = 200, description = "Refunds for the transaction", body = [RefundView]),
        (status = 403, description = "Operator access required"),
        (status = 404, description = "Unknown transaction")
    ),
    tag = "Payments"
)]
pub async fn list_refunds(
    State(state): State<AppState>,
    caller: Caller,
    Path(transaction_id): Path<String>,
) -> Result<Json<Vec<RefundView>>, AppError> {
    validation::validate_transaction_ref("transaction_id", &transaction_id)?;

    let refunds = state.engine.list_refunds(&caller, &transaction_id).await?;
    Ok(Json(refunds.into_iter().map(RefundView::from).collect()))
}
