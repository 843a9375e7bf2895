pub mod callback;
pub mod payments;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub db: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthStatus),
        (status = 503, description = "Service is unhealthy", body = HealthStatus)
    ),
    tag = "Health"
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_status = match state.store.ping().await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };

    let health_response = HealthStatus {
        status: if db_status == "connected" {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        db: db_status.to_string(),
    };

    let status_code = if db_status == "connected" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health_response))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        payments::create_payment,
        payments::get_payment,
        payments::create_refund,
        payments::list_refunds,
        callback::hosted_checkout,
    ),
    components(schemas(
        HealthStatus,
        payments::CreatePaymentRequest,
        payments::ContactPayload,
        payments::PaymentCreated,
        payments::TransactionView,
        payments::RefundCreateRequest,
        payments::RefundView,
        callback::CallbackAck,
        crate::domain::Gateway,
        crate::domain::TransactionStatus,
        crate::domain::RefundStatus,
    )),
    tags(
        (name = "Health", description = "Service health"),
        (name = "Payments", description = "Payment transactions and refunds"),
        (name = "Callbacks", description = "Inbound gateway notifications")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
