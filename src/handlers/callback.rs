use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::AppState;
use crate::error::AppError;

/// Acknowledgement body every callback receives. The gateway only looks at
/// the HTTP status; `status`/`detail` are for humans reading delivery logs.
#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackAck {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CallbackAck {
    fn ok(transaction_id: String) -> Self {
        Self {
            status: "ok".to_string(),
            transaction_id: Some(transaction_id),
            detail: None,
        }
    }

    fn ignored(detail: &str) -> Self {
        Self {
            status: "ignored".to_string(),
            transaction_id: None,
            detail: Some(detail.to_string()),
        }
    }
}

/// Inbound hosted-checkout result. Unverifiable or unknown callbacks are
/// acknowledged with 200 `ignored` so the gateway stops redelivering junk;
/// only a persistence failure earns a 5xx and thus a redelivery.
#[utoipa::path(
    post,
    path = "/callbacks/hosted-checkout",
    responses(
        (status = 200, description = "Callback acknowledged", body = CallbackAck),
        (status = 403, description = "Source address not allowlisted"),
        (status = 500, description = "Persistence failure; the gateway should redeliver")
    ),
    tag = "Callbacks"
)]
pub async fn hosted_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let parsed = match state.gateway.verify_callback(&body, &headers) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("discarding unverifiable gateway callback: {err}");
            return Ok((
                StatusCode::OK,
                Json(CallbackAck::ignored("unverifiable callback")),
            ));
        }
    };

    match state.engine.apply_gateway_result(&parsed).await {
        Ok(_) => Ok((StatusCode::OK, Json(CallbackAck::ok(parsed.transaction_id)))),
        Err(AppError::NotFound(_)) => Ok((
            StatusCode::OK,
            Json(CallbackAck::ignored("unknown transaction")),
        )),
        Err(err) => Err(err),
    }
}
