//! Request authentication.
//!
//! Two kinds of callers exist: storefront customers identified by the
//! `x-user-id` header the storefront gateway injects after its own session
//! check, and back-office operators presenting the shared operator API key
//! as a bearer token. Operators see everything; customers only see payments
//! for their own orders.

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, header, request::Parts};
use uuid::Uuid;

use crate::AppState;
use crate::domain::OrderSummary;
use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Customer { user_id: Uuid },
    Operator,
}

impl Caller {
    pub fn is_operator(&self) -> bool {
        matches!(self, Caller::Operator)
    }

    pub fn can_access_order(&self, order: &OrderSummary) -> bool {
        match self {
            Caller::Operator => true,
            Caller::Customer { user_id } => order.customer_id == *user_id,
        }
    }
}

/// Resolves the caller from request headers.
///
/// A bearer token is only ever the operator key; a wrong token is rejected
/// rather than downgraded to an anonymous customer.
pub fn caller_from_headers(headers: &HeaderMap, operator_api_key: &str) -> Result<Caller, AppError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let token = value
            .to_str()
            .ok()
            .and_then(|raw| raw.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::Unauthorized("malformed authorization header".to_string()))?;

        if token == operator_api_key {
            return Ok(Caller::Operator);
        }
        return Err(AppError::Unauthorized("invalid operator API key".to_string()));
    }

    if let Some(value) = headers.get(USER_ID_HEADER) {
        let user_id = value
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .ok_or_else(|| AppError::Unauthorized("malformed x-user-id header".to_string()))?;

        return Ok(Caller::Customer { user_id });
    }

    Err(AppError::Unauthorized("missing credentials".to_string()))
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        caller_from_headers(&parts.headers, &state.config.operator_api_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    use crate::domain::OrderPaymentStatus;

    const OPERATOR_KEY: &str = "op-secret-key";

    fn order_for(customer_id: Uuid) -> OrderSummary {
        OrderSummary {
            order_id: Uuid::new_v4(),
            customer_id,
            total_amount: BigDecimal::from_str("499.00").unwrap(),
            currency: "INR".to_string(),
            payment_status: OrderPaymentStatus::Unpaid,
        }
    }

    #[test]
    fn test_operator_bearer_token_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {OPERATOR_KEY}")).unwrap(),
        );

        let caller = caller_from_headers(&headers, OPERATOR_KEY).unwrap();
        assert_eq!(caller, Caller::Operator);
        assert!(caller.is_operator());
    }

    #[test]
    fn test_wrong_bearer_token_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer nope"),
        );

        let err = caller_from_headers(&headers, OPERATOR_KEY).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_bearer_prefix_required() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(OPERATOR_KEY).unwrap(),
        );

        let err = caller_from_headers(&headers, OPERATOR_KEY).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_user_id_header_resolves_customer() {
        let user_id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&user_id.to_string()).unwrap(),
        );

        let caller = caller_from_headers(&headers, OPERATOR_KEY).unwrap();
        assert_eq!(caller, Caller::Customer { user_id });
        assert!(!caller.is_operator());
    }

    #[test]
    fn test_garbage_user_id_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-uuid"));

        let err = caller_from_headers(&headers, OPERATOR_KEY).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_no_credentials_rejected() {
        let err = caller_from_headers(&HeaderMap::new(), OPERATOR_KEY).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_customer_sees_only_own_orders() {
        let user_id = Uuid::new_v4();
        let caller = Caller::Customer { user_id };

        assert!(caller.can_access_order(&order_for(user_id)));
        assert!(!caller.can_access_order(&order_for(Uuid::new_v4())));
    }

    #[test]
    fn test_operator_sees_every_order() {
        assert!(Caller::Operator.can_access_order(&order_for(Uuid::new_v4())));
    }
}
