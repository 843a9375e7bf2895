//! Transaction domain entity.
//! Framework-agnostic representation of one payment attempt against an order.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Payment gateways this engine can drive. Stored lowercase snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Gateway {
    HostedCheckout,
}

impl Gateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gateway::HostedCheckout => "hosted_checkout",
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gateway {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hosted_checkout" => Ok(Gateway::HostedCheckout),
            other => Err(format!("unknown gateway: {other}")),
        }
    }
}

/// Lifecycle of a payment attempt. `Completed` and `Failed` are terminal;
/// no transition ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// One payment attempt against an order. The `transaction_id` is minted
/// locally before any gateway call and is the reference the gateway echoes
/// back in callbacks. `amount` and `currency` are frozen copies of the order
/// totals at creation time; a changed order total means a new transaction.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    pub transaction_id: String,
    pub order_id: Uuid,
    pub gateway: Gateway,
    #[schema(value_type = String, example = "499.00")]
    pub amount: BigDecimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_transaction_id: Option<String>,
    #[schema(value_type = Object)]
    pub gateway_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub poll_attempts: i32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(order_id: Uuid, gateway: Gateway, amount: BigDecimal, currency: String) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: new_transaction_id(),
            order_id,
            gateway,
            amount,
            currency,
            status: TransactionStatus::Pending,
            gateway_transaction_id: None,
            gateway_response: None,
            failure_reason: None,
            poll_attempts: 0,
            last_polled_at: None,
            next_poll_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Refunds may only be raised against a completed payment.
    pub fn can_refund(&self) -> bool {
        self.status == TransactionStatus::Completed
    }
}

pub fn new_transaction_id() -> String {
    format!("txn_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transaction_starts_pending() {
        let tx = Transaction::new(
            Uuid::new_v4(),
            Gateway::HostedCheckout,
            "499.00".parse().unwrap(),
            "INR".to_string(),
        );
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(!tx.is_terminal());
        assert!(!tx.can_refund());
        assert!(tx.transaction_id.starts_with("txn_"));
        assert_eq!(tx.poll_attempts, 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>(), Ok(status));
        }
        assert!("refunded".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn gateway_parses_from_storage_form() {
        assert_eq!(
            "hosted_checkout".parse::<Gateway>(),
            Ok(Gateway::HostedCheckout)
        );
        assert!("stripe".parse::<Gateway>().is_err());
    }

    #[test]
    fn transaction_ids_are_unique() {
        let a = new_transaction_id();
        let b = new_transaction_id();
        assert_ne!(a, b);
    }
}
