//! Refund domain entity.
//! A refund is always a child of a completed transaction and carries its own
//! lifecycle; the parent transaction is never mutated by refund processing.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Completed => "completed",
            RefundStatus::Failed => "failed",
        }
    }

    /// Pending and completed refunds both hold a reservation against the
    /// parent's refundable balance; only a failed refund releases it.
    pub fn reserves_amount(&self) -> bool {
        !matches!(self, RefundStatus::Failed)
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "completed" => Ok(RefundStatus::Completed),
            "failed" => Ok(RefundStatus::Failed),
            other => Err(format!("unknown refund status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Refund {
    pub refund_id: String,
    pub transaction_id: String,
    #[schema(value_type = String, example = "120.00")]
    pub amount: BigDecimal,
    pub reason: String,
    pub status: RefundStatus,
    pub gateway_refund_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    pub fn new(transaction_id: String, amount: BigDecimal, reason: String) -> Self {
        let now = Utc::now();
        Self {
            refund_id: new_refund_id(),
            transaction_id,
            amount,
            reason,
            status: RefundStatus::Pending,
            gateway_refund_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn new_refund_id() -> String {
    format!("rfd_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_refund_starts_pending() {
        let refund = Refund::new(
            "txn_abc".to_string(),
            "120.00".parse().unwrap(),
            "damaged item".to_string(),
        );
        assert_eq!(refund.status, RefundStatus::Pending);
        assert!(refund.refund_id.starts_with("rfd_"));
        assert!(refund.gateway_refund_id.is_none());
    }

    #[test]
    fn only_failed_refunds_release_the_reservation() {
        assert!(RefundStatus::Pending.reserves_amount());
        assert!(RefundStatus::Completed.reserves_amount());
        assert!(!RefundStatus::Failed.reserves_amount());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RefundStatus::Pending,
            RefundStatus::Completed,
            RefundStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RefundStatus>(), Ok(status));
        }
    }
}
