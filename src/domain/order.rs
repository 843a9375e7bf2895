//! Order projection consumed from the storefront.
//! The payment core reads orders through the ledger port and writes back
//! nothing but `payment_status`.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrderPaymentStatus {
    Unpaid,
    Paid,
    Failed,
}

impl OrderPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPaymentStatus::Unpaid => "unpaid",
            OrderPaymentStatus::Paid => "paid",
            OrderPaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OrderPaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderPaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(OrderPaymentStatus::Unpaid),
            "paid" => Ok(OrderPaymentStatus::Paid),
            "failed" => Ok(OrderPaymentStatus::Failed),
            other => Err(format!("unknown order payment status: {other}")),
        }
    }
}

/// The slice of an order the payment core needs.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    #[schema(value_type = String, example = "499.00")]
    pub total_amount: BigDecimal,
    pub currency: String,
    pub payment_status: OrderPaymentStatus,
}

/// Contact details forwarded to the gateway's hosted page. Both fields are
/// optional; the gateway falls back to prompting the customer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
}
