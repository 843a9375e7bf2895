use bigdecimal::BigDecimal;
use std::fmt;

use crate::domain::ContactInfo;

pub const CURRENCY_LEN: usize = 3;
pub const REASON_MAX_LEN: usize = 255;
pub const EMAIL_MAX_LEN: usize = 254;
pub const PHONE_MAX_LEN: usize = 32;
pub const TRANSACTION_REF_MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

/// ISO 4217 alpha-3 shape check. Which currencies a merchant account takes
/// is the gateway's call, not ours.
pub fn validate_currency(currency: &str) -> ValidationResult {
    let currency = sanitize_string(currency);
    validate_required("currency", &currency)?;

    if currency.len() != CURRENCY_LEN {
        return Err(ValidationError::new(
            "currency",
            format!("must be exactly {} characters", CURRENCY_LEN),
        ));
    }

    if !currency.chars().all(|ch| ch.is_ascii_uppercase()) {
        return Err(ValidationError::new(
            "currency",
            "must contain only uppercase letters",
        ));
    }

    Ok(())
}

pub fn validate_positive_amount(amount: &BigDecimal) -> ValidationResult {
    if amount <= &BigDecimal::from(0) {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }

    Ok(())
}

pub fn validate_refund_reason(reason: &str) -> ValidationResult {
    let reason = sanitize_string(reason);
    validate_required("reason", &reason)?;
    validate_max_len("reason", &reason, REASON_MAX_LEN)?;

    Ok(())
}

/// Transaction and refund references as they appear in paths and callbacks.
pub fn validate_transaction_ref(field: &'static str, value: &str) -> ValidationResult {
    validate_required(field, value)?;
    validate_max_len(field, value, TRANSACTION_REF_MAX_LEN)?;

    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(ValidationError::new(
            field,
            "must contain only letters, digits, '_' or '-'",
        ));
    }

    Ok(())
}

pub fn validate_contact(contact: &ContactInfo) -> ValidationResult {
    if let Some(email) = &contact.email {
        let email = sanitize_string(email);
        validate_max_len("customer_contact.email", &email, EMAIL_MAX_LEN)?;
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            return Err(ValidationError::new(
                "customer_contact.email",
                "must be a valid email address",
            ));
        }
    }

    if let Some(phone) = &contact.phone {
        let phone = sanitize_string(phone);
        validate_max_len("customer_contact.phone", &phone, PHONE_MAX_LEN)?;
        if !phone
            .chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, '+' | '-' | ' ' | '(' | ')'))
        {
            return Err(ValidationError::new(
                "customer_contact.phone",
                "must contain only digits, spaces, '+', '-', '(' or ')'",
            ));
        }
    }

    Ok(())
}
