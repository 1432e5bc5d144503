//! Billing error types

use bookwell_shared::{ParseEnumError, RecurrenceError};
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("No paid bill found for booking {0}")]
    NoPaidBill(Uuid),

    #[error("Cannot {action} a booking that is {status}")]
    InvalidTransition { action: String, status: String },

    #[error("Stripe account is not ready to accept payments")]
    AccountNotReady,

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(err: ParseEnumError) -> Self {
        BillingError::Internal(err.to_string())
    }
}

impl From<RecurrenceError> for BillingError {
    fn from(err: RecurrenceError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Internal(format!("HTTP client error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_paid_bill_message() {
        let booking_id = Uuid::nil();
        let err = BillingError::NoPaidBill(booking_id);
        assert!(err.to_string().contains("No paid bill"));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = BillingError::InvalidTransition {
            action: "confirm".to_string(),
            status: "canceled".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot confirm a booking that is canceled");
    }
}
