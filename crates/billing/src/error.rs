//! Billing error types

use thiserror::Error;

/// Errors produced by the billing crate
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("customer not found: {0}")]
    CustomerNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("dispute not found: {0}")]
    DisputeNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("refund not eligible: {0}")]
    RefundNotEligible(String),

    #[error("refund failed: {0}")]
    RefundFailed(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Whether a failure is worth retrying via the follow-up queue.
///
/// Signature failures and malformed events will never succeed on replay;
/// network and database errors usually will.
impl BillingError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Stripe(_)
                | BillingError::StripeApi(_)
                | BillingError::Database(_)
                | BillingError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(BillingError::StripeApi("timeout".into()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::InvalidInput("bad id".into()).is_retryable());
        assert!(!BillingError::RefundNotEligible("too old".into()).is_retryable());
    }
}
