//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quotekit_billing::BillingError;

/// API-level error that converts billing errors into HTTP responses
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::WebhookSignatureInvalid => StatusCode::BAD_REQUEST,
                BillingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                BillingError::NotFound(_)
                | BillingError::CustomerNotFound(_)
                | BillingError::SubscriptionNotFound(_)
                | BillingError::DisputeNotFound(_) => StatusCode::NOT_FOUND,
                BillingError::RefundNotEligible(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BillingError::InvalidTransition { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs, not the response body
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error serving request");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_failure_is_400() {
        let err = ApiError::from(BillingError::WebhookSignatureInvalid);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_is_404() {
        let err = ApiError::from(BillingError::NotFound("evt_1".to_string()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_refund_rejection_is_422() {
        let err = ApiError::from(BillingError::RefundNotEligible("window".to_string()));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_invalid_transition_is_409() {
        let err = ApiError::from(BillingError::InvalidTransition {
            from: "canceled".to_string(),
            to: "active".to_string(),
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
