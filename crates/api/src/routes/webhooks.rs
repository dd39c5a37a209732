//! Stripe webhook endpoint

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhooks/stripe
///
/// Returns 400 only for signature failures; a verified event is acknowledged
/// with 200 even when processing fails, because the failure is recorded on
/// the event row and recoverable through replay. Letting Stripe retry a
/// verified event just produces duplicate-claim noise.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::BadRequest("Webhook body is not valid UTF-8".to_string()))?;

    let event = state
        .billing
        .coordinator
        .verify_event(payload, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    if let Err(e) = state.billing.coordinator.handle_event(event).await {
        tracing::error!(error = %e, "Webhook processing failed; recorded for replay");
    }

    Ok(StatusCode::OK)
}
