//! Route definitions

pub mod admin;
pub mod billing;
pub mod webhooks;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/api/billing/history/{customer_id}",
            get(billing::billing_history),
        )
        .route(
            "/api/billing/plan-change/preview",
            post(billing::preview_plan_change),
        )
        .route("/api/billing/plan-change", post(billing::execute_plan_change))
        .route("/api/billing/refunds", post(billing::issue_refund))
        .route("/api/billing/credit-notes", post(billing::issue_credit_note))
        .route("/api/admin/webhooks", get(admin::list_webhooks))
        .route(
            "/api/admin/webhooks/failed",
            get(admin::list_failed_webhooks),
        )
        .route(
            "/api/admin/webhooks/{id}/replay",
            post(admin::replay_webhook),
        )
        .route(
            "/api/admin/webhooks/replay-failed",
            post(admin::replay_failed_webhooks),
        )
        .route(
            "/api/admin/webhooks/reset-stuck",
            post(admin::reset_stuck_webhooks),
        )
        .route("/api/admin/invariants", get(admin::run_invariants))
        .with_state(state)
}

/// GET /health
async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
