//! Customer-facing billing endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use quotekit_billing::{BillingHistoryEntry, PlanChangeResult, ProrationPreview, RefundResult};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/billing/history/{customer_id}
pub async fn billing_history(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<BillingHistoryEntry>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    let entries = state
        .billing
        .history
        .customer_history(&customer_id, limit)
        .await?;

    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub subscription_id: String,
    pub new_price_id: String,
    /// Who asked for the change; lands in the audit row
    pub initiated_by: Option<String>,
}

/// POST /api/billing/plan-change/preview
pub async fn preview_plan_change(
    State(state): State<AppState>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<ProrationPreview>> {
    let preview = state
        .billing
        .proration
        .preview_plan_change(&req.subscription_id, &req.new_price_id)
        .await?;

    Ok(Json(preview))
}

/// POST /api/billing/plan-change
pub async fn execute_plan_change(
    State(state): State<AppState>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    let initiated_by = req.initiated_by.as_deref().unwrap_or("api");

    let result = state
        .billing
        .proration
        .execute_plan_change(&req.subscription_id, &req.new_price_id, initiated_by)
        .await?;

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub customer_id: String,
    pub charge_id: String,
    pub invoice_id: Option<String>,
    pub amount_cents: i64,
    pub reason: String,
}

/// POST /api/billing/refunds
pub async fn issue_refund(
    State(state): State<AppState>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundResult>> {
    if req.amount_cents <= 0 {
        return Err(ApiError::BadRequest(
            "amount_cents must be positive".to_string(),
        ));
    }

    let result = state
        .billing
        .refunds
        .issue_refund(
            &req.customer_id,
            &req.charge_id,
            req.invoice_id.as_deref(),
            req.amount_cents,
            &req.reason,
        )
        .await?;

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct CreditNoteRequest {
    pub customer_id: String,
    pub invoice_id: String,
    pub amount_cents: i64,
    pub memo: String,
}

/// POST /api/billing/credit-notes
pub async fn issue_credit_note(
    State(state): State<AppState>,
    Json(req): Json<CreditNoteRequest>,
) -> ApiResult<Json<RefundResult>> {
    if req.amount_cents <= 0 {
        return Err(ApiError::BadRequest(
            "amount_cents must be positive".to_string(),
        ));
    }

    let result = state
        .billing
        .refunds
        .issue_credit_note(
            &req.customer_id,
            &req.invoice_id,
            req.amount_cents,
            &req.memo,
        )
        .await?;

    Ok(Json(result))
}
