//! Admin endpoints: webhook inspection/replay and invariant checks

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use quotekit_billing::{EdgeCaseEventRecord, EventReplayResult, InvariantCheckSummary};

use crate::error::ApiResult;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct WebhookListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/admin/webhooks
pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<WebhookListQuery>,
) -> ApiResult<Json<Vec<EdgeCaseEventRecord>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let records = state
        .billing
        .coordinator
        .list_events(query.status.as_deref(), limit, offset)
        .await?;

    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct FailedListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/admin/webhooks/failed
///
/// Events in 'error' plus anything stuck mid-claim or mid-replay.
pub async fn list_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<FailedListQuery>,
) -> ApiResult<Json<Vec<EdgeCaseEventRecord>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let records = state
        .billing
        .coordinator
        .list_failed_events(limit, offset)
        .await?;

    Ok(Json(records))
}

/// POST /api/admin/webhooks/reset-stuck
pub async fn reset_stuck_webhooks(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let reset = state.billing.coordinator.reset_stuck_replays().await?;

    Ok(Json(serde_json::json!({ "reset": reset })))
}

/// POST /api/admin/webhooks/{id}/replay
pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(stripe_event_id): Path<String>,
) -> ApiResult<Json<EventReplayResult>> {
    let result = state
        .billing
        .coordinator
        .replay_event(&stripe_event_id)
        .await?;

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub max_events: Option<i64>,
}

/// POST /api/admin/webhooks/replay-failed
pub async fn replay_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<Vec<EventReplayResult>>> {
    let results = state
        .billing
        .coordinator
        .replay_all_failed(query.max_events)
        .await?;

    Ok(Json(results))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    pub check: Option<String>,
}

/// GET /api/admin/invariants
///
/// `?check=<name>` runs a single check instead of the full pass.
pub async fn run_invariants(
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = match query.check.as_deref() {
        Some(name) => state.billing.invariants.run_check(name).await?,
        None => state.billing.invariants.run_all_checks().await?,
    };

    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Invariant check found violations"
        );
    }

    Ok(Json(summary))
}
