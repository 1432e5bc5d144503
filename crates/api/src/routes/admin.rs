//! Operator endpoints: invariant checks and webhook replay

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use bookwell_billing::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, WebhookEventRecord,
    WebhookReplayResult,
};
use serde::{Deserialize, Serialize};

use super::cron::require_cron_secret;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    pub check: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum InvariantResponse {
    All(InvariantCheckSummary),
    Single {
        check: String,
        violations: Vec<InvariantViolation>,
    },
}

pub async fn run_invariants(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantResponse>> {
    require_cron_secret(&headers, &state)?;
    let checker = InvariantChecker::new(state.pool.clone());

    match query.check {
        Some(check) => {
            if !InvariantChecker::available_checks()
                .iter()
                .any(|name| *name == check)
            {
                return Err(ApiError::BadRequest(format!("Unknown check: {}", check)));
            }
            let violations = checker.run_check(&check).await?;
            Ok(Json(InvariantResponse::Single { check, violations }))
        }
        None => Ok(Json(InvariantResponse::All(checker.run_all_checks().await?))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_failed_webhooks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    require_cron_secret(&headers, &state)?;
    let limit = page.limit.unwrap_or(50).clamp(1, 200);
    let offset = page.offset.unwrap_or(0).max(0);
    let records = state
        .billing()?
        .webhooks
        .list_failed_webhooks(limit, offset)
        .await?;
    Ok(Json(records))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    require_cron_secret(&headers, &state)?;
    tracing::info!(event_id = %event_id, "Replaying Stripe webhook");
    let result = state.billing()?.webhooks.replay_webhook(&event_id).await?;
    Ok(Json(result))
}
