//! Stripe webhook receiver

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Verify against the platform and Connect secrets, then process the event.
///
/// Signature failures return 400 so Stripe stops retrying; processing
/// failures return 500 so it retries later.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let billing = state.billing()?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Rejected Stripe webhook");
        ApiError::BadRequest(e.to_string())
    })?;

    let event_id = event.id.to_string();
    let event_type = event.type_.to_string();

    billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(event_id = %event_id, event_type = %event_type, error = %e, "Webhook processing failed");
        ApiError::Internal(e.to_string())
    })?;

    Ok(Json(json!({ "received": true })))
}
