//! Scheduled billing entry points, called by an external cron with `CRON_SECRET`

use axum::{extract::State, http::HeaderMap, Json};
use bookwell_billing::{ConsolidationRunReport, DueBillsReport};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Constant-time check of `Authorization: Bearer <secret>`
pub fn bearer_matches(authorization: Option<&str>, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) else {
        return false;
    };
    token.trim().as_bytes().ct_eq(secret.as_bytes()).into()
}

pub(crate) fn require_cron_secret(headers: &HeaderMap, state: &AppState) -> ApiResult<()> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    if bearer_matches(authorization, &state.config.cron_secret) {
        Ok(())
    } else {
        tracing::warn!("Rejected request with invalid cron secret");
        Err(ApiError::Unauthorized)
    }
}

/// Send every consultation bill due today
pub async fn run_billing(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<DueBillsReport>> {
    require_cron_secret(&headers, &state)?;
    let today = OffsetDateTime::now_utc().date();
    let report = state.billing()?.runner.run_due_bills(today).await?;
    tracing::info!(date = %today, report = ?report, "Cron billing run complete");
    Ok(Json(report))
}

/// Consolidate monthly bills into draft invoices
pub async fn run_consolidation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ConsolidationRunReport>> {
    require_cron_secret(&headers, &state)?;
    let today = OffsetDateTime::now_utc().date();
    let report = state.billing()?.consolidation.run(today).await?;
    tracing::info!(
        date = %today,
        groups = report.groups,
        bills_linked = report.bills_linked,
        failures = report.failures,
        "Cron consolidation run complete"
    );
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_matches() {
        assert!(bearer_matches(Some("Bearer s3cret"), "s3cret"));
        assert!(!bearer_matches(Some("Bearer s3cret2"), "s3cret"));
        assert!(!bearer_matches(Some("s3cret"), "s3cret"));
        assert!(!bearer_matches(None, "s3cret"));
    }

    #[test]
    fn test_empty_secret_never_matches() {
        assert!(!bearer_matches(Some("Bearer "), ""));
    }
}
