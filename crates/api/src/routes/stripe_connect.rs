//! Stripe Connect onboarding

use axum::{
    extract::{Query, State},
    response::Redirect,
    Extension, Json,
};
use bookwell_billing::{OnboardingCallback, OnboardingLink, StripeAccountRecord};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Create (or reuse) the practitioner's Express account and return the hosted onboarding URL
pub async fn start_onboarding(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<OnboardingLink>> {
    let billing = state.billing()?;

    let email = match auth_user.email.clone() {
        Some(email) => email,
        None => sqlx::query_scalar("SELECT email FROM users WHERE id = $1")
            .bind(auth_user.user_id)
            .fetch_one(&state.pool)
            .await?,
    };

    let link = billing
        .connect
        .onboarding_link(auth_user.user_id, &email)
        .await?;
    tracing::info!(user_id = %auth_user.user_id, account = %link.stripe_account_id, "Stripe onboarding started");
    Ok(Json(link))
}

#[derive(Debug, Deserialize)]
pub struct AccountQuery {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn get_account(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<Json<StripeAccountRecord>> {
    let connect = &state.billing()?.connect;
    let record = if query.refresh {
        connect.refresh_status(auth_user.user_id).await?
    } else {
        connect
            .get(auth_user.user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("No Stripe account connected".to_string()))?
    };
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectCallbackQuery {
    pub account: Option<String>,
    pub ts: Option<i64>,
    pub sig: Option<String>,
}

impl ConnectCallbackQuery {
    /// All three parts of a signed callback, or 400
    pub fn callback(&self) -> ApiResult<OnboardingCallback> {
        match (&self.account, self.ts, &self.sig) {
            (Some(account), Some(ts), Some(sig)) => Ok(OnboardingCallback {
                account: account.clone(),
                ts,
                sig: sig.clone(),
            }),
            _ => Err(ApiError::BadRequest("missing onboarding link parameters".to_string())),
        }
    }
}

async fn finish_onboarding(state: &AppState, query: &ConnectCallbackQuery) -> ApiResult<bool> {
    let callback = query.callback()?;
    let connect = &state.billing()?.connect;
    let record = connect.callback_account(&callback).await?;
    let record = connect.refresh_status(record.user_id).await?;
    Ok(record.payments_enabled())
}

async fn refresh_link(state: &AppState, query: &ConnectCallbackQuery) -> ApiResult<OnboardingLink> {
    let callback = query.callback()?;
    Ok(state.billing()?.connect.relink(&callback).await?)
}

/// Stripe sends the browser here when onboarding ends
pub async fn onboarding_return(
    State(state): State<AppState>,
    Query(query): Query<ConnectCallbackQuery>,
) -> Redirect {
    match finish_onboarding(&state, &query).await {
        Ok(enabled) => {
            let status = if enabled { "connected" } else { "pending" };
            Redirect::to(&format!(
                "{}/settings/payments?stripe={}",
                state.config.app_base_url, status
            ))
        }
        Err(e) => {
            tracing::warn!(account = ?query.account, error = %e, "Stripe onboarding return failed");
            Redirect::to(&state.config.error_redirect("stripe_return"))
        }
    }
}

/// Stripe sends the browser here when an onboarding link has expired
pub async fn onboarding_refresh(
    State(state): State<AppState>,
    Query(query): Query<ConnectCallbackQuery>,
) -> Redirect {
    match refresh_link(&state, &query).await {
        Ok(link) => Redirect::to(&link.url),
        Err(e) => {
            tracing::warn!(account = ?query.account, error = %e, "Stripe onboarding refresh failed");
            Redirect::to(&state.config.error_redirect("stripe_refresh"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_requires_signature() {
        let query = ConnectCallbackQuery {
            account: Some("acct_123".to_string()),
            ..Default::default()
        };
        let err = query.callback().unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_callback_from_signed_query() {
        let query = ConnectCallbackQuery {
            account: Some("acct_123".to_string()),
            ts: Some(1_700_000_000),
            sig: Some("ab".repeat(32)),
        };
        let callback = query.callback().unwrap();
        assert_eq!(callback.account, "acct_123");
        assert_eq!(callback.ts, 1_700_000_000);
    }
}
