//! Google Calendar connection endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    calendar::{sign_state, sync::ConnectionStatus, verify_state, CalendarError},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub url: String,
}

/// Google consent URL. Returned as JSON since the SPA calls this with a bearer token.
pub async fn connect(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ConnectResponse>> {
    let client = state.calendar.client()?;
    let oauth_state = sign_state(
        auth_user.user_id,
        OffsetDateTime::now_utc().unix_timestamp(),
        &state.config.oauth_state_secret,
    )?;
    Ok(Json(ConnectResponse {
        url: client.authorize_url(&oauth_state)?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

async fn finish_connect(state: &AppState, query: &CallbackQuery) -> Result<(), CalendarError> {
    state.calendar.client()?;
    let oauth_state = query.state.as_deref().ok_or(CalendarError::InvalidState)?;
    let user_id = verify_state(
        oauth_state,
        &state.config.oauth_state_secret,
        OffsetDateTime::now_utc().unix_timestamp(),
    )?;

    if let Some(error) = &query.error {
        return Err(CalendarError::Api {
            status: 400,
            message: format!("consent denied: {}", error),
        });
    }
    let code = query.code.as_deref().ok_or(CalendarError::InvalidState)?;

    state.calendar.connect(user_id, code).await
}

/// Google redirects the browser here after consent
pub async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Redirect {
    match finish_connect(&state, &query).await {
        Ok(()) => Redirect::to(&format!(
            "{}/settings/calendar?connected=true",
            state.config.app_base_url
        )),
        Err(e) => {
            tracing::warn!(error = %e, "Google Calendar connection failed");
            Redirect::to(&state.config.error_redirect("calendar_connect"))
        }
    }
}

pub async fn connection_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ConnectionStatus>> {
    Ok(Json(state.calendar.status(auth_user.user_id).await?))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<StatusCode> {
    state.calendar.disconnect(auth_user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
