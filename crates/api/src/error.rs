//! API error type and its JSON response shape

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bookwell_billing::BillingError;
use serde_json::json;

use crate::auth::AuthError;
use crate::calendar::CalendarError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NoPaidBill(_)
            | BillingError::InvalidInput(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::AccountNotReady
            | BillingError::WebhookSignatureInvalid
            | BillingError::WebhookEventNotSupported(_) => ApiError::BadRequest(err.to_string()),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Forbidden(msg) => ApiError::Forbidden(msg),
            BillingError::StripeApi(_)
            | BillingError::Database(_)
            | BillingError::RefundFailed(_)
            | BillingError::Email(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Not found".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CalendarError> for ApiError {
    fn from(err: CalendarError) -> Self {
        match err {
            CalendarError::NotConfigured => ApiError::ServiceUnavailable(err.to_string()),
            CalendarError::NotConnected => ApiError::NotFound(err.to_string()),
            CalendarError::InvalidState => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::DatabaseError | AuthError::Internal(_) => ApiError::Internal(err.to_string()),
            _ => ApiError::Unauthorized,
        }
    }
}

impl From<bookwell_shared::RecurrenceError> for ApiError {
    fn from(err: bookwell_shared::RecurrenceError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_no_paid_bill_is_bad_request() {
        let booking = Uuid::new_v4();
        let response = ApiError::from(BillingError::NoPaidBill(booking)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("No paid bill"));
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_internal_detail_not_leaked() {
        let response =
            ApiError::from(BillingError::Database("password authentication failed".into()))
                .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
    }

    #[test]
    fn test_billing_error_mapping() {
        assert_eq!(
            ApiError::from(BillingError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(BillingError::InvalidTransition {
                action: "confirm".into(),
                status: "canceled".into()
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(BillingError::WebhookSignatureInvalid).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(BillingError::StripeApi("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
