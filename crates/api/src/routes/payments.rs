//! Checkout session creation

use axum::{extract::State, Extension, Json};
use bookwell_billing::{CheckoutResponse, CheckoutTarget};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub booking_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
}

impl CheckoutRequest {
    pub fn target(&self) -> ApiResult<CheckoutTarget> {
        match (self.booking_id, self.invoice_id) {
            (Some(id), None) => Ok(CheckoutTarget::Booking(id)),
            (None, Some(id)) => Ok(CheckoutTarget::Invoice(id)),
            _ => Err(ApiError::BadRequest(
                "Provide exactly one of booking_id or invoice_id".to_string(),
            )),
        }
    }
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let target = req.target()?;
    let checkout = state
        .billing()?
        .checkout
        .create(auth_user.user_id, target)
        .await?;
    Ok(Json(checkout))
}
