//! Booking endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use bookwell_billing::{BookingRecord, RefundResult};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    bookings::{
        BookingDetail, CancelRequest, CanceledBooking, CreateBookingRequest, CreatedBookings,
        ListBookingsQuery, RefundRequest, RescheduleRequest,
    },
    error::ApiResult,
    state::AppState,
};

pub async fn create_booking(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateBookingRequest>,
) -> ApiResult<(StatusCode, Json<CreatedBookings>)> {
    let created = state.bookings.create(auth_user.user_id, &req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_bookings(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListBookingsQuery>,
) -> ApiResult<Json<Vec<BookingRecord>>> {
    Ok(Json(state.bookings.list(auth_user.user_id, &query).await?))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BookingDetail>> {
    Ok(Json(state.bookings.get(auth_user.user_id, id).await?))
}

pub async fn confirm_booking(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BookingRecord>> {
    Ok(Json(state.bookings.confirm(auth_user.user_id, id).await?))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    req: Option<Json<CancelRequest>>,
) -> ApiResult<Json<CanceledBooking>> {
    let Json(req) = req.unwrap_or_default();
    let canceled = state
        .bookings
        .cancel(auth_user.user_id, id, req.reason.as_deref())
        .await?;
    Ok(Json(canceled))
}

pub async fn reschedule_booking(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<RescheduleRequest>,
) -> ApiResult<Json<BookingRecord>> {
    Ok(Json(
        state.bookings.reschedule(auth_user.user_id, id, &req).await?,
    ))
}

/// Refund the paid bill of a booking; 400 "No paid bill" when there is none
pub async fn refund_booking(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    req: Option<Json<RefundRequest>>,
) -> ApiResult<Json<RefundResult>> {
    let Json(req) = req.unwrap_or_default();
    let result = state
        .bookings
        .refund(auth_user.user_id, id, req.reason.as_deref())
        .await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, extract::FromRequest, http::Request};

    #[tokio::test]
    async fn test_cancel_body_is_optional() {
        let request = Request::builder()
            .method("POST")
            .uri("/bookings/00000000-0000-0000-0000-000000000000/cancel")
            .body(Body::empty())
            .unwrap();
        let extracted = Option::<Json<CancelRequest>>::from_request(request, &())
            .await
            .unwrap();
        let Json(req) = extracted.unwrap_or_default();
        assert!(req.reason.is_none());
    }

    #[tokio::test]
    async fn test_refund_body_still_parsed_when_sent() {
        let request = Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"reason":"duplicate"}"#))
            .unwrap();
        let extracted = Option::<Json<RefundRequest>>::from_request(request, &())
            .await
            .unwrap();
        assert_eq!(extracted.unwrap().0.reason.as_deref(), Some("duplicate"));
    }
}
