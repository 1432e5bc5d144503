//! Booking rows as seen by billing

use bookwell_shared::BookingStatus;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BookingRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub status: String,
    pub series_id: Option<Uuid>,
    pub notes: Option<String>,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl BookingRecord {
    pub fn status(&self) -> BillingResult<BookingStatus> {
        Ok(self.status.parse()?)
    }
}

/// Booking plus the people on either side of it, for emails and checkout
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BookingContext {
    #[sqlx(flatten)]
    pub booking: BookingRecord,
    pub client_name: String,
    pub client_email: Option<String>,
    pub practitioner_name: String,
    pub practitioner_email: String,
    pub timezone: String,
}

pub(crate) const BOOKING_COLUMNS: &str = "b.id, b.user_id, b.client_id, b.start_time, b.end_time, \
     b.status, b.series_id, b.notes, b.canceled_at, b.cancel_reason, b.created_at, b.updated_at";

pub async fn get_booking(pool: &PgPool, booking_id: Uuid) -> BillingResult<BookingRecord> {
    let sql = format!("SELECT {} FROM bookings b WHERE b.id = $1", BOOKING_COLUMNS);
    sqlx::query_as::<_, BookingRecord>(&sql)
        .bind(booking_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Booking {} not found", booking_id)))
}

pub async fn get_context(pool: &PgPool, booking_id: Uuid) -> BillingResult<BookingContext> {
    let sql = format!(
        r#"
        SELECT {},
               c.name AS client_name,
               c.email AS client_email,
               COALESCE(u.business_name, u.full_name, u.email) AS practitioner_name,
               u.email AS practitioner_email,
               u.timezone
        FROM bookings b
        JOIN clients c ON c.id = b.client_id
        JOIN users u ON u.id = b.user_id
        WHERE b.id = $1
        "#,
        BOOKING_COLUMNS
    );
    sqlx::query_as::<_, BookingContext>(&sql)
        .bind(booking_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Booking {} not found", booking_id)))
}

/// Load a booking and check it belongs to `user_id`
pub async fn get_owned_context(
    pool: &PgPool,
    user_id: Uuid,
    booking_id: Uuid,
) -> BillingResult<BookingContext> {
    let ctx = get_context(pool, booking_id).await?;
    if ctx.booking.user_id != user_id {
        // same answer as a missing row
        return Err(BillingError::NotFound(format!(
            "Booking {} not found",
            booking_id
        )));
    }
    Ok(ctx)
}
