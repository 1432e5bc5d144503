//! Booking lifecycle: create, confirm, cancel, reschedule, refund
//!
//! Each transition updates the booking row first-class and then fans out to
//! billing, the practitioner's calendar and client email. Billing failures on
//! cancel and reschedule are returned to the caller; calendar and email are
//! best-effort.

use std::sync::Arc;

use bookwell_billing::{
    get_owned_context, Bill, BillingEmailService, BillingError, BillingResult, BillingService,
    BookingRecord, CancellationOutcome, EmailMessage, RefundResult,
};
use bookwell_shared::{
    generate_occurrences, occurrence_end, parse_timezone, resolve_local, BookingStatus,
    RecurrencePattern,
};
use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::CalendarSync;
use crate::error::{ApiError, ApiResult};

const BOOKING_RETURNING: &str = "id, user_id, client_id, start_time, end_time, status, \
     series_id, notes, canceled_at, cancel_reason, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingAction {
    Confirm,
    Cancel,
    Reschedule,
}

impl BookingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingAction::Confirm => "confirm",
            BookingAction::Cancel => "cancel",
            BookingAction::Reschedule => "reschedule",
        }
    }
}

/// Status a booking moves to when `action` is applied, or `InvalidTransition`
pub fn validate_transition(
    current: BookingStatus,
    action: BookingAction,
) -> BillingResult<BookingStatus> {
    let next = match (action, current) {
        (_, s) if s.is_terminal() => None,
        (BookingAction::Confirm, BookingStatus::Pending) => Some(BookingStatus::Scheduled),
        (BookingAction::Confirm, _) => None,
        (BookingAction::Cancel, _) => Some(BookingStatus::Canceled),
        (BookingAction::Reschedule, s) => Some(s),
    };

    next.ok_or_else(|| BillingError::InvalidTransition {
        action: action.as_str().to_string(),
        status: current.as_str().to_string(),
    })
}

/// New UTC start and end for a reschedule; keeps the current length when none is given
pub fn reschedule_window(
    tz: &Tz,
    request: &RescheduleRequest,
    current_minutes: i64,
) -> ApiResult<(OffsetDateTime, OffsetDateTime)> {
    let duration_minutes = request.duration_minutes.unwrap_or(current_minutes);
    let start = resolve_local(tz, request.start_local)?;
    let end = occurrence_end(start, duration_minutes)?;
    Ok((start, end))
}

/// Human-readable local start time for emails
pub fn format_when(start: OffsetDateTime, tz: &Tz) -> String {
    match chrono::DateTime::from_timestamp(start.unix_timestamp(), 0) {
        Some(utc) => utc
            .with_timezone(tz)
            .format("%A %-d %B %Y at %H:%M %Z")
            .to_string(),
        None => start.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RecurrenceRequest {
    pub pattern: RecurrencePattern,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingRequest {
    pub client_id: Uuid,
    /// Wall-clock start in the practitioner's timezone
    pub start_local: NaiveDateTime,
    pub duration_minutes: i64,
    pub notes: Option<String>,
    pub recurrence: Option<RecurrenceRequest>,
}

impl CreateBookingRequest {
    /// Pattern and occurrence count; a single booking is a one-element series
    pub fn series(&self) -> (RecurrencePattern, u32) {
        match self.recurrence {
            Some(r) => (r.pattern, r.count),
            None => (RecurrencePattern::Weekly, 1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleRequest {
    pub start_local: NaiveDateTime,
    /// Defaults to the current length of the booking
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListBookingsQuery {
    pub status: Option<BookingStatus>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedBookings {
    pub series_id: Option<Uuid>,
    pub bookings: Vec<BookingRecord>,
    pub bills_created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingDetail {
    pub booking: BookingRecord,
    pub bills: Vec<Bill>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanceledBooking {
    pub booking: BookingRecord,
    pub bills: Option<CancellationOutcome>,
    pub sessions_expired: usize,
}

#[derive(Clone)]
pub struct BookingService {
    pool: PgPool,
    billing: Option<Arc<BillingService>>,
    email: BillingEmailService,
    calendar: CalendarSync,
}

impl BookingService {
    pub fn new(
        pool: PgPool,
        billing: Option<Arc<BillingService>>,
        email: BillingEmailService,
        calendar: CalendarSync,
    ) -> Self {
        Self {
            pool,
            billing,
            email,
            calendar,
        }
    }

    fn billing(&self) -> ApiResult<&BillingService> {
        self.billing
            .as_deref()
            .ok_or_else(|| ApiError::ServiceUnavailable("Billing is disabled".to_string()))
    }

    async fn practitioner_timezone(&self, user_id: Uuid) -> ApiResult<Tz> {
        let name: String = sqlx::query_scalar("SELECT timezone FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound("Practitioner not found".to_string()))?;
        Ok(parse_timezone(&name)?)
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        request: &CreateBookingRequest,
    ) -> ApiResult<CreatedBookings> {
        let owns_client: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM clients WHERE id = $1 AND user_id = $2")
                .bind(request.client_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        if owns_client.is_none() {
            return Err(ApiError::NotFound(format!(
                "Client {} not found",
                request.client_id
            )));
        }

        let tz = self.practitioner_timezone(user_id).await?;
        let (pattern, count) = request.series();
        let occurrences = generate_occurrences(
            request.start_local,
            request.duration_minutes,
            &tz,
            pattern,
            count,
        )?;
        let series_id = (count > 1).then(Uuid::new_v4);

        let sql = format!(
            r#"
            INSERT INTO bookings (user_id, client_id, start_time, end_time, status, series_id, notes)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING {}
            "#,
            BOOKING_RETURNING
        );

        let mut tx = self.pool.begin().await?;
        let mut bookings = Vec::with_capacity(occurrences.len());
        for occ in &occurrences {
            let booking = sqlx::query_as::<_, BookingRecord>(&sql)
                .bind(user_id)
                .bind(request.client_id)
                .bind(occ.start_utc)
                .bind(occ.end_utc)
                .bind(series_id)
                .bind(&request.notes)
                .fetch_one(&mut *tx)
                .await?;
            bookings.push(booking);
        }
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            client_id = %request.client_id,
            count = bookings.len(),
            series_id = ?series_id,
            "Bookings created"
        );

        let mut bills_created = 0;
        if let Some(billing) = self.billing.as_deref() {
            for booking in &bookings {
                match billing.bills.create_for_booking(booking).await {
                    Ok(Some(_)) => bills_created += 1,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(booking_id = %booking.id, error = %e, "Failed to create bill for booking")
                    }
                }
            }
        }

        for booking in &bookings {
            self.calendar.on_booking_created(booking.id).await;
        }

        if let Some(first) = bookings.first() {
            self.send_confirmation(user_id, first.id, bookings.len(), pattern, &tz)
                .await;
        }

        Ok(CreatedBookings {
            series_id,
            bookings,
            bills_created,
        })
    }

    async fn send_confirmation(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
        count: usize,
        pattern: RecurrencePattern,
        tz: &Tz,
    ) {
        let ctx = match get_owned_context(&self.pool, user_id, booking_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(booking_id = %booking_id, error = %e, "Could not load booking for confirmation email");
                return;
            }
        };
        let Some(to) = ctx.client_email.as_deref() else {
            return;
        };

        let mut when = format_when(ctx.booking.start_time, tz);
        if count > 1 {
            when = format!("{}, then {} more {} sessions", when, count - 1, pattern.as_str());
        }
        let message =
            EmailMessage::booking_confirmation(to, &ctx.client_name, &ctx.practitioner_name, &when);
        self.email.send_best_effort(&message).await;
    }

    pub async fn get(&self, user_id: Uuid, booking_id: Uuid) -> ApiResult<BookingDetail> {
        let ctx = get_owned_context(&self.pool, user_id, booking_id).await?;
        let bills = match self.billing.as_deref() {
            Some(billing) => billing.bills.list_for_booking(booking_id).await?,
            None => Vec::new(),
        };
        Ok(BookingDetail {
            booking: ctx.booking,
            bills,
        })
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        query: &ListBookingsQuery,
    ) -> ApiResult<Vec<BookingRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM bookings
            WHERE user_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TIMESTAMPTZ IS NULL OR start_time >= $3)
              AND ($4::TIMESTAMPTZ IS NULL OR start_time < $4)
            ORDER BY start_time
            LIMIT 500
            "#,
            BOOKING_RETURNING
        );
        Ok(sqlx::query_as::<_, BookingRecord>(&sql)
            .bind(user_id)
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.from)
            .bind(query.to)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Move a row from `expected` to `next`, failing if it changed underneath us
    async fn set_status(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
        reason: Option<&str>,
    ) -> ApiResult<BookingRecord> {
        let sql = format!(
            r#"
            UPDATE bookings
            SET status = $3,
                canceled_at = CASE WHEN $3 = 'canceled' THEN NOW() ELSE canceled_at END,
                cancel_reason = COALESCE($4, cancel_reason),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            BOOKING_RETURNING
        );
        sqlx::query_as::<_, BookingRecord>(&sql)
            .bind(booking_id)
            .bind(expected.as_str())
            .bind(next.as_str())
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::Conflict("Booking was modified concurrently".to_string()))
    }

    pub async fn confirm(&self, user_id: Uuid, booking_id: Uuid) -> ApiResult<BookingRecord> {
        let ctx = get_owned_context(&self.pool, user_id, booking_id).await?;
        let current = ctx.booking.status()?;
        let next = validate_transition(current, BookingAction::Confirm)?;

        let booking = self.set_status(booking_id, current, next, None).await?;
        tracing::info!(booking_id = %booking_id, "Booking confirmed");
        Ok(booking)
    }

    pub async fn cancel(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
        reason: Option<&str>,
    ) -> ApiResult<CanceledBooking> {
        let ctx = get_owned_context(&self.pool, user_id, booking_id).await?;
        let current = ctx.booking.status()?;
        let next = validate_transition(current, BookingAction::Cancel)?;

        let mut sessions_expired = 0;
        let mut bills = None;
        if let Some(billing) = self.billing.as_deref() {
            match billing.checkout.expire_open_for_booking(booking_id).await {
                Ok(n) => sessions_expired = n,
                Err(e) => {
                    tracing::warn!(booking_id = %booking_id, error = %e, "Failed to expire checkout sessions")
                }
            }
            // an issued invoice shrinks or is canceled below; its link must die first
            for invoice_id in billing.bills.issued_invoices_for_booking(booking_id).await? {
                sessions_expired += billing.checkout.expire_open_for_invoice(invoice_id).await?;
            }
            bills = Some(billing.bills.cancel_for_booking(booking_id).await?);
        }

        let booking = self.set_status(booking_id, current, next, reason).await?;
        tracing::info!(booking_id = %booking_id, "Booking canceled");

        self.calendar.on_booking_canceled(booking_id).await;

        if let Some(to) = ctx.client_email.as_deref() {
            let when = match parse_timezone(&ctx.timezone) {
                Ok(tz) => format_when(ctx.booking.start_time, &tz),
                Err(_) => ctx.booking.start_time.to_string(),
            };
            let message = EmailMessage::booking_canceled(
                to,
                &ctx.client_name,
                &ctx.practitioner_name,
                &when,
                reason,
            );
            self.email.send_best_effort(&message).await;
        }

        Ok(CanceledBooking {
            booking,
            bills,
            sessions_expired,
        })
    }

    pub async fn reschedule(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
        request: &RescheduleRequest,
    ) -> ApiResult<BookingRecord> {
        let ctx = get_owned_context(&self.pool, user_id, booking_id).await?;
        validate_transition(ctx.booking.status()?, BookingAction::Reschedule)?;

        let tz = parse_timezone(&ctx.timezone)?;
        let current_minutes = (ctx.booking.end_time - ctx.booking.start_time).whole_minutes();
        let (start, end) = reschedule_window(&tz, request, current_minutes)?;

        let sql = format!(
            r#"
            UPDATE bookings SET start_time = $2, end_time = $3, updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'scheduled')
            RETURNING {}
            "#,
            BOOKING_RETURNING
        );
        let booking = sqlx::query_as::<_, BookingRecord>(&sql)
            .bind(booking_id)
            .bind(start)
            .bind(end)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::Conflict("Booking was modified concurrently".to_string()))?;

        tracing::info!(booking_id = %booking_id, start = %start, "Booking rescheduled");

        if let Some(billing) = self.billing.as_deref() {
            if let Err(e) = billing.checkout.expire_open_for_booking(booking_id).await {
                tracing::warn!(booking_id = %booking_id, error = %e, "Failed to expire checkout sessions");
            }
            billing.bills.reschedule_for_booking(&booking).await?;
        }

        self.calendar.on_booking_updated(booking_id).await;

        Ok(booking)
    }

    pub async fn refund(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
        reason: Option<&str>,
    ) -> ApiResult<RefundResult> {
        let reason = reason.unwrap_or("requested_by_customer");
        Ok(self
            .billing()?
            .refund
            .refund_booking(user_id, booking_id, reason)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use time::macros::datetime;

    #[test]
    fn test_confirm_only_from_pending() {
        assert_eq!(
            validate_transition(BookingStatus::Pending, BookingAction::Confirm).unwrap(),
            BookingStatus::Scheduled
        );
        assert!(validate_transition(BookingStatus::Scheduled, BookingAction::Confirm).is_err());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for status in [BookingStatus::Canceled, BookingStatus::Completed] {
            for action in [
                BookingAction::Confirm,
                BookingAction::Cancel,
                BookingAction::Reschedule,
            ] {
                let err = validate_transition(status, action).unwrap_err();
                assert!(matches!(err, BillingError::InvalidTransition { .. }));
            }
        }
    }

    #[test]
    fn test_cancel_and_reschedule_from_open_states() {
        for status in [BookingStatus::Pending, BookingStatus::Scheduled] {
            assert_eq!(
                validate_transition(status, BookingAction::Cancel).unwrap(),
                BookingStatus::Canceled
            );
            assert_eq!(
                validate_transition(status, BookingAction::Reschedule).unwrap(),
                status
            );
        }
    }

    #[test]
    fn test_invalid_transition_maps_to_bad_request() {
        let err = validate_transition(BookingStatus::Canceled, BookingAction::Cancel).unwrap_err();
        let api: ApiError = err.into();
        assert_eq!(api.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(api.to_string(), "Cannot cancel a booking that is canceled");
    }

    #[test]
    fn test_single_booking_is_one_element_series() {
        let request = CreateBookingRequest {
            client_id: Uuid::new_v4(),
            start_local: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            duration_minutes: 50,
            notes: None,
            recurrence: None,
        };
        assert_eq!(request.series(), (RecurrencePattern::Weekly, 1));
    }

    #[test]
    fn test_create_request_deserializes() {
        let request: CreateBookingRequest = serde_json::from_value(serde_json::json!({
            "client_id": Uuid::nil(),
            "start_local": "2026-03-02T10:00:00",
            "duration_minutes": 50,
            "recurrence": {"pattern": "biweekly", "count": 6}
        }))
        .unwrap();
        assert_eq!(request.series(), (RecurrencePattern::Biweekly, 6));
    }

    #[test]
    fn test_format_when_uses_local_time() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let when = format_when(datetime!(2026-07-06 08:00 UTC), &tz);
        assert_eq!(when, "Monday 6 July 2026 at 10:00 CEST");
    }

    fn reschedule_to(duration_minutes: Option<i64>) -> RescheduleRequest {
        RescheduleRequest {
            start_local: NaiveDate::from_ymd_opt(2026, 3, 9)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            duration_minutes,
        }
    }

    #[test]
    fn test_reschedule_window_keeps_current_length() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let (start, end) = reschedule_window(&tz, &reschedule_to(None), 50).unwrap();
        assert_eq!(start, datetime!(2026-03-09 09:00 UTC));
        assert_eq!(end, datetime!(2026-03-09 09:50 UTC));
    }

    #[test]
    fn test_reschedule_window_rejects_oversized_duration() {
        let tz: Tz = "UTC".parse().unwrap();
        for minutes in [0, 24 * 60 + 1, 1_000_000_000_000, i64::MAX] {
            let err = reschedule_window(&tz, &reschedule_to(Some(minutes)), 50).unwrap_err();
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_create_with_huge_duration_is_bad_request() {
        let tz: Tz = "UTC".parse().unwrap();
        let request = CreateBookingRequest {
            client_id: Uuid::new_v4(),
            start_local: NaiveDate::from_ymd_opt(2026, 1, 5)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            duration_minutes: 1_000_000_000_000,
            notes: None,
            recurrence: None,
        };
        let (pattern, count) = request.series();
        let err: ApiError = generate_occurrences(
            request.start_local,
            request.duration_minutes,
            &tz,
            pattern,
            count,
        )
        .unwrap_err()
        .into();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
