//! Billing schedule queue
//!
//! Rows say "do this bill action on date X". Nothing pushes them; the daily
//! scan picks up every pending row whose date has arrived.

use std::collections::BTreeMap;

use bookwell_shared::{month_period, ScheduleAction, ScheduleStatus};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Attempts before a row is parked as `failed`
pub const MAX_RETRIES: i32 = 5;

/// A due schedule row joined with its booking, client and bill
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DueItem {
    pub schedule_id: Uuid,
    pub booking_id: Uuid,
    pub bill_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub action_type: ScheduleAction,
    pub scheduled_date: Date,
    pub retry_count: i32,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub client_name: String,
    pub client_email: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

/// Consolidation group: one practitioner, one client, one calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MonthlyKey {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub period_start: Date,
}

#[derive(Debug, Default)]
pub struct DueWork {
    pub consultation: Vec<DueItem>,
    pub monthly: BTreeMap<MonthlyKey, Vec<DueItem>>,
}

impl DueWork {
    pub fn is_empty(&self) -> bool {
        self.consultation.is_empty() && self.monthly.is_empty()
    }
}

/// Split due rows into per-booking work and monthly groups keyed by the
/// month the booking falls in.
pub fn group_due(rows: Vec<DueItem>) -> BillingResult<DueWork> {
    let mut work = DueWork::default();
    for row in rows {
        match row.action_type {
            ScheduleAction::SendBill => work.consultation.push(row),
            ScheduleAction::ConsolidateInvoice => {
                let (period_start, _) = month_period(row.start_time.date())?;
                let key = MonthlyKey {
                    user_id: row.user_id,
                    client_id: row.client_id,
                    period_start,
                };
                work.monthly.entry(key).or_default().push(row);
            }
        }
    }
    Ok(work)
}

/// Retry count and status after one more failed attempt
pub fn next_failure_state(retry_count: i32) -> (i32, ScheduleStatus) {
    let next = retry_count.saturating_add(1);
    if next >= MAX_RETRIES {
        (next, ScheduleStatus::Failed)
    } else {
        (next, ScheduleStatus::Pending)
    }
}

const DUE_SELECT: &str = r#"
    SELECT s.id AS schedule_id, s.booking_id, s.bill_id, s.action_type, s.scheduled_date,
           s.retry_count, b.user_id, b.client_id, b.start_time, b.end_time,
           c.name AS client_name, c.email AS client_email,
           bl.amount_cents, bl.currency
    FROM billing_schedules s
    JOIN bookings b ON b.id = s.booking_id
    JOIN clients c ON c.id = b.client_id
    LEFT JOIN bills bl ON bl.id = s.bill_id
    WHERE s.status = 'pending'
      AND s.scheduled_date <= $1
      AND b.status <> 'canceled'
"#;

#[derive(Clone)]
pub struct ScheduleService {
    pool: PgPool,
}

impl ScheduleService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue_tx(
        conn: &mut PgConnection,
        booking_id: Uuid,
        bill_id: Uuid,
        action: ScheduleAction,
        scheduled_date: Date,
    ) -> BillingResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO billing_schedules (booking_id, bill_id, action_type, scheduled_date)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(booking_id)
        .bind(bill_id)
        .bind(action.as_str())
        .bind(scheduled_date)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    pub async fn due(&self, today: Date) -> BillingResult<Vec<DueItem>> {
        let sql = format!("{} ORDER BY s.scheduled_date, b.start_time", DUE_SELECT);
        Ok(sqlx::query_as::<_, DueItem>(&sql)
            .bind(today)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn due_for_user(&self, user_id: Uuid, today: Date) -> BillingResult<Vec<DueItem>> {
        let sql = format!(
            "{} AND b.user_id = $2 ORDER BY s.scheduled_date, b.start_time",
            DUE_SELECT
        );
        Ok(sqlx::query_as::<_, DueItem>(&sql)
            .bind(today)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn mark_processed(&self, ids: &[Uuid]) -> BillingResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE billing_schedules
            SET status = 'processed', processed_at = NOW(), last_error = NULL
            WHERE id = ANY($1) AND status = 'pending'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Count a failed attempt; the row stays pending until it runs out of retries
    pub async fn record_failure(&self, id: Uuid, error: &str) -> BillingResult<ScheduleStatus> {
        let mut tx = self.pool.begin().await?;

        let current: i32 = sqlx::query_scalar(
            "SELECT retry_count FROM billing_schedules WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Schedule row {} not found", id)))?;

        let (retry_count, status) = next_failure_state(current);

        sqlx::query(
            "UPDATE billing_schedules SET retry_count = $2, status = $3, last_error = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(retry_count)
        .bind(status.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if status == ScheduleStatus::Failed {
            tracing::error!(
                schedule_id = %id,
                retry_count = retry_count,
                error = %error,
                "Billing schedule row gave up after max retries"
            );
        } else {
            tracing::warn!(
                schedule_id = %id,
                retry_count = retry_count,
                error = %error,
                "Billing schedule row failed, will retry"
            );
        }

        Ok(status)
    }

    /// Move every pending row of a booking to a new date
    pub async fn reschedule_for_booking(
        &self,
        booking_id: Uuid,
        scheduled_date: Date,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billing_schedules
            SET scheduled_date = $2, retry_count = 0, last_error = NULL
            WHERE booking_id = $1 AND status = 'pending'
            "#,
        )
        .bind(booking_id)
        .bind(scheduled_date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn remove_pending_for_booking_tx(
        conn: &mut PgConnection,
        booking_id: Uuid,
    ) -> BillingResult<u64> {
        let result =
            sqlx::query("DELETE FROM billing_schedules WHERE booking_id = $1 AND status = 'pending'")
                .bind(booking_id)
                .execute(&mut *conn)
                .await?;
        Ok(result.rows_affected())
    }
}
