//! Bills: one line-item charge per booking

use std::collections::BTreeSet;

use bookwell_shared::{BillStatus, InvoiceStatus, ScheduleAction};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::booking::BookingRecord;
use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceService;
use crate::schedule::ScheduleService;
use crate::settings::{scheduled_date_for, BillingSettings, SettingsService};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Bill {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: BillStatus,
    pub invoice_id: Option<Uuid>,
    pub due_date: Option<Date>,
    pub sent_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

pub(crate) const BILL_COLUMNS: &str = "id, booking_id, user_id, client_id, amount_cents, \
     currency, status, invoice_id, due_date, sent_at, paid_at, created_at, updated_at";

/// What gets written when a booking is billed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillPlan {
    pub amount_cents: i64,
    pub currency: String,
    pub due_date: Date,
    pub action: ScheduleAction,
}

pub fn plan_bill(
    start_time: OffsetDateTime,
    end_time: OffsetDateTime,
    settings: &BillingSettings,
) -> BillingResult<BillPlan> {
    Ok(BillPlan {
        amount_cents: settings.amount_cents,
        currency: settings.currency.clone(),
        due_date: scheduled_date_for(settings, start_time, end_time)?,
        action: settings.schedule_action(),
    })
}

/// The bill a refund applies to: the most recently paid one
pub fn select_refundable_bill(booking_id: Uuid, bills: &[Bill]) -> BillingResult<&Bill> {
    bills
        .iter()
        .filter(|b| b.status == BillStatus::Paid)
        .max_by_key(|b| b.paid_at.unwrap_or(b.updated_at))
        .ok_or(BillingError::NoPaidBill(booking_id))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancellationPlan {
    pub cancel_bill_ids: Vec<Uuid>,
    /// Invoices that lose a bill and need their totals recomputed
    pub affected_invoice_ids: Vec<Uuid>,
}

/// Open bills get canceled and unlinked; paid, disputed and refunded bills
/// are left alone.
pub fn plan_cancellation(bills: &[Bill]) -> CancellationPlan {
    let mut invoices = BTreeSet::new();
    let mut cancel_bill_ids = Vec::new();
    for bill in bills.iter().filter(|b| b.status.is_open()) {
        cancel_bill_ids.push(bill.id);
        if let Some(invoice_id) = bill.invoice_id {
            invoices.insert(invoice_id);
        }
    }
    CancellationPlan {
        cancel_bill_ids,
        affected_invoice_ids: invoices.into_iter().collect(),
    }
}

/// Affected invoices the client has already been sent. Their open checkout
/// sessions still carry the pre-cancellation total.
pub fn issued_invoices(plan: &CancellationPlan, statuses: &[(Uuid, InvoiceStatus)]) -> Vec<Uuid> {
    plan.affected_invoice_ids
        .iter()
        .copied()
        .filter(|id| {
            statuses
                .iter()
                .any(|(invoice_id, status)| invoice_id == id && *status == InvoiceStatus::Issued)
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CancellationOutcome {
    pub bills_canceled: usize,
    pub invoices_recomputed: usize,
    pub invoices_canceled: usize,
}

#[derive(Clone)]
pub struct BillService {
    pool: PgPool,
    settings: SettingsService,
    schedule: ScheduleService,
}

impl BillService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            settings: SettingsService::new(pool.clone()),
            schedule: ScheduleService::new(pool.clone()),
            pool,
        }
    }

    /// Bill a booking using its resolved settings. `None` when the
    /// practitioner has not configured billing.
    pub async fn create_for_booking(&self, booking: &BookingRecord) -> BillingResult<Option<Bill>> {
        let Some(settings) = self
            .settings
            .try_resolve_for_booking(booking.user_id, booking.client_id, booking.id)
            .await?
        else {
            tracing::debug!(booking_id = %booking.id, "No billing settings, booking not billed");
            return Ok(None);
        };

        let plan = plan_bill(booking.start_time, booking.end_time, &settings)?;
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO bills (booking_id, user_id, client_id, amount_cents, currency, status, due_date)
            VALUES ($1, $2, $3, $4, $5, 'scheduled', $6)
            RETURNING {}
            "#,
            BILL_COLUMNS
        );
        let bill = sqlx::query_as::<_, Bill>(&sql)
            .bind(booking.id)
            .bind(booking.user_id)
            .bind(booking.client_id)
            .bind(plan.amount_cents)
            .bind(&plan.currency)
            .bind(plan.due_date)
            .fetch_one(&mut *tx)
            .await?;

        ScheduleService::enqueue_tx(&mut tx, booking.id, bill.id, plan.action, plan.due_date)
            .await?;

        tx.commit().await?;

        tracing::info!(
            booking_id = %booking.id,
            bill_id = %bill.id,
            amount_cents = bill.amount_cents,
            scheduled_date = %plan.due_date,
            action = %plan.action,
            "Bill scheduled"
        );

        Ok(Some(bill))
    }

    pub async fn list_for_booking(&self, booking_id: Uuid) -> BillingResult<Vec<Bill>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_for_booking_in(&mut conn, booking_id, false).await
    }

    async fn list_for_booking_in(
        conn: &mut PgConnection,
        booking_id: Uuid,
        lock: bool,
    ) -> BillingResult<Vec<Bill>> {
        let sql = format!(
            "SELECT {} FROM bills WHERE booking_id = $1 ORDER BY created_at{}",
            BILL_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        Ok(sqlx::query_as::<_, Bill>(&sql)
            .bind(booking_id)
            .fetch_all(&mut *conn)
            .await?)
    }

    pub async fn paid_bill_for_booking(&self, booking_id: Uuid) -> BillingResult<Bill> {
        let bills = self.list_for_booking(booking_id).await?;
        select_refundable_bill(booking_id, &bills).cloned()
    }

    /// Issued invoices that canceling this booking would shrink or cancel
    pub async fn issued_invoices_for_booking(&self, booking_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let bills = self.list_for_booking(booking_id).await?;
        let plan = plan_cancellation(&bills);
        if plan.affected_invoice_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, status FROM invoices WHERE id = ANY($1)")
                .bind(&plan.affected_invoice_ids)
                .fetch_all(&self.pool)
                .await?;
        let statuses = rows
            .into_iter()
            .map(|(id, status)| -> BillingResult<(Uuid, InvoiceStatus)> {
                Ok((id, status.parse()?))
            })
            .collect::<BillingResult<Vec<_>>>()?;

        Ok(issued_invoices(&plan, &statuses))
    }

    /// Cancel the open bills of a booking, drop its pending schedule rows and
    /// fix up any invoice those bills were on.
    pub async fn cancel_for_booking(&self, booking_id: Uuid) -> BillingResult<CancellationOutcome> {
        let mut tx = self.pool.begin().await?;

        let bills = Self::list_for_booking_in(&mut tx, booking_id, true).await?;
        let plan = plan_cancellation(&bills);

        if !plan.cancel_bill_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE bills SET status = 'canceled', invoice_id = NULL, updated_at = NOW()
                WHERE id = ANY($1)
                "#,
            )
            .bind(&plan.cancel_bill_ids)
            .execute(&mut *tx)
            .await?;
        }

        ScheduleService::remove_pending_for_booking_tx(&mut tx, booking_id).await?;

        let mut outcome = CancellationOutcome {
            bills_canceled: plan.cancel_bill_ids.len(),
            ..Default::default()
        };

        for invoice_id in &plan.affected_invoice_ids {
            InvoiceService::recompute_totals_in(&mut tx, *invoice_id).await?;
            outcome.invoices_recomputed += 1;
            if InvoiceService::cancel_if_empty_in(&mut tx, *invoice_id).await? {
                outcome.invoices_canceled += 1;
                tracing::info!(invoice_id = %invoice_id, "Invoice canceled after losing its last bill");
            }
        }

        tx.commit().await?;

        tracing::info!(
            booking_id = %booking_id,
            bills_canceled = outcome.bills_canceled,
            invoices_recomputed = outcome.invoices_recomputed,
            "Bills canceled for booking"
        );

        Ok(outcome)
    }

    /// Recompute due dates after a booking moved
    pub async fn reschedule_for_booking(&self, booking: &BookingRecord) -> BillingResult<Option<Date>> {
        let Some(settings) = self
            .settings
            .try_resolve_for_booking(booking.user_id, booking.client_id, booking.id)
            .await?
        else {
            return Ok(None);
        };

        let due_date = scheduled_date_for(&settings, booking.start_time, booking.end_time)?;

        sqlx::query(
            r#"
            UPDATE bills SET due_date = $2, updated_at = NOW()
            WHERE booking_id = $1 AND status IN ('scheduled', 'pending') AND invoice_id IS NULL
            "#,
        )
        .bind(booking.id)
        .bind(due_date)
        .execute(&self.pool)
        .await?;

        let moved = self
            .schedule
            .reschedule_for_booking(booking.id, due_date)
            .await?;

        tracing::info!(
            booking_id = %booking.id,
            scheduled_date = %due_date,
            schedule_rows = moved,
            "Bill schedule moved"
        );

        Ok(Some(due_date))
    }

    /// Bill → `sent` once it has gone out with a payment link
    pub async fn mark_sent(&self, bill_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE bills SET status = 'sent', sent_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'pending')
            "#,
        )
        .bind(bill_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open, uninvoiced bills of a booking become paid
    pub async fn mark_paid_for_booking_in(
        conn: &mut PgConnection,
        booking_id: Uuid,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bills SET status = 'paid', paid_at = NOW(), updated_at = NOW()
            WHERE booking_id = $1 AND status IN ('scheduled', 'pending', 'sent')
              AND invoice_id IS NULL
            "#,
        )
        .bind(booking_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Paid → refunded, before the money moves. False when another request
    /// already took the bill.
    pub async fn claim_for_refund(&self, bill_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE bills SET status = 'refunded', updated_at = NOW() WHERE id = $1 AND status = 'paid'",
        )
        .bind(bill_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Undo [`claim_for_refund`](Self::claim_for_refund) after Stripe refused the refund
    pub async fn release_refund_claim(&self, bill_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE bills SET status = 'paid', updated_at = NOW() WHERE id = $1 AND status = 'refunded'",
        )
        .bind(bill_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;

    pub(crate) fn bill(status: BillStatus, invoice_id: Option<Uuid>) -> Bill {
        Bill {
            id: Uuid::new_v4(),
            booking_id: Uuid::nil(),
            user_id: Uuid::nil(),
            client_id: Uuid::nil(),
            amount_cents: 10_000,
            currency: "usd".to_string(),
            status,
            invoice_id,
            due_date: None,
            sent_at: None,
            paid_at: None,
            created_at: datetime!(2026-01-01 0:00 UTC),
            updated_at: datetime!(2026-01-01 0:00 UTC),
        }
    }

    #[test]
    fn test_plan_cancellation_only_touches_open_bills() {
        let invoice = Uuid::new_v4();
        let bills = vec![
            bill(BillStatus::Scheduled, None),
            bill(BillStatus::Sent, Some(invoice)),
            bill(BillStatus::Pending, Some(invoice)),
            bill(BillStatus::Paid, Some(Uuid::new_v4())),
            bill(BillStatus::Refunded, None),
        ];

        let plan = plan_cancellation(&bills);
        assert_eq!(plan.cancel_bill_ids, vec![bills[0].id, bills[1].id, bills[2].id]);
        assert_eq!(plan.affected_invoice_ids, vec![invoice]);
    }

    #[test]
    fn test_select_refundable_bill_picks_latest_paid() {
        let mut older = bill(BillStatus::Paid, None);
        older.paid_at = Some(datetime!(2026-02-01 0:00 UTC));
        let mut newer = bill(BillStatus::Paid, None);
        newer.paid_at = Some(datetime!(2026-03-01 0:00 UTC));
        let bills = vec![older, bill(BillStatus::Sent, None), newer.clone()];

        let chosen = select_refundable_bill(Uuid::nil(), &bills).unwrap();
        assert_eq!(chosen.id, newer.id);
    }
}
