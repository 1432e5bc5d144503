//! Billing consistency checks
//!
//! Read-only SQL checks that can run after a replay, a manual fix, or on a
//! nightly schedule. Each violation carries enough context to find the rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Practitioners whose data is affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is being collected or reported incorrectly
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceTotalRow {
    invoice_id: Uuid,
    user_id: Uuid,
    status: String,
    subtotal_cents: i64,
    bills_total_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BookingBillRow {
    user_id: Uuid,
    booking_id: Uuid,
    bill_id: Uuid,
    bill_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CalendarEventRow {
    user_id: Uuid,
    booking_id: Uuid,
    booking_status: String,
    active_events: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledInvoiceLinkRow {
    user_id: Uuid,
    bill_id: Uuid,
    invoice_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidSessionRow {
    user_id: Uuid,
    session_id: Uuid,
    booking_id: Uuid,
    open_bills: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanScheduleRow {
    user_id: Uuid,
    schedule_id: Uuid,
    bill_id: Uuid,
    bill_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CurrencyMismatchRow {
    user_id: Uuid,
    invoice_id: Uuid,
    bill_id: Uuid,
    invoice_currency: String,
    bill_currency: String,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let summary =
            InvariantCheckSummary::from_violations(now, Self::available_checks().len(), violations);

        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Billing invariants healthy");
        } else {
            tracing::error!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }

        Ok(summary)
    }

    /// Open invoices must total exactly their non-canceled bills.
    async fn check_invoice_total_matches_bills(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvoiceTotalRow> = sqlx::query_as(
            r#"
            SELECT
                i.id AS invoice_id,
                i.user_id,
                i.status,
                i.subtotal_cents,
                COALESCE(SUM(b.amount_cents) FILTER (WHERE b.status <> 'canceled'), 0)::BIGINT
                    AS bills_total_cents
            FROM invoices i
            LEFT JOIN bills b ON b.invoice_id = i.id
            WHERE i.status IN ('draft', 'issued')
            GROUP BY i.id
            HAVING i.subtotal_cents <>
                COALESCE(SUM(b.amount_cents) FILTER (WHERE b.status <> 'canceled'), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_total_matches_bills".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Invoice {} ({}) subtotal is {} cents but its bills sum to {} cents",
                    row.invoice_id, row.status, row.subtotal_cents, row.bills_total_cents
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "subtotal_cents": row.subtotal_cents,
                    "bills_total_cents": row.bills_total_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A canceled booking must not leave a bill that can still be charged.
    async fn check_canceled_booking_open_bill(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BookingBillRow> = sqlx::query_as(
            r#"
            SELECT bk.user_id, bk.id AS booking_id, b.id AS bill_id, b.status AS bill_status
            FROM bookings bk
            JOIN bills b ON b.booking_id = bk.id
            WHERE bk.status = 'canceled'
              AND b.status IN ('scheduled', 'pending', 'sent')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_booking_open_bill".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Canceled booking {} still has a {} bill",
                    row.booking_id, row.bill_status
                ),
                context: serde_json::json!({
                    "booking_id": row.booking_id,
                    "bill_id": row.bill_id,
                    "bill_status": row.bill_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A booking has at most one active calendar event, and none once canceled.
    async fn check_single_active_calendar_event(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CalendarEventRow> = sqlx::query_as(
            r#"
            SELECT bk.user_id, bk.id AS booking_id, bk.status AS booking_status,
                   COUNT(ce.id) AS active_events
            FROM bookings bk
            JOIN calendar_events ce ON ce.booking_id = bk.id AND ce.status = 'active'
            GROUP BY bk.id
            HAVING COUNT(ce.id) > 1 OR bk.status = 'canceled'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_calendar_event".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Booking {} ({}) has {} active calendar event(s)",
                    row.booking_id, row.booking_status, row.active_events
                ),
                context: serde_json::json!({
                    "booking_id": row.booking_id,
                    "booking_status": row.booking_status,
                    "active_events": row.active_events,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// A bill may only stay linked to an invoice that is not canceled.
    async fn check_bill_single_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledInvoiceLinkRow> = sqlx::query_as(
            r#"
            SELECT b.user_id, b.id AS bill_id, i.id AS invoice_id
            FROM bills b
            JOIN invoices i ON i.id = b.invoice_id
            WHERE i.status = 'canceled'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "bill_single_invoice".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Bill {} is still linked to canceled invoice {}",
                    row.bill_id, row.invoice_id
                ),
                context: serde_json::json!({
                    "bill_id": row.bill_id,
                    "invoice_id": row.invoice_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A completed booking checkout must have marked the booking's bills paid.
    async fn check_paid_session_bill_paid(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidSessionRow> = sqlx::query_as(
            r#"
            SELECT ps.user_id, ps.id AS session_id, ps.booking_id, COUNT(b.id) AS open_bills
            FROM payment_sessions ps
            JOIN bills b ON b.booking_id = ps.booking_id
            WHERE ps.status = 'completed'
              AND ps.booking_id IS NOT NULL
              AND b.invoice_id IS NULL
              AND b.status IN ('scheduled', 'pending', 'sent')
            GROUP BY ps.user_id, ps.id, ps.booking_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_session_bill_paid".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Booking {} was paid but {} bill(s) are still open",
                    row.booking_id, row.open_bills
                ),
                context: serde_json::json!({
                    "payment_session_id": row.session_id,
                    "booking_id": row.booking_id,
                    "open_bills": row.open_bills,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Pending queue rows must point at bills that can still be acted on.
    async fn check_pending_schedule_open_bill(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanScheduleRow> = sqlx::query_as(
            r#"
            SELECT b.user_id, s.id AS schedule_id, b.id AS bill_id, b.status AS bill_status
            FROM billing_schedules s
            JOIN bills b ON b.id = s.bill_id
            WHERE s.status = 'pending'
              AND b.status IN ('canceled', 'refunded', 'paid')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_schedule_open_bill".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Pending schedule {} targets a {} bill",
                    row.schedule_id, row.bill_status
                ),
                context: serde_json::json!({
                    "schedule_id": row.schedule_id,
                    "bill_id": row.bill_id,
                    "bill_status": row.bill_status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_invoice_currency_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CurrencyMismatchRow> = sqlx::query_as(
            r#"
            SELECT i.user_id, i.id AS invoice_id, b.id AS bill_id,
                   i.currency AS invoice_currency, b.currency AS bill_currency
            FROM invoices i
            JOIN bills b ON b.invoice_id = i.id
            WHERE LOWER(i.currency) <> LOWER(b.currency)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_currency_consistent".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Invoice {} is in {} but bill {} is in {}",
                    row.invoice_id, row.invoice_currency, row.bill_id, row.bill_currency
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "bill_id": row.bill_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "invoice_total_matches_bills" => self.check_invoice_total_matches_bills().await,
            "canceled_booking_open_bill" => self.check_canceled_booking_open_bill().await,
            "single_active_calendar_event" => self.check_single_active_calendar_event().await,
            "bill_single_invoice" => self.check_bill_single_invoice().await,
            "paid_session_bill_paid" => self.check_paid_session_bill_paid().await,
            "pending_schedule_open_bill" => self.check_pending_schedule_open_bill().await,
            "invoice_currency_consistent" => self.check_invoice_currency_consistent().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "invoice_total_matches_bills",
            "canceled_booking_open_bill",
            "single_active_calendar_event",
            "bill_single_invoice",
            "paid_session_bill_paid",
            "pending_schedule_open_bill",
            "invoice_currency_consistent",
        ]
    }
}
