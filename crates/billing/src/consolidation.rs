//! Monthly consolidation of recurring bills into one invoice per client
//!
//! A run links every open, uninvoiced bill of the month to the client's draft
//! invoice and recomputes its totals. The practitioner gets one summary email
//! per invoice per run, and only when the run actually linked something.

use std::collections::HashSet;

use bookwell_shared::{first_of_next_month, month_period, BillStatus};
use serde::Serialize;
use sqlx::PgPool;
use time::Date;
use uuid::Uuid;

use crate::email::{format_amount, BillingEmailService, BulkSendReport, EmailMessage};
use crate::error::BillingResult;
use crate::invoices::{InvoiceService, InvoiceTotals};
use crate::schedule::{group_due, MonthlyKey, ScheduleService};
use crate::settings::SettingsService;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EligibleBill {
    pub bill_id: Uuid,
    pub invoice_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub status: BillStatus,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationPlan {
    pub new_links: Vec<Uuid>,
    pub already_linked: usize,
    /// Pre-tax sum of everything on the invoice once the plan is applied
    pub total_cents: i64,
    pub should_email: bool,
}

/// Decide which candidate bills join the invoice.
///
/// `existing` are the bills already on the invoice. Candidates that are not
/// open, already belong to an invoice, or are already linked are skipped.
pub fn plan_links(existing: &[EligibleBill], candidates: &[EligibleBill]) -> ConsolidationPlan {
    let active_existing: Vec<&EligibleBill> = existing
        .iter()
        .filter(|b| b.status != BillStatus::Canceled)
        .collect();
    let linked: HashSet<Uuid> = active_existing.iter().map(|b| b.bill_id).collect();

    let mut seen = HashSet::new();
    let new: Vec<&EligibleBill> = candidates
        .iter()
        .filter(|b| b.status.is_open() && b.invoice_id.is_none())
        .filter(|b| !linked.contains(&b.bill_id))
        .filter(|b| seen.insert(b.bill_id))
        .collect();

    let total_cents = active_existing.iter().map(|b| b.amount_cents).sum::<i64>()
        + new.iter().map(|b| b.amount_cents).sum::<i64>();

    ConsolidationPlan {
        should_email: !new.is_empty(),
        new_links: new.into_iter().map(|b| b.bill_id).collect(),
        already_linked: active_existing.len(),
        total_cents,
    }
}

/// Whether this plan earns its invoice a summary email, recording the send
/// in `emailed` so later groups of the same run resolving to that invoice skip it
pub fn should_send_summary(
    plan: &ConsolidationPlan,
    invoice_id: Uuid,
    emailed: &mut HashSet<Uuid>,
) -> bool {
    plan.should_email && emailed.insert(invoice_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthOutcome {
    pub key: MonthlyKey,
    pub invoice_id: Uuid,
    pub new_links: usize,
    pub totals: InvoiceTotals,
    pub emailed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationRunReport {
    pub groups: usize,
    pub invoices_updated: usize,
    pub bills_linked: usize,
    pub failures: usize,
    pub emails: BulkSendReport,
    pub outcomes: Vec<MonthOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationPreview {
    pub client_id: Uuid,
    pub client_name: String,
    pub period_start: Date,
    pub draft_invoice_id: Option<Uuid>,
    pub plan: ConsolidationPlan,
}

#[derive(sqlx::FromRow)]
struct Recipient {
    practitioner_email: String,
    client_name: String,
}

#[derive(Clone)]
pub struct ConsolidationService {
    pool: PgPool,
    schedule: ScheduleService,
    settings: SettingsService,
    email: BillingEmailService,
}

impl ConsolidationService {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            schedule: ScheduleService::new(pool.clone()),
            settings: SettingsService::new(pool.clone()),
            pool,
            email,
        }
    }

    async fn candidates(
        &self,
        conn: &mut sqlx::PgConnection,
        key: &MonthlyKey,
        lock: bool,
    ) -> BillingResult<Vec<EligibleBill>> {
        let next = first_of_next_month(key.period_start)?;
        let sql = format!(
            r#"
            SELECT bl.id AS bill_id, bl.invoice_id, bl.status, bl.amount_cents
            FROM bills bl
            JOIN bookings b ON b.id = bl.booking_id
            WHERE bl.user_id = $1 AND bl.client_id = $2
              AND bl.invoice_id IS NULL
              AND bl.status IN {}
              AND b.status <> 'canceled'
              AND b.start_time >= $3::DATE
              AND b.start_time < $4::DATE
            ORDER BY b.start_time
            {}
            "#,
            BillStatus::OPEN_SQL,
            if lock { "FOR UPDATE OF bl" } else { "" }
        );
        Ok(sqlx::query_as::<_, EligibleBill>(&sql)
            .bind(key.user_id)
            .bind(key.client_id)
            .bind(key.period_start)
            .bind(next)
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Consolidate one (user, client, month). `emailed` carries the invoices
    /// already emailed in this run; the returned message is `None` when no
    /// email should go out.
    pub async fn consolidate_month(
        &self,
        key: MonthlyKey,
        schedule_ids: &[Uuid],
        emailed: &mut HashSet<Uuid>,
    ) -> BillingResult<(MonthOutcome, Option<EmailMessage>)> {
        let (period_start, period_end) = month_period(key.period_start)?;

        // client-level settings decide currency and tax for the invoice
        let settings = self
            .settings
            .try_resolve_for_booking(key.user_id, key.client_id, Uuid::nil())
            .await?;
        let (currency, tax_rate_bps) = settings
            .map(|s| (s.currency, s.tax_rate_bps))
            .unwrap_or_else(|| ("usd".to_string(), 0));

        let mut tx = self.pool.begin().await?;

        let invoice = InvoiceService::find_or_create_draft_tx(
            &mut tx,
            key.user_id,
            key.client_id,
            period_start,
            period_end,
            &currency,
            tax_rate_bps,
        )
        .await?;

        let existing: Vec<EligibleBill> = sqlx::query_as(
            "SELECT id AS bill_id, invoice_id, status, amount_cents FROM bills WHERE invoice_id = $1",
        )
        .bind(invoice.id)
        .fetch_all(&mut *tx)
        .await?;
        let candidates = self.candidates(&mut tx, &key, true).await?;
        let plan = plan_links(&existing, &candidates);

        if !plan.new_links.is_empty() {
            sqlx::query(
                r#"
                UPDATE bills SET invoice_id = $1, status = 'pending', updated_at = NOW()
                WHERE id = ANY($2) AND invoice_id IS NULL
                "#,
            )
            .bind(invoice.id)
            .bind(&plan.new_links)
            .execute(&mut *tx)
            .await?;
        }

        let totals = InvoiceService::recompute_totals_in(&mut tx, invoice.id).await?;

        sqlx::query(
            r#"
            UPDATE billing_schedules
            SET status = 'processed', processed_at = NOW(), last_error = NULL
            WHERE status = 'pending' AND (id = ANY($1) OR bill_id = ANY($2))
            "#,
        )
        .bind(schedule_ids)
        .bind(&plan.new_links)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let message = if should_send_summary(&plan, invoice.id, emailed) {
            self.summary_email(&key, invoice.id, &plan, &totals, &currency)
                .await?
        } else {
            None
        };

        tracing::info!(
            user_id = %key.user_id,
            client_id = %key.client_id,
            period_start = %key.period_start,
            invoice_id = %invoice.id,
            new_links = plan.new_links.len(),
            total_cents = totals.total_cents,
            email = message.is_some(),
            "Consolidated monthly invoice"
        );

        Ok((
            MonthOutcome {
                key,
                invoice_id: invoice.id,
                new_links: plan.new_links.len(),
                totals,
                emailed: message.is_some(),
            },
            message,
        ))
    }

    async fn summary_email(
        &self,
        key: &MonthlyKey,
        invoice_id: Uuid,
        plan: &ConsolidationPlan,
        totals: &InvoiceTotals,
        currency: &str,
    ) -> BillingResult<Option<EmailMessage>> {
        let recipient: Option<Recipient> = sqlx::query_as(
            r#"
            SELECT u.email AS practitioner_email, c.name AS client_name
            FROM users u JOIN clients c ON c.user_id = u.id
            WHERE u.id = $1 AND c.id = $2
            "#,
        )
        .bind(key.user_id)
        .bind(key.client_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(recipient.map(|r| {
            let period_label = format!("{} {}", key.period_start.month(), key.period_start.year());
            EmailMessage::invoice_consolidated(
                &r.practitioner_email,
                &r.client_name,
                &period_label,
                plan.already_linked + plan.new_links.len(),
                &format_amount(totals.total_cents, currency),
                &self.email.link(&format!("/billing/invoices/{}", invoice_id)),
            )
        }))
    }

    /// Consolidate every due monthly group
    pub async fn run(&self, today: Date) -> BillingResult<ConsolidationRunReport> {
        let rows = self.schedule.due(today).await?;
        self.run_rows(rows).await
    }

    /// Same as [`Self::run`] restricted to one practitioner
    pub async fn run_for_user(
        &self,
        user_id: Uuid,
        today: Date,
    ) -> BillingResult<ConsolidationRunReport> {
        let rows = self.schedule.due_for_user(user_id, today).await?;
        self.run_rows(rows).await
    }

    async fn run_rows(
        &self,
        rows: Vec<crate::schedule::DueItem>,
    ) -> BillingResult<ConsolidationRunReport> {
        let work = group_due(rows)?;
        let mut report = ConsolidationRunReport {
            groups: work.monthly.len(),
            ..Default::default()
        };
        let mut emailed = HashSet::new();
        let mut messages = Vec::new();

        for (key, items) in work.monthly {
            let ids: Vec<Uuid> = items.iter().map(|i| i.schedule_id).collect();
            match self.consolidate_month(key, &ids, &mut emailed).await {
                Ok((outcome, message)) => {
                    report.invoices_updated += 1;
                    report.bills_linked += outcome.new_links;
                    report.outcomes.push(outcome);
                    messages.extend(message);
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::error!(
                        user_id = %key.user_id,
                        client_id = %key.client_id,
                        period_start = %key.period_start,
                        error = %e,
                        "Monthly consolidation failed"
                    );
                    for id in ids {
                        if let Err(err) = self.schedule.record_failure(id, &e.to_string()).await {
                            tracing::error!(schedule_id = %id, error = %err, "Failed to record schedule failure");
                        }
                    }
                }
            }
        }

        report.emails = self.email.send_bulk(&messages).await;
        Ok(report)
    }

    /// Dry run for one month: what a consolidation would link, per client
    pub async fn preview(
        &self,
        user_id: Uuid,
        period_start: Date,
    ) -> BillingResult<Vec<ConsolidationPreview>> {
        let (period_start, _) = month_period(period_start)?;
        let next = first_of_next_month(period_start)?;

        let clients: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT c.id, c.name
            FROM bills bl
            JOIN bookings b ON b.id = bl.booking_id
            JOIN clients c ON c.id = bl.client_id
            WHERE bl.user_id = $1
              AND b.start_time >= $2::DATE AND b.start_time < $3::DATE
              AND bl.status <> 'canceled'
            ORDER BY c.name
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .bind(next)
        .fetch_all(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        let mut previews = Vec::with_capacity(clients.len());

        for (client_id, client_name) in clients {
            let key = MonthlyKey {
                user_id,
                client_id,
                period_start,
            };
            let draft: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM invoices WHERE user_id = $1 AND client_id = $2 \
                 AND period_start = $3 AND status = 'draft'",
            )
            .bind(user_id)
            .bind(client_id)
            .bind(period_start)
            .fetch_optional(&mut *conn)
            .await?;

            let existing: Vec<EligibleBill> = match draft {
                Some(invoice_id) => sqlx::query_as(
                    "SELECT id AS bill_id, invoice_id, status, amount_cents FROM bills WHERE invoice_id = $1",
                )
                .bind(invoice_id)
                .fetch_all(&mut *conn)
                .await?,
                None => Vec::new(),
            };
            let candidates = self.candidates(&mut conn, &key, false).await?;

            previews.push(ConsolidationPreview {
                client_id,
                client_name,
                period_start,
                draft_invoice_id: draft,
                plan: plan_links(&existing, &candidates),
            });
        }

        Ok(previews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eligible(status: BillStatus, invoice_id: Option<Uuid>, amount: i64) -> EligibleBill {
        EligibleBill {
            bill_id: Uuid::new_v4(),
            invoice_id,
            status,
            amount_cents: amount,
        }
    }

    #[test]
    fn test_plan_links_new_bills() {
        let candidates = vec![
            eligible(BillStatus::Scheduled, None, 10_000),
            eligible(BillStatus::Pending, None, 10_000),
        ];
        let plan = plan_links(&[], &candidates);
        assert_eq!(plan.new_links.len(), 2);
        assert_eq!(plan.total_cents, 20_000);
        assert!(plan.should_email);
    }

    #[test]
    fn test_plan_links_nothing_new_skips_email() {
        let invoice = Uuid::new_v4();
        let linked = eligible(BillStatus::Pending, Some(invoice), 10_000);
        let plan = plan_links(std::slice::from_ref(&linked), &[]);
        assert!(plan.new_links.is_empty());
        assert_eq!(plan.already_linked, 1);
        assert_eq!(plan.total_cents, 10_000);
        assert!(!plan.should_email);
    }

    #[test]
    fn test_plan_links_skips_closed_and_foreign_bills() {
        let other_invoice = Uuid::new_v4();
        let candidates = vec![
            eligible(BillStatus::Paid, None, 1),
            eligible(BillStatus::Canceled, None, 2),
            eligible(BillStatus::Sent, Some(other_invoice), 4),
            eligible(BillStatus::Sent, None, 8),
        ];
        let plan = plan_links(&[], &candidates);
        assert_eq!(plan.new_links, vec![candidates[3].bill_id]);
        assert_eq!(plan.total_cents, 8);
    }

    #[test]
    fn test_plan_links_ignores_duplicates_and_canceled_existing() {
        let invoice = Uuid::new_v4();
        let canceled = eligible(BillStatus::Canceled, Some(invoice), 500);
        let fresh = eligible(BillStatus::Scheduled, None, 100);
        let plan = plan_links(&[canceled], &[fresh.clone(), fresh.clone()]);
        assert_eq!(plan.new_links, vec![fresh.bill_id]);
        assert_eq!(plan.already_linked, 0);
        assert_eq!(plan.total_cents, 100);
    }
}
