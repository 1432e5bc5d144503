//! Daily processing of per-booking bills that have come due

use serde::Serialize;
use sqlx::PgPool;
use time::Date;
use uuid::Uuid;

use crate::bills::BillService;
use crate::checkout::CheckoutService;
use crate::client::StripeClient;
use crate::email::{format_amount, BillingEmailService, BulkSendReport, EmailMessage};
use crate::error::BillingResult;
use crate::schedule::{group_due, DueItem, ScheduleService};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DueBillsReport {
    pub due: usize,
    pub processed: usize,
    pub failed: usize,
    pub emails: BulkSendReport,
}

#[derive(Clone)]
pub struct BillingRunner {
    pool: PgPool,
    bills: BillService,
    checkout: CheckoutService,
    schedule: ScheduleService,
    email: BillingEmailService,
}

impl BillingRunner {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            bills: BillService::new(pool.clone()),
            checkout: CheckoutService::new(stripe, pool.clone()),
            schedule: ScheduleService::new(pool.clone()),
            pool,
            email,
        }
    }

    /// Send every consultation bill due on or before `today`
    pub async fn run_due_bills(&self, today: Date) -> BillingResult<DueBillsReport> {
        let rows = self.schedule.due(today).await?;
        self.run_rows(rows).await
    }

    pub async fn run_due_bills_for_user(
        &self,
        user_id: Uuid,
        today: Date,
    ) -> BillingResult<DueBillsReport> {
        let rows = self.schedule.due_for_user(user_id, today).await?;
        self.run_rows(rows).await
    }

    async fn run_rows(&self, rows: Vec<DueItem>) -> BillingResult<DueBillsReport> {
        let work = group_due(rows)?;
        let mut report = DueBillsReport {
            due: work.consultation.len(),
            ..Default::default()
        };
        let mut messages = Vec::new();

        for item in work.consultation {
            match self.process_consultation(&item).await {
                Ok(message) => {
                    report.processed += 1;
                    messages.extend(message);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        schedule_id = %item.schedule_id,
                        booking_id = %item.booking_id,
                        error = %e,
                        "Failed to send due bill"
                    );
                    if let Err(err) = self
                        .schedule
                        .record_failure(item.schedule_id, &e.to_string())
                        .await
                    {
                        tracing::error!(schedule_id = %item.schedule_id, error = %err, "Failed to record schedule failure");
                    }
                }
            }
        }

        report.emails = self.email.send_bulk(&messages).await;

        tracing::info!(
            due = report.due,
            processed = report.processed,
            failed = report.failed,
            "Due bill run finished"
        );

        Ok(report)
    }

    /// Bill → sent with a fresh checkout link. Returns the email to send.
    pub async fn process_consultation(&self, item: &DueItem) -> BillingResult<Option<EmailMessage>> {
        let Some(bill_id) = item.bill_id else {
            self.schedule.mark_processed(&[item.schedule_id]).await?;
            return Ok(None);
        };

        let checkout = self
            .checkout
            .create_for_booking(item.user_id, item.booking_id)
            .await?;
        self.bills.mark_sent(bill_id).await?;
        self.schedule.mark_processed(&[item.schedule_id]).await?;

        let Some(client_email) = item.client_email.as_deref() else {
            tracing::warn!(booking_id = %item.booking_id, "Client has no email, bill sent without notification");
            return Ok(None);
        };

        let practitioner: String = sqlx::query_scalar(
            "SELECT COALESCE(business_name, full_name, email) FROM users WHERE id = $1",
        )
        .bind(item.user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(EmailMessage::bill_due(
            client_email,
            &item.client_name,
            &practitioner,
            &item.start_time.date().to_string(),
            &format_amount(checkout.amount_cents, &checkout.currency),
            &checkout.checkout_url,
        )))
    }
}
