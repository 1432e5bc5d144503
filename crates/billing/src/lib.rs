// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries Stripe error strings
#![allow(clippy::too_many_arguments)] // Email builders take every template field
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Bookwell Billing Module
//!
//! Takes practitioners' session fees through Stripe Connect.
//!
//! ## Features
//!
//! - **Billing Settings**: per practitioner, client, or booking amounts and timing
//! - **Bills**: one per booking, queued on `billing_schedules`
//! - **Checkout**: direct charges on the practitioner's connected account
//! - **Consolidation**: recurring sessions roll up into one monthly invoice
//! - **Refunds**: full refund of the paid bill for a booking
//! - **Email Notifications**: bill due, invoice issued, receipts, refunds
//! - **Webhooks**: Checkout, charge, dispute and account events

pub mod bills;
pub mod booking;
pub mod checkout;
pub mod client;
pub mod connect;
pub mod consolidation;
pub mod email;
pub mod error;
pub mod invariants;
pub mod invoices;
pub mod refund;
pub mod runner;
pub mod schedule;
pub mod settings;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Bills
pub use bills::{
    issued_invoices, plan_bill, plan_cancellation, select_refundable_bill, Bill, BillPlan,
    BillService, CancellationOutcome, CancellationPlan,
};

// Booking lookups
pub use booking::{get_booking, get_context, get_owned_context, BookingContext, BookingRecord};

// Checkout
pub use checkout::{
    completion_action, CheckoutResponse, CheckoutService, CheckoutTarget, CompletionAction,
    PaymentSession,
};

// Client
pub use client::{StripeClient, StripeConfig};

// Connect
pub use connect::{
    sign_onboarding_link, verify_onboarding_link, ConnectService, OnboardingCallback,
    OnboardingLink, StripeAccountRecord, LINK_MAX_AGE_SECS,
};

// Consolidation
pub use consolidation::{
    plan_links, should_send_summary, ConsolidationPlan, ConsolidationPreview,
    ConsolidationRunReport, ConsolidationService, MonthOutcome,
};

// Email
pub use email::{format_amount, BillingEmailService, BulkSendReport, EmailConfig, EmailMessage};

// Error
pub use error::{BillingError, BillingResult};

// Invoices
pub use invoices::{
    compute_totals, issue_step, Invoice, InvoiceService, InvoiceTotals, InvoiceWithBills,
    IssueStep,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Refund
pub use refund::{RefundRecord, RefundResult, RefundService};

// Runner
pub use runner::{BillingRunner, DueBillsReport};

// Schedule
pub use schedule::{DueItem, DueWork, MonthlyKey, ScheduleService, MAX_RETRIES};

// Settings
pub use settings::{BillingSettings, SettingsInput, SettingsScope, SettingsService};

// Webhooks
pub use webhooks::{WebhookEventRecord, WebhookHandler, WebhookReplayResult};

use bookwell_shared::InvoiceStatus;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// Result of issuing an invoice to the client
#[derive(Debug, Clone, Serialize)]
pub struct IssuedInvoice {
    pub invoice: Invoice,
    pub checkout: CheckoutResponse,
    pub emailed: bool,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub bills: BillService,
    pub checkout: CheckoutService,
    pub connect: ConnectService,
    pub consolidation: ConsolidationService,
    pub email: BillingEmailService,
    pub invoices: InvoiceService,
    pub refund: RefundService,
    pub runner: BillingRunner,
    pub schedule: ScheduleService,
    pub settings: SettingsService,
    pub webhooks: WebhookHandler,
    pool: PgPool,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_parts(stripe, pool, BillingEmailService::from_env()))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_parts(StripeClient::new(config), pool, BillingEmailService::from_env())
    }

    pub fn with_parts(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            bills: BillService::new(pool.clone()),
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            connect: ConnectService::new(stripe.clone(), pool.clone()),
            consolidation: ConsolidationService::new(pool.clone(), email.clone()),
            email: email.clone(),
            invoices: InvoiceService::new(pool.clone()),
            refund: RefundService::new(stripe.clone(), pool.clone(), email.clone()),
            runner: BillingRunner::new(stripe.clone(), pool.clone(), email.clone()),
            schedule: ScheduleService::new(pool.clone()),
            settings: SettingsService::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool.clone(), email),
            pool,
        }
    }

    /// Issue a draft invoice, open a Checkout session for its total and
    /// send the client the payment link.
    pub async fn issue_invoice(&self, user_id: Uuid, invoice_id: Uuid) -> BillingResult<IssuedInvoice> {
        // fail before the draft is locked if the practitioner cannot take payments
        self.connect.require_payments_enabled(user_id).await?;

        let current = self.invoices.get(user_id, invoice_id).await?;
        // a retry after a checkout failure finds the invoice already issued
        let invoice = match issue_step(invoice_id, current.status)? {
            IssueStep::Issue => self.invoices.issue(user_id, invoice_id).await?,
            IssueStep::Resume => {
                tracing::info!(invoice_id = %invoice_id, "Resuming issue of an issued invoice");
                current
            }
        };
        let checkout = self.checkout.create_for_invoice(user_id, invoice_id).await?;

        let recipient: Option<(Option<String>, String, String)> = sqlx::query_as(
            r#"
            SELECT c.email, c.name, COALESCE(u.business_name, u.full_name, u.email)
            FROM clients c
            JOIN users u ON u.id = c.user_id
            WHERE c.id = $1
            "#,
        )
        .bind(invoice.client_id)
        .fetch_optional(&self.pool)
        .await?;

        let mut emailed = false;
        match recipient {
            Some((Some(to), client_name, practitioner)) => {
                let period = format!(
                    "{} {}",
                    invoice.period_start.month(),
                    invoice.period_start.year()
                );
                let message = EmailMessage::invoice_issued(
                    &to,
                    &client_name,
                    &practitioner,
                    &period,
                    &format_amount(invoice.total_cents, &invoice.currency),
                    &checkout.checkout_url,
                );
                match self.email.send(&message).await {
                    Ok(id) => emailed = id.is_some(),
                    Err(e) => {
                        tracing::warn!(invoice_id = %invoice_id, error = %e, "Failed to email issued invoice")
                    }
                }
            }
            _ => {
                tracing::warn!(invoice_id = %invoice_id, "Client has no email address; invoice link not sent")
            }
        }

        Ok(IssuedInvoice {
            invoice,
            checkout,
            emailed,
        })
    }

    /// Cancel an invoice once no checkout session can still collect its total
    pub async fn cancel_invoice(&self, user_id: Uuid, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.invoices.get(user_id, invoice_id).await?;
        if invoice.status == InvoiceStatus::Issued {
            self.checkout.expire_open_for_invoice(invoice_id).await?;
        }
        self.invoices.cancel(user_id, invoice_id).await
    }
}
