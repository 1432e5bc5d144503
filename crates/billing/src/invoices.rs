//! Invoices aggregate the bills of one client over a billing period

use bookwell_shared::InvoiceStatus;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::bills::{Bill, BILL_COLUMNS};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub period_start: Date,
    pub period_end: Date,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub tax_rate_bps: i32,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub pdf_path: Option<String>,
    pub issued_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceWithBills {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub bills: Vec<Bill>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvoiceTotals {
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

/// Totals for a set of bill amounts. Tax rounds half up to the cent.
pub fn compute_totals(bill_amounts: &[i64], tax_rate_bps: i32) -> InvoiceTotals {
    let subtotal_cents: i64 = bill_amounts.iter().sum();
    let tax_cents = (subtotal_cents * i64::from(tax_rate_bps) + 5_000) / 10_000;
    InvoiceTotals {
        subtotal_cents,
        tax_cents,
        total_cents: subtotal_cents + tax_cents,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStep {
    /// Draft: lock it and move its bills to `sent`
    Issue,
    /// Already issued: only the checkout session and email remain
    Resume,
}

/// What issuing an invoice in `status` has left to do
pub fn issue_step(invoice_id: Uuid, status: InvoiceStatus) -> BillingResult<IssueStep> {
    match status {
        InvoiceStatus::Draft => Ok(IssueStep::Issue),
        InvoiceStatus::Issued => Ok(IssueStep::Resume),
        InvoiceStatus::Paid | InvoiceStatus::Canceled => Err(BillingError::InvalidInput(format!(
            "Invoice {} is {} and cannot be issued",
            invoice_id, status
        ))),
    }
}

pub(crate) const INVOICE_COLUMNS: &str = "id, user_id, client_id, period_start, period_end, \
     subtotal_cents, tax_cents, total_cents, tax_rate_bps, currency, status, pdf_path, \
     issued_at, paid_at, created_at, updated_at";

#[derive(Clone)]
pub struct InvoiceService {
    pool: PgPool,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The single draft for (user, client, period), created on first use
    pub async fn find_or_create_draft_tx(
        conn: &mut PgConnection,
        user_id: Uuid,
        client_id: Uuid,
        period_start: Date,
        period_end: Date,
        currency: &str,
        tax_rate_bps: i32,
    ) -> BillingResult<Invoice> {
        let sql = format!(
            r#"
            INSERT INTO invoices (user_id, client_id, period_start, period_end, currency, tax_rate_bps)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, client_id, period_start) WHERE status = 'draft'
            DO UPDATE SET updated_at = NOW()
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Invoice>(&sql)
            .bind(user_id)
            .bind(client_id)
            .bind(period_start)
            .bind(period_end)
            .bind(currency)
            .bind(tax_rate_bps)
            .fetch_one(&mut *conn)
            .await?)
    }

    /// Recalculate subtotal, tax and total from the linked bills
    pub async fn recompute_totals_in(
        conn: &mut PgConnection,
        invoice_id: Uuid,
    ) -> BillingResult<InvoiceTotals> {
        let tax_rate_bps: i32 =
            sqlx::query_scalar("SELECT tax_rate_bps FROM invoices WHERE id = $1")
                .bind(invoice_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))?;

        let amounts: Vec<i64> = sqlx::query_scalar(
            "SELECT amount_cents FROM bills WHERE invoice_id = $1 AND status <> 'canceled'",
        )
        .bind(invoice_id)
        .fetch_all(&mut *conn)
        .await?;

        let totals = compute_totals(&amounts, tax_rate_bps);

        sqlx::query(
            r#"
            UPDATE invoices
            SET subtotal_cents = $2, tax_cents = $3, total_cents = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(totals.subtotal_cents)
        .bind(totals.tax_cents)
        .bind(totals.total_cents)
        .execute(&mut *conn)
        .await?;

        Ok(totals)
    }

    pub async fn recompute_totals(&self, invoice_id: Uuid) -> BillingResult<InvoiceTotals> {
        let mut conn = self.pool.acquire().await?;
        Self::recompute_totals_in(&mut conn, invoice_id).await
    }

    pub async fn get(&self, user_id: Uuid, invoice_id: Uuid) -> BillingResult<Invoice> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE id = $1 AND user_id = $2",
            INVOICE_COLUMNS
        );
        sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))
    }

    /// Lookup without an ownership check, for webhook and worker paths
    pub async fn get_unscoped(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let sql = format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS);
        sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))
    }

    pub async fn get_with_bills(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> BillingResult<InvoiceWithBills> {
        let invoice = self.get(user_id, invoice_id).await?;
        let sql = format!(
            "SELECT {} FROM bills WHERE invoice_id = $1 ORDER BY created_at",
            BILL_COLUMNS
        );
        let bills = sqlx::query_as::<_, Bill>(&sql)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(InvoiceWithBills { invoice, bills })
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        status: Option<InvoiceStatus>,
    ) -> BillingResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY period_start DESC, created_at DESC",
            INVOICE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Invoice>(&sql)
            .bind(user_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?)
    }

    /// Draft → issued. Open bills on the invoice move to `sent`.
    pub async fn issue(&self, user_id: Uuid, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut tx = self.pool.begin().await?;

        let totals = Self::recompute_totals_in(&mut tx, invoice_id).await?;
        if totals.total_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "Cannot issue an invoice with no billable amount".to_string(),
            ));
        }

        let sql = format!(
            r#"
            UPDATE invoices
            SET status = 'issued', issued_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status = 'draft'
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("Invoice {} is not a draft", invoice_id))
            })?;

        sqlx::query(
            r#"
            UPDATE bills SET status = 'sent', sent_at = COALESCE(sent_at, NOW()), updated_at = NOW()
            WHERE invoice_id = $1 AND status IN ('scheduled', 'pending')
            "#,
        )
        .bind(invoice_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice_id,
            user_id = %user_id,
            total_cents = invoice.total_cents,
            "Invoice issued"
        );

        Ok(invoice)
    }

    /// Invoice and its linked bills become paid. Returns false when the
    /// invoice was already paid.
    pub async fn mark_paid_in(conn: &mut PgConnection, invoice_id: Uuid) -> BillingResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE invoices SET status = 'paid', paid_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('draft', 'issued')
            "#,
        )
        .bind(invoice_id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE bills SET status = 'paid', paid_at = NOW(), updated_at = NOW()
            WHERE invoice_id = $1 AND status IN ('scheduled', 'pending', 'sent')
            "#,
        )
        .bind(invoice_id)
        .execute(&mut *conn)
        .await?;

        Ok(true)
    }

    pub async fn mark_paid(&self, invoice_id: Uuid) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = Self::mark_paid_in(&mut tx, invoice_id).await?;
        tx.commit().await?;
        Ok(changed)
    }

    /// Cancel a draft or issued invoice; its open bills return to `pending`
    /// without an invoice so a later consolidation can pick them up.
    pub async fn cancel(&self, user_id: Uuid, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE invoices SET status = 'canceled', updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status IN ('draft', 'issued')
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("Invoice {} cannot be canceled", invoice_id))
            })?;

        let unlinked = sqlx::query(
            r#"
            UPDATE bills SET invoice_id = NULL, status = 'pending', updated_at = NOW()
            WHERE invoice_id = $1 AND status IN ('scheduled', 'pending', 'sent')
            "#,
        )
        .bind(invoice_id)
        .execute(&mut *tx)
        .await?;

        // payments already made stay attached for the audit trail
        sqlx::query("UPDATE bills SET invoice_id = NULL WHERE invoice_id = $1 AND status = 'canceled'")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice_id,
            bills_unlinked = unlinked.rows_affected(),
            "Invoice canceled"
        );

        Ok(invoice)
    }

    /// Cancel a draft left without any active bills
    pub async fn cancel_if_empty_in(
        conn: &mut PgConnection,
        invoice_id: Uuid,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invoices SET status = 'canceled', updated_at = NOW()
            WHERE id = $1 AND status IN ('draft', 'issued')
              AND NOT EXISTS (
                  SELECT 1 FROM bills WHERE invoice_id = $1 AND status <> 'canceled'
              )
            "#,
        )
        .bind(invoice_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_pdf_reference(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
        pdf_path: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE invoices SET pdf_path = $3, updated_at = NOW() WHERE id = $1 AND user_id = $2",
        )
        .bind(invoice_id)
        .bind(user_id)
        .bind(pdf_path)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Invoice {} not found",
                invoice_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_totals_without_tax() {
        let totals = compute_totals(&[12_000, 12_000, 8_000], 0);
        assert_eq!(
            totals,
            InvoiceTotals {
                subtotal_cents: 32_000,
                tax_cents: 0,
                total_cents: 32_000
            }
        );
    }

    #[test]
    fn test_compute_totals_rounds_tax_half_up() {
        // 8.25% of $10.10 = 83.325 cents
        let totals = compute_totals(&[1_010], 825);
        assert_eq!(totals.tax_cents, 83);
        // 10% of 5 cents = 0.5 cents
        assert_eq!(compute_totals(&[5], 1_000).tax_cents, 1);
        assert_eq!(compute_totals(&[4], 1_000).tax_cents, 0);
    }

    #[test]
    fn test_issue_step_resumes_issued_invoice() {
        let id = Uuid::new_v4();
        assert_eq!(issue_step(id, InvoiceStatus::Draft).unwrap(), IssueStep::Issue);
        assert_eq!(issue_step(id, InvoiceStatus::Issued).unwrap(), IssueStep::Resume);
        assert!(matches!(
            issue_step(id, InvoiceStatus::Paid),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(issue_step(id, InvoiceStatus::Canceled).is_err());
    }

    #[test]
    fn test_compute_totals_empty() {
        let totals = compute_totals(&[], 2_000);
        assert_eq!(totals.total_cents, 0);
    }
}
