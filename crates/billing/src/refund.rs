//! Refunds of paid booking bills
//!
//! The refund goes back to the card through the practitioner's connected
//! account. Every attempt leaves a row in `refunds`, written as `pending`
//! before Stripe is called and completed or failed afterwards.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{CreateRefund, PaymentIntentId, Refund, RefundReasonFilter, RequestStrategy};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::bills::{select_refundable_bill, BillService};
use crate::booking::get_owned_context;
use crate::client::StripeClient;
use crate::email::{format_amount, BillingEmailService, EmailMessage};
use crate::error::{BillingError, BillingResult};

/// Result of a refund operation
#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub refund_id: Uuid,
    pub stripe_refund_id: String,
    pub bill_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
}

/// Audit row for a refund attempt
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RefundRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub booking_id: Uuid,
    pub bill_id: Uuid,
    pub stripe_refund_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub amount_cents: i64,
    pub reason: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// One Stripe refund per bill, however often the request is retried
pub fn refund_idempotency_key(bill_id: Uuid) -> String {
    format!("refund:{}", bill_id)
}

#[derive(sqlx::FromRow)]
struct PaidSession {
    stripe_payment_intent_id: String,
    stripe_account_id: String,
}

#[derive(Clone)]
pub struct RefundService {
    stripe: StripeClient,
    pool: PgPool,
    bills: BillService,
    email: BillingEmailService,
}

impl RefundService {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            bills: BillService::new(pool.clone()),
            stripe,
            pool,
            email,
        }
    }

    /// Refund the paid bill of a booking.
    ///
    /// Fails with [`BillingError::NoPaidBill`] when nothing on the booking has
    /// been paid.
    pub async fn refund_booking(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
        reason: &str,
    ) -> BillingResult<RefundResult> {
        let ctx = get_owned_context(&self.pool, user_id, booking_id).await?;
        let bills = self.bills.list_for_booking(booking_id).await?;
        let bill = select_refundable_bill(booking_id, &bills)?.clone();

        // the payment is either the booking's own checkout or its invoice's
        let paid: Option<PaidSession> = sqlx::query_as(
            r#"
            SELECT stripe_payment_intent_id, stripe_account_id
            FROM payment_sessions
            WHERE status = 'completed'
              AND stripe_payment_intent_id IS NOT NULL
              AND (booking_id = $1 OR ($2::UUID IS NOT NULL AND invoice_id = $2))
            ORDER BY completed_at DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(booking_id)
        .bind(bill.invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        let paid = paid.ok_or_else(|| {
            BillingError::RefundFailed(format!(
                "No completed payment found for booking {}",
                booking_id
            ))
        })?;

        let payment_intent: PaymentIntentId = paid
            .stripe_payment_intent_id
            .parse()
            .map_err(|e| BillingError::RefundFailed(format!("Invalid payment intent ID: {}", e)))?;

        // a concurrent request for the same bill loses here
        if !self.bills.claim_for_refund(bill.id).await? {
            return Err(BillingError::NoPaidBill(booking_id));
        }

        let record_id = match self
            .create_refund_record(
                user_id,
                booking_id,
                bill.id,
                &paid.stripe_payment_intent_id,
                bill.amount_cents,
                reason,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.release_claim(bill.id).await;
                return Err(e);
            }
        };

        let mut params = CreateRefund::new();
        params.payment_intent = Some(payment_intent);
        params.amount = Some(bill.amount_cents);
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);
        params.refund_application_fee = Some(true);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("booking_id".to_string(), booking_id.to_string());
        metadata.insert("bill_id".to_string(), bill.id.to_string());
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("reason".to_string(), reason.to_string());
        params.metadata = Some(metadata);

        let client = match self.stripe.for_account(&paid.stripe_account_id) {
            Ok(client) => client
                .with_strategy(RequestStrategy::Idempotent(refund_idempotency_key(bill.id))),
            Err(e) => {
                self.complete_refund_record(record_id, None, "failed", Some(&e.to_string()))
                    .await?;
                self.release_claim(bill.id).await;
                return Err(e);
            }
        };

        match Refund::create(&client, params).await {
            Ok(refund) => {
                self.complete_refund_record(record_id, Some(refund.id.as_str()), "completed", None)
                    .await?;

                tracing::info!(
                    user_id = %user_id,
                    booking_id = %booking_id,
                    bill_id = %bill.id,
                    refund_id = %refund.id,
                    amount_cents = bill.amount_cents,
                    "Issued refund"
                );

                if let Some(client_email) = ctx.client_email.as_deref() {
                    self.email
                        .send_best_effort(&EmailMessage::refund_issued(
                            client_email,
                            &ctx.client_name,
                            &ctx.practitioner_name,
                            &format_amount(bill.amount_cents, &bill.currency),
                        ))
                        .await;
                }

                Ok(RefundResult {
                    refund_id: record_id,
                    stripe_refund_id: refund.id.to_string(),
                    bill_id: bill.id,
                    amount_cents: bill.amount_cents,
                    currency: bill.currency,
                })
            }
            Err(e) => {
                let error_msg = e.to_string();
                self.release_claim(bill.id).await;
                self.complete_refund_record(record_id, None, "failed", Some(&error_msg))
                    .await?;

                tracing::error!(
                    booking_id = %booking_id,
                    bill_id = %bill.id,
                    error = %error_msg,
                    "Failed to issue refund"
                );

                Err(BillingError::RefundFailed(error_msg))
            }
        }
    }

    async fn release_claim(&self, bill_id: Uuid) {
        if let Err(e) = self.bills.release_refund_claim(bill_id).await {
            tracing::error!(bill_id = %bill_id, error = %e, "Failed to release refund claim on bill");
        }
    }

    async fn create_refund_record(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
        bill_id: Uuid,
        payment_intent_id: &str,
        amount_cents: i64,
        reason: &str,
    ) -> BillingResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO refunds
                (user_id, booking_id, bill_id, stripe_payment_intent_id, amount_cents, reason, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(booking_id)
        .bind(bill_id)
        .bind(payment_intent_id)
        .bind(amount_cents)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn complete_refund_record(
        &self,
        record_id: Uuid,
        stripe_refund_id: Option<&str>,
        status: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE refunds
            SET stripe_refund_id = $2,
                status = $3,
                error_message = $4,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(stripe_refund_id)
        .bind(status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn refund_history(&self, user_id: Uuid) -> BillingResult<Vec<RefundRecord>> {
        let records = sqlx::query_as::<_, RefundRecord>(
            r#"
            SELECT id, user_id, booking_id, bill_id, stripe_refund_id, stripe_payment_intent_id,
                   amount_cents, reason, status, error_message, created_at, completed_at
            FROM refunds
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_key_is_stable_per_bill() {
        let bill = Uuid::new_v4();
        assert_eq!(refund_idempotency_key(bill), refund_idempotency_key(bill));
        assert_eq!(refund_idempotency_key(bill), format!("refund:{}", bill));
        assert_ne!(
            refund_idempotency_key(bill),
            refund_idempotency_key(Uuid::new_v4())
        );
    }
}
