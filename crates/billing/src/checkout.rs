//! Checkout Sessions on the practitioner's connected account
//!
//! One session pays either a single booking's bill or an issued invoice.
//! Stripe is authoritative; `payment_sessions` mirrors what we created so
//! webhooks can find their way back to the booking or invoice.

use std::collections::HashMap;

use bookwell_shared::{BookingStatus, InvoiceStatus, PaymentSessionStatus};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionPaymentIntentData, RequestStrategy,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::bills::{Bill, BILL_COLUMNS};
use crate::booking::get_context;
use crate::client::{stripe_currency, StripeClient};
use crate::connect::ConnectService;
use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceService;

/// Stripe allows at most 24 hours
const SESSION_LIFETIME: Duration = Duration::hours(23);
/// Open sessions closer than this to expiry are not handed out again
const REUSE_MARGIN: Duration = Duration::minutes(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutTarget {
    Booking(Uuid),
    Invoice(Uuid),
}

impl CheckoutTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            CheckoutTarget::Booking(_) => "booking",
            CheckoutTarget::Invoice(_) => "invoice",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            CheckoutTarget::Booking(id) | CheckoutTarget::Invoice(id) => *id,
        }
    }

    fn metadata(&self, user_id: Uuid) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("checkout_type".to_string(), self.kind().to_string());
        metadata.insert(format!("{}_id", self.kind()), self.id().to_string());
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub stripe_session_id: String,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_account_id: String,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: PaymentSessionStatus,
    pub checkout_url: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl PaymentSession {
    pub fn target(&self) -> Option<CheckoutTarget> {
        match (self.invoice_id, self.booking_id) {
            (Some(invoice_id), _) => Some(CheckoutTarget::Invoice(invoice_id)),
            (None, Some(booking_id)) => Some(CheckoutTarget::Booking(booking_id)),
            (None, None) => None,
        }
    }
}

pub(crate) const SESSION_COLUMNS: &str = "id, user_id, booking_id, invoice_id, stripe_session_id, \
     stripe_payment_intent_id, stripe_account_id, amount_cents, currency, status, checkout_url, \
     expires_at, completed_at, created_at";

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub checkout_url: String,
    pub amount_cents: i64,
    pub currency: String,
    pub expires_at: Option<OffsetDateTime>,
    pub reused: bool,
}

impl CheckoutResponse {
    fn from_session(session: &PaymentSession, reused: bool) -> BillingResult<Self> {
        let checkout_url = session.checkout_url.clone().ok_or_else(|| {
            BillingError::Internal("Checkout session has no URL".to_string())
        })?;
        Ok(Self {
            session_id: session.stripe_session_id.clone(),
            checkout_url,
            amount_cents: session.amount_cents,
            currency: session.currency.clone(),
            expires_at: session.expires_at,
            reused,
        })
    }
}

/// What a `checkout.session.completed` event should do given our local row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    Apply,
    NoOp,
}

pub fn completion_action(current: PaymentSessionStatus) -> CompletionAction {
    match current {
        PaymentSessionStatus::Open => CompletionAction::Apply,
        PaymentSessionStatus::Completed
        | PaymentSessionStatus::Expired
        | PaymentSessionStatus::Canceled => CompletionAction::NoOp,
    }
}

/// Whether an existing open session can be handed out again
pub fn is_reusable(session: &PaymentSession, amount_cents: i64, now: OffsetDateTime) -> bool {
    session.status == PaymentSessionStatus::Open
        && session.amount_cents == amount_cents
        && session.checkout_url.is_some()
        && session
            .expires_at
            .map(|exp| exp - REUSE_MARGIN > now)
            .unwrap_or(false)
}

struct SessionRequest {
    user_id: Uuid,
    stripe_account_id: String,
    target: CheckoutTarget,
    amount_cents: i64,
    currency: String,
    description: String,
    customer_email: Option<String>,
}

#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    connect: ConnectService,
    http: reqwest::Client,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            connect: ConnectService::new(stripe.clone(), pool.clone()),
            stripe,
            pool,
            http: reqwest::Client::new(),
        }
    }

    pub async fn create(&self, user_id: Uuid, target: CheckoutTarget) -> BillingResult<CheckoutResponse> {
        match target {
            CheckoutTarget::Booking(id) => self.create_for_booking(user_id, id).await,
            CheckoutTarget::Invoice(id) => self.create_for_invoice(user_id, id).await,
        }
    }

    /// Checkout for the open, uninvoiced bill of one booking
    pub async fn create_for_booking(
        &self,
        user_id: Uuid,
        booking_id: Uuid,
    ) -> BillingResult<CheckoutResponse> {
        let ctx = get_context(&self.pool, booking_id).await?;
        if ctx.booking.user_id != user_id {
            return Err(BillingError::NotFound(format!("Booking {} not found", booking_id)));
        }
        if ctx.booking.status()? == BookingStatus::Canceled {
            return Err(BillingError::InvalidInput(
                "Cannot take payment for a canceled booking".to_string(),
            ));
        }

        let sql = format!(
            "SELECT {} FROM bills WHERE booking_id = $1 AND invoice_id IS NULL \
             AND status IN ('scheduled', 'pending', 'sent') ORDER BY created_at DESC LIMIT 1",
            BILL_COLUMNS
        );
        let bill: Bill = sqlx::query_as(&sql)
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("Booking {} has no open bill", booking_id))
            })?;

        let account = self.connect.require_payments_enabled(user_id).await?;
        let when = ctx.booking.start_time.date();

        self.create_session(SessionRequest {
            user_id,
            stripe_account_id: account.stripe_account_id,
            target: CheckoutTarget::Booking(booking_id),
            amount_cents: bill.amount_cents,
            currency: bill.currency,
            description: format!("Session with {} on {}", ctx.practitioner_name, when),
            customer_email: ctx.client_email,
        })
        .await
    }

    /// Checkout for the total of an issued invoice
    pub async fn create_for_invoice(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
    ) -> BillingResult<CheckoutResponse> {
        let invoice = InvoiceService::new(self.pool.clone())
            .get(user_id, invoice_id)
            .await?;
        if invoice.status != InvoiceStatus::Issued {
            return Err(BillingError::InvalidInput(format!(
                "Invoice {} is {} and cannot be paid",
                invoice_id, invoice.status
            )));
        }

        let client_email: Option<String> =
            sqlx::query_scalar("SELECT email FROM clients WHERE id = $1")
                .bind(invoice.client_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        let account = self.connect.require_payments_enabled(user_id).await?;

        self.create_session(SessionRequest {
            user_id,
            stripe_account_id: account.stripe_account_id,
            target: CheckoutTarget::Invoice(invoice_id),
            amount_cents: invoice.total_cents,
            currency: invoice.currency,
            description: format!(
                "Invoice for {} to {}",
                invoice.period_start, invoice.period_end
            ),
            customer_email: client_email,
        })
        .await
    }

    async fn open_sessions_for(&self, target: CheckoutTarget) -> BillingResult<Vec<PaymentSession>> {
        let column = match target {
            CheckoutTarget::Booking(_) => "booking_id",
            CheckoutTarget::Invoice(_) => "invoice_id",
        };
        let sql = format!(
            "SELECT {} FROM payment_sessions WHERE {} = $1 AND status = 'open' ORDER BY created_at DESC",
            SESSION_COLUMNS, column
        );
        Ok(sqlx::query_as::<_, PaymentSession>(&sql)
            .bind(target.id())
            .fetch_all(&self.pool)
            .await?)
    }

    async fn create_session(&self, req: SessionRequest) -> BillingResult<CheckoutResponse> {
        if req.amount_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "Nothing to pay: amount is zero".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let open = self.open_sessions_for(req.target).await?;
        if let Some(existing) = open.iter().find(|s| is_reusable(s, req.amount_cents, now)) {
            tracing::info!(
                target_kind = req.target.kind(),
                target_id = %req.target.id(),
                session_id = %existing.stripe_session_id,
                "Reusing open checkout session"
            );
            return CheckoutResponse::from_session(existing, true);
        }

        // Same key for a retried request, a fresh one after any earlier session
        let prior: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payment_sessions WHERE booking_id = $1 OR invoice_id = $1",
        )
        .bind(req.target.id())
        .fetch_one(&self.pool)
        .await?;
        let idempotency_key = format!(
            "checkout:{}:{}:{}:{}",
            req.target.kind(),
            req.target.id(),
            req.amount_cents,
            prior
        );

        let client = self
            .stripe
            .for_account(&req.stripe_account_id)?
            .with_strategy(RequestStrategy::Idempotent(idempotency_key));

        let config = self.stripe.config();
        let success_url = format!(
            "{}/pay/success?session_id={{CHECKOUT_SESSION_ID}}",
            config.app_base_url
        );
        let cancel_url = format!("{}/pay/canceled", config.app_base_url);
        let metadata = req.target.metadata(req.user_id);
        let expires_at = now + SESSION_LIFETIME;
        let client_reference = req.target.id().to_string();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Payment);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.client_reference_id = Some(&client_reference);
        params.customer_email = req.customer_email.as_deref();
        params.expires_at = Some(expires_at.unix_timestamp());
        params.metadata = Some(metadata.clone());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: stripe_currency(&req.currency)?,
                unit_amount: Some(req.amount_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: req.description.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }]);

        let fee = config.application_fee(req.amount_cents);
        params.payment_intent_data = Some(CreateCheckoutSessionPaymentIntentData {
            application_fee_amount: (fee > 0).then_some(fee),
            metadata: Some(metadata),
            ..Default::default()
        });

        let session = CheckoutSession::create(&client, params).await?;
        let checkout_url = session.url.clone().ok_or_else(|| {
            BillingError::StripeApi("Checkout session returned without a URL".to_string())
        })?;

        let (booking_id, invoice_id) = match req.target {
            CheckoutTarget::Booking(id) => (Some(id), None),
            CheckoutTarget::Invoice(id) => (None, Some(id)),
        };
        let expires_at = OffsetDateTime::from_unix_timestamp(session.expires_at).ok();

        let sql = format!(
            r#"
            INSERT INTO payment_sessions
                (user_id, booking_id, invoice_id, stripe_session_id, stripe_account_id,
                 amount_cents, currency, status, checkout_url, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'open', $8, $9)
            ON CONFLICT (stripe_session_id) DO UPDATE SET checkout_url = EXCLUDED.checkout_url
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentSession>(&sql)
            .bind(req.user_id)
            .bind(booking_id)
            .bind(invoice_id)
            .bind(session.id.as_str())
            .bind(&req.stripe_account_id)
            .bind(req.amount_cents)
            .bind(&req.currency)
            .bind(&checkout_url)
            .bind(expires_at)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(
            user_id = %req.user_id,
            target_kind = req.target.kind(),
            target_id = %req.target.id(),
            session_id = %row.stripe_session_id,
            amount_cents = req.amount_cents,
            application_fee_cents = fee,
            "Created checkout session"
        );

        CheckoutResponse::from_session(&row, false)
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_session_id: &str,
    ) -> BillingResult<Option<PaymentSession>> {
        let sql = format!(
            "SELECT {} FROM payment_sessions WHERE stripe_session_id = $1",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, PaymentSession>(&sql)
            .bind(stripe_session_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<PaymentSession>> {
        let sql = format!(
            "SELECT {} FROM payment_sessions WHERE stripe_payment_intent_id = $1",
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, PaymentSession>(&sql)
            .bind(payment_intent_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Open → completed. `None` when another delivery got there first.
    pub async fn complete_session_in(
        conn: &mut PgConnection,
        stripe_session_id: &str,
        payment_intent_id: Option<&str>,
    ) -> BillingResult<Option<PaymentSession>> {
        let sql = format!(
            r#"
            UPDATE payment_sessions
            SET status = 'completed', completed_at = NOW(),
                stripe_payment_intent_id = COALESCE($2, stripe_payment_intent_id)
            WHERE stripe_session_id = $1 AND status = 'open'
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, PaymentSession>(&sql)
            .bind(stripe_session_id)
            .bind(payment_intent_id)
            .fetch_optional(&mut *conn)
            .await?)
    }

    pub async fn mark_expired(&self, stripe_session_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_sessions SET status = 'expired' WHERE stripe_session_id = $1 AND status = 'open'",
        )
        .bind(stripe_session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Expire every open session of a booking, at Stripe and locally
    pub async fn expire_open_for_booking(&self, booking_id: Uuid) -> BillingResult<usize> {
        let (expired, _failed) = self.expire_open(CheckoutTarget::Booking(booking_id)).await?;
        Ok(expired)
    }

    /// Expire every open session of an invoice. Errors if any session is
    /// still live at Stripe, since it would charge the old total.
    pub async fn expire_open_for_invoice(&self, invoice_id: Uuid) -> BillingResult<usize> {
        let (expired, failed) = self.expire_open(CheckoutTarget::Invoice(invoice_id)).await?;
        if failed > 0 {
            return Err(BillingError::StripeApi(format!(
                "{} checkout session(s) for invoice {} could not be expired",
                failed, invoice_id
            )));
        }
        Ok(expired)
    }

    async fn expire_open(&self, target: CheckoutTarget) -> BillingResult<(usize, usize)> {
        let open = self.open_sessions_for(target).await?;
        let mut expired = 0;
        let mut failed = 0;

        for session in open {
            match self
                .expire_at_stripe(&session.stripe_account_id, &session.stripe_session_id)
                .await
            {
                Ok(()) => {
                    sqlx::query(
                        "UPDATE payment_sessions SET status = 'canceled' WHERE id = $1 AND status = 'open'",
                    )
                    .bind(session.id)
                    .execute(&self.pool)
                    .await?;
                    expired += 1;
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        target_kind = target.kind(),
                        target_id = %target.id(),
                        session_id = %session.stripe_session_id,
                        error = %e,
                        "Failed to expire checkout session"
                    );
                }
            }
        }

        Ok((expired, failed))
    }

    /// POST /v1/checkout/sessions/{id}/expire on the connected account
    async fn expire_at_stripe(&self, stripe_account_id: &str, session_id: &str) -> BillingResult<()> {
        let config = self.stripe.config();
        let response = self
            .http
            .post(format!(
                "{}/v1/checkout/sessions/{}/expire",
                config.api_base, session_id
            ))
            .bearer_auth(&config.secret_key)
            .header("Stripe-Account", stripe_account_id)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        // already expired or completed at Stripe
        if status == reqwest::StatusCode::BAD_REQUEST && body.contains("status") {
            tracing::warn!(session_id = %session_id, "Checkout session no longer open at Stripe");
            return Ok(());
        }

        Err(BillingError::StripeApi(format!(
            "Expire session returned {}: {}",
            status, body
        )))
    }

    /// Local sweep for sessions whose expiry passed without a webhook
    pub async fn expire_stale(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE payment_sessions SET status = 'expired' WHERE status = 'open' AND expires_at < NOW()",
        )
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::info!(count = result.rows_affected(), "Marked stale checkout sessions expired");
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn session(status: PaymentSessionStatus, amount: i64, expires: OffsetDateTime) -> PaymentSession {
        PaymentSession {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            booking_id: Some(Uuid::new_v4()),
            invoice_id: None,
            stripe_session_id: "cs_test_1".to_string(),
            stripe_payment_intent_id: None,
            stripe_account_id: "acct_123".to_string(),
            amount_cents: amount,
            currency: "usd".to_string(),
            status,
            checkout_url: Some("https://checkout.stripe.com/c/pay/cs_test_1".to_string()),
            expires_at: Some(expires),
            completed_at: None,
            created_at: datetime!(2026-03-01 0:00 UTC),
        }
    }

    #[test]
    fn test_completion_action_only_applies_to_open() {
        assert_eq!(completion_action(PaymentSessionStatus::Open), CompletionAction::Apply);
        assert_eq!(completion_action(PaymentSessionStatus::Completed), CompletionAction::NoOp);
        assert_eq!(completion_action(PaymentSessionStatus::Expired), CompletionAction::NoOp);
        assert_eq!(completion_action(PaymentSessionStatus::Canceled), CompletionAction::NoOp);
    }

    #[test]
    fn test_is_reusable() {
        let now = datetime!(2026-03-01 12:00 UTC);
        let fresh = session(PaymentSessionStatus::Open, 5000, datetime!(2026-03-02 10:00 UTC));
        assert!(is_reusable(&fresh, 5000, now));
        assert!(!is_reusable(&fresh, 6000, now));

        let nearly_expired =
            session(PaymentSessionStatus::Open, 5000, datetime!(2026-03-01 12:05 UTC));
        assert!(!is_reusable(&nearly_expired, 5000, now));

        let completed =
            session(PaymentSessionStatus::Completed, 5000, datetime!(2026-03-02 10:00 UTC));
        assert!(!is_reusable(&completed, 5000, now));
    }

    #[test]
    fn test_target_metadata() {
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let meta = CheckoutTarget::Invoice(id).metadata(user);
        assert_eq!(meta["checkout_type"], "invoice");
        assert_eq!(meta["invoice_id"], id.to_string());
        assert_eq!(meta["user_id"], user.to_string());
        assert!(!meta.contains_key("booking_id"));
    }

    #[test]
    fn test_session_target_prefers_invoice() {
        let mut s = session(PaymentSessionStatus::Open, 1, datetime!(2026-03-02 0:00 UTC));
        let booking = s.booking_id.unwrap();
        assert_eq!(s.target(), Some(CheckoutTarget::Booking(booking)));
        let invoice = Uuid::new_v4();
        s.invoice_id = Some(invoice);
        assert_eq!(s.target(), Some(CheckoutTarget::Invoice(invoice)));
    }
}
