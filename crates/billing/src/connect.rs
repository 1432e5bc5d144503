//! Stripe Connect onboarding for practitioners
//!
//! Each practitioner gets one Express account. Charges are created directly
//! on it, so nothing can be sold until Stripe reports `charges_enabled`.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    Account, AccountId, AccountLink, AccountLinkType, AccountType, CreateAccount,
    CreateAccountCapabilities, CreateAccountCapabilitiesCardPayments,
    CreateAccountCapabilitiesTransfers, CreateAccountLink,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// How long an onboarding return or refresh URL stays usable
pub const LINK_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Query of the return and refresh URLs Stripe sends the browser back to
#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingCallback {
    pub account: String,
    pub ts: i64,
    pub sig: String,
}

fn link_mac(secret: &str, account: &str, issued_at: i64) -> BillingResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid onboarding link secret".to_string()))?;
    mac.update(format!("{}.{}", account, issued_at).as_bytes());
    Ok(mac)
}

/// Hex HMAC binding an account id to the time its links were issued
pub fn sign_onboarding_link(account: &str, issued_at: i64, secret: &str) -> BillingResult<String> {
    Ok(hex::encode(
        link_mac(secret, account, issued_at)?.finalize().into_bytes(),
    ))
}

pub fn verify_onboarding_link(
    callback: &OnboardingCallback,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let invalid = || BillingError::Forbidden("Invalid onboarding link".to_string());
    let signature = hex::decode(&callback.sig).map_err(|_| invalid())?;
    link_mac(secret, &callback.account, callback.ts)?
        .verify_slice(&signature)
        .map_err(|_| invalid())?;
    if !(0..=LINK_MAX_AGE_SECS).contains(&(now - callback.ts)) {
        return Err(invalid());
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StripeAccountRecord {
    pub user_id: Uuid,
    pub stripe_account_id: String,
    pub onboarding_complete: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl StripeAccountRecord {
    pub fn payments_enabled(&self) -> bool {
        self.charges_enabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountFlags {
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub onboarding_complete: bool,
}

impl AccountFlags {
    pub fn from_options(
        charges_enabled: Option<bool>,
        payouts_enabled: Option<bool>,
        details_submitted: Option<bool>,
    ) -> Self {
        let charges_enabled = charges_enabled.unwrap_or(false);
        let payouts_enabled = payouts_enabled.unwrap_or(false);
        let details_submitted = details_submitted.unwrap_or(false);
        Self {
            charges_enabled,
            payouts_enabled,
            details_submitted,
            onboarding_complete: details_submitted && charges_enabled,
        }
    }
}

pub fn account_flags(account: &Account) -> AccountFlags {
    AccountFlags::from_options(
        account.charges_enabled,
        account.payouts_enabled,
        account.details_submitted,
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct OnboardingLink {
    pub url: String,
    pub stripe_account_id: String,
}

const ACCOUNT_COLUMNS: &str = "user_id, stripe_account_id, onboarding_complete, charges_enabled, \
     payouts_enabled, details_submitted, created_at, updated_at";

#[derive(Clone)]
pub struct ConnectService {
    stripe: StripeClient,
    pool: PgPool,
}

impl ConnectService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<StripeAccountRecord>> {
        let sql = format!(
            "SELECT {} FROM stripe_accounts WHERE user_id = $1",
            ACCOUNT_COLUMNS
        );
        Ok(sqlx::query_as::<_, StripeAccountRecord>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Create the practitioner's Express account, or return the existing one
    pub async fn create_account(
        &self,
        user_id: Uuid,
        email: &str,
    ) -> BillingResult<StripeAccountRecord> {
        if let Some(existing) = self.get(user_id).await? {
            return Ok(existing);
        }

        let mut params = CreateAccount::new();
        params.type_ = Some(AccountType::Express);
        params.email = Some(email);
        params.capabilities = Some(CreateAccountCapabilities {
            card_payments: Some(CreateAccountCapabilitiesCardPayments {
                requested: Some(true),
            }),
            transfers: Some(CreateAccountCapabilitiesTransfers {
                requested: Some(true),
            }),
            ..Default::default()
        });
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        params.metadata = Some(metadata);

        let account = Account::create(self.stripe.inner(), params).await?;
        let flags = account_flags(&account);

        // a concurrent request may have won; keep whichever row landed first
        let sql = format!(
            r#"
            INSERT INTO stripe_accounts
                (user_id, stripe_account_id, onboarding_complete, charges_enabled,
                 payouts_enabled, details_submitted)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET updated_at = NOW()
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        );
        let record = sqlx::query_as::<_, StripeAccountRecord>(&sql)
            .bind(user_id)
            .bind(account.id.as_str())
            .bind(flags.onboarding_complete)
            .bind(flags.charges_enabled)
            .bind(flags.payouts_enabled)
            .bind(flags.details_submitted)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(
            user_id = %user_id,
            stripe_account_id = %record.stripe_account_id,
            "Created Stripe Connect account"
        );

        Ok(record)
    }

    pub async fn get_by_account(
        &self,
        stripe_account_id: &str,
    ) -> BillingResult<Option<StripeAccountRecord>> {
        let sql = format!(
            "SELECT {} FROM stripe_accounts WHERE stripe_account_id = $1",
            ACCOUNT_COLUMNS
        );
        Ok(sqlx::query_as::<_, StripeAccountRecord>(&sql)
            .bind(stripe_account_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Hosted onboarding URL; creates the account first if needed
    pub async fn onboarding_link(&self, user_id: Uuid, email: &str) -> BillingResult<OnboardingLink> {
        let record = self.create_account(user_id, email).await?;
        self.link_for(&record.stripe_account_id).await
    }

    /// Check a return or refresh callback was built by [`link_for`](Self::link_for)
    pub fn verify_callback(&self, callback: &OnboardingCallback) -> BillingResult<()> {
        verify_onboarding_link(
            callback,
            &self.stripe.config().secret_key,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }

    /// Account behind a verified callback
    pub async fn callback_account(
        &self,
        callback: &OnboardingCallback,
    ) -> BillingResult<StripeAccountRecord> {
        self.verify_callback(callback)?;
        self.get_by_account(&callback.account).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Stripe account {} not found", callback.account))
        })
    }

    /// Fresh onboarding URL for a known account (Stripe's refresh callback)
    pub async fn relink(&self, callback: &OnboardingCallback) -> BillingResult<OnboardingLink> {
        let record = self.callback_account(callback).await?;
        self.link_for(&record.stripe_account_id).await
    }

    async fn link_for(&self, stripe_account_id: &str) -> BillingResult<OnboardingLink> {
        let account_id: AccountId = stripe_account_id
            .parse()
            .map_err(|e| BillingError::Internal(format!("Stored account ID invalid: {}", e)))?;

        let config = self.stripe.config();
        let issued_at = OffsetDateTime::now_utc().unix_timestamp();
        let sig = sign_onboarding_link(stripe_account_id, issued_at, &config.secret_key)?;
        let query = format!("account={}&ts={}&sig={}", stripe_account_id, issued_at, sig);
        let refresh_url = format!("{}/stripe/connect/refresh?{}", config.api_public_url, query);
        let return_url = format!("{}/stripe/connect/return?{}", config.api_public_url, query);

        let mut params = CreateAccountLink::new(account_id, AccountLinkType::AccountOnboarding);
        params.refresh_url = Some(&refresh_url);
        params.return_url = Some(&return_url);

        let link = AccountLink::create(self.stripe.inner(), params).await?;

        Ok(OnboardingLink {
            url: link.url,
            stripe_account_id: stripe_account_id.to_string(),
        })
    }

    /// Pull the account from Stripe and store its capability flags
    pub async fn refresh_status(&self, user_id: Uuid) -> BillingResult<StripeAccountRecord> {
        let record = self.get(user_id).await?.ok_or_else(|| {
            BillingError::NotFound("No Stripe account for this user".to_string())
        })?;
        let account_id: AccountId = record
            .stripe_account_id
            .parse()
            .map_err(|e| BillingError::Internal(format!("Stored account ID invalid: {}", e)))?;

        let account = Account::retrieve(self.stripe.inner(), &account_id, &[]).await?;
        self.sync_from_account(&account)
            .await?
            .ok_or_else(|| BillingError::NotFound("No Stripe account for this user".to_string()))
    }

    /// Mirror an `account.updated` payload. `None` if the account is unknown.
    pub async fn sync_from_account(
        &self,
        account: &Account,
    ) -> BillingResult<Option<StripeAccountRecord>> {
        let flags = account_flags(account);
        let sql = format!(
            r#"
            UPDATE stripe_accounts
            SET charges_enabled = $2, payouts_enabled = $3, details_submitted = $4,
                onboarding_complete = $5, updated_at = NOW()
            WHERE stripe_account_id = $1
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        );
        let record = sqlx::query_as::<_, StripeAccountRecord>(&sql)
            .bind(account.id.as_str())
            .bind(flags.charges_enabled)
            .bind(flags.payouts_enabled)
            .bind(flags.details_submitted)
            .bind(flags.onboarding_complete)
            .fetch_optional(&self.pool)
            .await?;

        match &record {
            Some(r) => tracing::info!(
                user_id = %r.user_id,
                stripe_account_id = %r.stripe_account_id,
                charges_enabled = flags.charges_enabled,
                payouts_enabled = flags.payouts_enabled,
                "Stripe account status synced"
            ),
            None => tracing::warn!(
                stripe_account_id = %account.id,
                "Account update for unknown Stripe account"
            ),
        }

        Ok(record)
    }

    pub async fn require_payments_enabled(&self, user_id: Uuid) -> BillingResult<StripeAccountRecord> {
        match self.get(user_id).await? {
            Some(record) if record.payments_enabled() => Ok(record),
            _ => Err(BillingError::AccountNotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "sk_test_links";

    fn callback(account: &str, ts: i64) -> OnboardingCallback {
        OnboardingCallback {
            account: account.to_string(),
            ts,
            sig: sign_onboarding_link(account, ts, SECRET).unwrap(),
        }
    }

    #[test]
    fn test_onboarding_link_verifies() {
        let cb = callback("acct_123", 1_700_000_000);
        assert!(verify_onboarding_link(&cb, SECRET, 1_700_003_600).is_ok());
    }

    #[test]
    fn test_onboarding_link_rejects_other_account() {
        let mut cb = callback("acct_123", 1_700_000_000);
        cb.account = "acct_456".to_string();
        assert!(matches!(
            verify_onboarding_link(&cb, SECRET, 1_700_000_000),
            Err(BillingError::Forbidden(_))
        ));
    }

    #[test]
    fn test_onboarding_link_rejects_unsigned_and_stale() {
        let mut unsigned = callback("acct_123", 1_700_000_000);
        unsigned.sig = String::new();
        assert!(verify_onboarding_link(&unsigned, SECRET, 1_700_000_000).is_err());

        let cb = callback("acct_123", 1_700_000_000);
        assert!(verify_onboarding_link(&cb, SECRET, 1_700_000_000 + LINK_MAX_AGE_SECS + 1).is_err());
        assert!(verify_onboarding_link(&cb, "sk_test_other", 1_700_000_000).is_err());
    }

    #[test]
    fn test_flags_default_to_false() {
        let flags = AccountFlags::from_options(None, None, None);
        assert!(!flags.charges_enabled);
        assert!(!flags.onboarding_complete);
    }

    #[test]
    fn test_onboarding_needs_details_and_charges() {
        assert!(!AccountFlags::from_options(Some(false), Some(false), Some(true)).onboarding_complete);
        assert!(!AccountFlags::from_options(Some(true), Some(false), Some(false)).onboarding_complete);
        let done = AccountFlags::from_options(Some(true), Some(false), Some(true));
        assert!(done.onboarding_complete);
        assert!(!done.payouts_enabled);
    }
}
