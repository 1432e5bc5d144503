//! Stripe client configuration
//!
//! Payments are direct charges on the practitioner's connected account. The
//! platform key authenticates every call and `Stripe-Account` selects the
//! connected account.

use std::sync::Arc;

use stripe::{AccountId, Client, Currency};

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Stripe configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Signing secret for platform events
    pub webhook_secret: String,
    /// Signing secret for events forwarded from connected accounts
    pub connect_webhook_secret: Option<String>,
    /// Platform fee in basis points of each charge
    pub platform_fee_bps: u32,
    /// Frontend base URL for checkout redirects
    pub app_base_url: String,
    /// Public URL of this API, for onboarding return links
    pub api_public_url: String,
    /// Stripe REST base, overridable for tests
    pub api_base: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let connect_webhook_secret = std::env::var("STRIPE_CONNECT_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        let platform_fee_bps = match std::env::var("PLATFORM_FEE_BPS") {
            Ok(raw) => raw.parse::<u32>().map_err(|_| {
                BillingError::Config(format!("PLATFORM_FEE_BPS must be an integer, got {}", raw))
            })?,
            Err(_) => 0,
        };
        if platform_fee_bps > 10_000 {
            return Err(BillingError::Config(
                "PLATFORM_FEE_BPS cannot exceed 10000".to_string(),
            ));
        }
        let app_base_url = std::env::var("APP_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();
        let api_public_url = std::env::var("API_PUBLIC_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("{}/api", app_base_url));

        Ok(Self {
            secret_key,
            webhook_secret,
            connect_webhook_secret,
            platform_fee_bps,
            app_base_url,
            api_public_url,
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    /// Platform fee for a charge, rounded down
    pub fn application_fee(&self, amount_cents: i64) -> i64 {
        amount_cents * i64::from(self.platform_fee_bps) / 10_000
    }
}

/// Cheap-to-clone handle around the Stripe SDK client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Platform-scoped client
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Client that acts on behalf of a connected account
    pub fn for_account(&self, stripe_account_id: &str) -> BillingResult<Client> {
        let account_id: AccountId = stripe_account_id.parse().map_err(|e| {
            BillingError::InvalidInput(format!("Invalid Stripe account ID: {}", e))
        })?;
        Ok(self.inner.clone().with_stripe_account(account_id))
    }
}

/// Map a stored ISO currency code to the SDK enum
pub fn stripe_currency(code: &str) -> BillingResult<Currency> {
    match code.to_ascii_lowercase().as_str() {
        "usd" => Ok(Currency::USD),
        "eur" => Ok(Currency::EUR),
        "gbp" => Ok(Currency::GBP),
        "cad" => Ok(Currency::CAD),
        "aud" => Ok(Currency::AUD),
        other => Err(BillingError::InvalidInput(format!(
            "Unsupported currency: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fee_bps: u32) -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            connect_webhook_secret: None,
            platform_fee_bps: fee_bps,
            app_base_url: "http://localhost:3000".to_string(),
            api_public_url: "http://localhost:3000/api".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    #[test]
    fn test_application_fee_rounds_down() {
        let cfg = config(250);
        assert_eq!(cfg.application_fee(10_000), 250);
        assert_eq!(cfg.application_fee(999), 24);
        assert_eq!(config(0).application_fee(10_000), 0);
    }

    #[test]
    fn test_currency_mapping() {
        assert_eq!(stripe_currency("USD").unwrap(), Currency::USD);
        assert_eq!(stripe_currency("eur").unwrap(), Currency::EUR);
        assert!(stripe_currency("xyz").is_err());
    }

    #[test]
    fn test_for_account_rejects_bad_id() {
        let client = StripeClient::new(config(0));
        assert!(client.for_account("not-an-account").is_err());
        assert!(client.for_account("acct_1234567890").is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_requires_secret() {
        std::env::remove_var("STRIPE_SECRET_KEY");
        assert!(matches!(
            StripeConfig::from_env(),
            Err(BillingError::Config(_))
        ));
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_reads_fee_and_trims_base_url() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_abc");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_abc");
        std::env::set_var("PLATFORM_FEE_BPS", "300");
        std::env::set_var("APP_BASE_URL", "https://app.example.com/");
        std::env::remove_var("API_PUBLIC_URL");

        let cfg = StripeConfig::from_env().unwrap();
        assert_eq!(cfg.platform_fee_bps, 300);
        assert_eq!(cfg.app_base_url, "https://app.example.com");
        assert_eq!(cfg.api_public_url, "https://app.example.com/api");

        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
        std::env::remove_var("PLATFORM_FEE_BPS");
        std::env::remove_var("APP_BASE_URL");
    }
}
