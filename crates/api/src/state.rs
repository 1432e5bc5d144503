//! Application state

use bookwell_billing::{BillingEmailService, BillingService};
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

use crate::{
    auth::{AuthState, TokenCache},
    bookings::BookingService,
    calendar::{CalendarSync, GoogleCalendarClient},
    config::Config,
    error::{ApiError, ApiResult},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Stripe billing; `None` when disabled or Stripe is not configured
    pub billing: Option<Arc<BillingService>>,
    pub email: BillingEmailService,
    pub calendar: CalendarSync,
    pub bookings: BookingService,
    pub http_client: Client,
    /// Cache for Supabase token verification results
    pub(crate) token_cache: TokenCache,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        let email = match &billing {
            Some(svc) => svc.email.clone(),
            None => BillingEmailService::from_env(),
        };
        if !email.config().is_enabled() {
            tracing::warn!("Email notifications not configured (missing RESEND_API_KEY)");
        }

        let http_client = Client::new();

        if !config.supabase_url.is_empty() && config.supabase_anon_key.is_empty() {
            tracing::warn!("Supabase URL configured but SUPABASE_ANON_KEY is missing - API token verification will fail");
        }

        let google = config
            .google
            .clone()
            .map(|google| GoogleCalendarClient::new(http_client.clone(), google));
        if google.is_none() {
            tracing::info!("Google Calendar sync disabled (GOOGLE_CLIENT_ID not set)");
        }
        let calendar = CalendarSync::new(pool.clone(), google);

        let bookings = BookingService::new(
            pool.clone(),
            billing.clone(),
            email.clone(),
            calendar.clone(),
        );

        let token_cache = Arc::new(tokio::sync::RwLock::new(std::collections::HashMap::new()));

        Self {
            pool,
            config,
            billing,
            email,
            calendar,
            bookings,
            http_client,
            token_cache,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            pool: self.pool.clone(),
            supabase_url: self.config.supabase_url.clone(),
            supabase_anon_key: self.config.supabase_anon_key.clone(),
            jwt_secret: self.config.supabase_jwt_secret.clone(),
            http_client: self.http_client.clone(),
            token_cache: self.token_cache.clone(),
        }
    }

    /// Billing service, or 503 when billing is off
    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing
            .as_deref()
            .ok_or_else(|| ApiError::ServiceUnavailable("Billing is disabled".to_string()))
    }
}
