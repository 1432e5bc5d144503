//! Billing settings: user default, per-client override, per-booking override
//!
//! Resolution picks the most specific row: booking beats client beats the
//! user's default.

use bookwell_shared::{
    first_of_next_month, month_period, BillingFrequency, BillingTrigger, BillingType,
    ScheduleAction,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const MAX_ADVANCE_DAYS: i32 = 60;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingSettings {
    pub id: Uuid,
    pub user_id: Uuid,
    pub client_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub billing_type: BillingType,
    #[sqlx(try_from = "String")]
    pub frequency: BillingFrequency,
    #[sqlx(try_from = "String", rename = "trigger_type")]
    pub trigger: BillingTrigger,
    pub advance_days: i32,
    pub tax_rate_bps: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl BillingSettings {
    pub fn scope(&self) -> SettingsScope {
        match (self.booking_id, self.client_id) {
            (Some(b), _) => SettingsScope::Booking(b),
            (None, Some(c)) => SettingsScope::Client(c),
            (None, None) => SettingsScope::User,
        }
    }

    /// Recurring monthly billing is consolidated into invoices; everything
    /// else is billed one booking at a time.
    pub fn is_monthly_consolidated(&self) -> bool {
        self.billing_type == BillingType::Recurring && self.frequency == BillingFrequency::Monthly
    }

    pub fn schedule_action(&self) -> ScheduleAction {
        if self.is_monthly_consolidated() {
            ScheduleAction::ConsolidateInvoice
        } else {
            ScheduleAction::SendBill
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum SettingsScope {
    User,
    Client(Uuid),
    Booking(Uuid),
}

/// Request body for creating or replacing a settings row
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsInput {
    pub client_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub billing_type: BillingType,
    #[serde(default = "default_frequency")]
    pub frequency: BillingFrequency,
    #[serde(default = "default_trigger")]
    pub trigger: BillingTrigger,
    #[serde(default)]
    pub advance_days: i32,
    #[serde(default)]
    pub tax_rate_bps: i32,
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_frequency() -> BillingFrequency {
    BillingFrequency::Monthly
}

fn default_trigger() -> BillingTrigger {
    BillingTrigger::After
}

impl SettingsInput {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount_cents < 0 {
            return Err(BillingError::InvalidInput(
                "amount_cents cannot be negative".to_string(),
            ));
        }
        if !(0..=MAX_ADVANCE_DAYS).contains(&self.advance_days) {
            return Err(BillingError::InvalidInput(format!(
                "advance_days must be between 0 and {}",
                MAX_ADVANCE_DAYS
            )));
        }
        if !(0..=10_000).contains(&self.tax_rate_bps) {
            return Err(BillingError::InvalidInput(
                "tax_rate_bps must be between 0 and 10000".to_string(),
            ));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidInput(format!(
                "currency must be a 3-letter ISO code, got {}",
                self.currency
            )));
        }
        Ok(())
    }

    pub fn scope(&self) -> SettingsScope {
        match (self.booking_id, self.client_id) {
            (Some(b), _) => SettingsScope::Booking(b),
            (None, Some(c)) => SettingsScope::Client(c),
            (None, None) => SettingsScope::User,
        }
    }
}

/// Most specific settings row for a booking among a user's rows
pub fn pick_most_specific(
    candidates: &[BillingSettings],
    client_id: Uuid,
    booking_id: Uuid,
) -> Option<&BillingSettings> {
    candidates
        .iter()
        .find(|s| s.booking_id == Some(booking_id))
        .or_else(|| {
            candidates
                .iter()
                .find(|s| s.booking_id.is_none() && s.client_id == Some(client_id))
        })
        .or_else(|| {
            candidates
                .iter()
                .find(|s| s.booking_id.is_none() && s.client_id.is_none())
        })
}

/// Date (UTC) on which the bill action for a booking fires
pub fn scheduled_date_for(
    settings: &BillingSettings,
    booking_start: OffsetDateTime,
    booking_end: OffsetDateTime,
) -> BillingResult<Date> {
    let advance = Duration::days(i64::from(settings.advance_days));
    let start = booking_start.date();
    let end = booking_end.date();

    let date = if settings.is_monthly_consolidated() {
        match settings.trigger {
            BillingTrigger::After => first_of_next_month(end)?.checked_add(advance),
            BillingTrigger::Before => month_period(start)?.0.checked_sub(advance),
        }
    } else {
        match settings.trigger {
            BillingTrigger::Before => start.checked_sub(advance),
            BillingTrigger::After => end.checked_add(advance),
        }
    };

    date.ok_or_else(|| BillingError::InvalidInput("scheduled date out of range".to_string()))
}

const SETTINGS_COLUMNS: &str = "id, user_id, client_id, booking_id, amount_cents, currency, \
     billing_type, frequency, trigger_type, advance_days, tax_rate_bps, created_at, updated_at";

#[derive(Clone)]
pub struct SettingsService {
    pool: PgPool,
}

impl SettingsService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, user_id: Uuid) -> BillingResult<Vec<BillingSettings>> {
        let sql = format!(
            "SELECT {} FROM billing_settings WHERE user_id = $1 \
             ORDER BY booking_id NULLS FIRST, client_id NULLS FIRST",
            SETTINGS_COLUMNS
        );
        Ok(sqlx::query_as::<_, BillingSettings>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn resolve_for_booking(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        booking_id: Uuid,
    ) -> BillingResult<BillingSettings> {
        self.try_resolve_for_booking(user_id, client_id, booking_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "No billing settings apply to booking {}",
                    booking_id
                ))
            })
    }

    /// Like [`Self::resolve_for_booking`] but `None` when nothing is configured
    pub async fn try_resolve_for_booking(
        &self,
        user_id: Uuid,
        client_id: Uuid,
        booking_id: Uuid,
    ) -> BillingResult<Option<BillingSettings>> {
        let sql = format!(
            "SELECT {} FROM billing_settings \
             WHERE user_id = $1 \
               AND (booking_id = $3 OR (booking_id IS NULL AND (client_id = $2 OR client_id IS NULL)))",
            SETTINGS_COLUMNS
        );
        let candidates = sqlx::query_as::<_, BillingSettings>(&sql)
            .bind(user_id)
            .bind(client_id)
            .bind(booking_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(pick_most_specific(&candidates, client_id, booking_id).cloned())
    }

    pub async fn upsert(&self, user_id: Uuid, input: &SettingsInput) -> BillingResult<BillingSettings> {
        input.validate()?;

        let conflict = match input.scope() {
            SettingsScope::User => {
                "(user_id) WHERE client_id IS NULL AND booking_id IS NULL"
            }
            SettingsScope::Client(_) => {
                "(user_id, client_id) WHERE client_id IS NOT NULL AND booking_id IS NULL"
            }
            SettingsScope::Booking(_) => "(booking_id) WHERE booking_id IS NOT NULL",
        };

        if let SettingsScope::Booking(booking_id) = input.scope() {
            let owner: Option<Uuid> =
                sqlx::query_scalar("SELECT user_id FROM bookings WHERE id = $1")
                    .bind(booking_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if owner != Some(user_id) {
                return Err(BillingError::NotFound(format!(
                    "Booking {} not found",
                    booking_id
                )));
            }
        }

        // booking-scoped rows do not carry client_id
        let client_id = match input.scope() {
            SettingsScope::Client(c) => Some(c),
            _ => None,
        };

        let sql = format!(
            r#"
            INSERT INTO billing_settings
                (user_id, client_id, booking_id, amount_cents, currency, billing_type,
                 frequency, trigger_type, advance_days, tax_rate_bps)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT {} DO UPDATE SET
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                billing_type = EXCLUDED.billing_type,
                frequency = EXCLUDED.frequency,
                trigger_type = EXCLUDED.trigger_type,
                advance_days = EXCLUDED.advance_days,
                tax_rate_bps = EXCLUDED.tax_rate_bps,
                updated_at = NOW()
            RETURNING {}
            "#,
            conflict, SETTINGS_COLUMNS
        );

        let row = sqlx::query_as::<_, BillingSettings>(&sql)
            .bind(user_id)
            .bind(client_id)
            .bind(input.booking_id)
            .bind(input.amount_cents)
            .bind(input.currency.to_ascii_lowercase())
            .bind(input.billing_type.as_str())
            .bind(input.frequency.as_str())
            .bind(input.trigger.as_str())
            .bind(input.advance_days)
            .bind(input.tax_rate_bps)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(
            user_id = %user_id,
            settings_id = %row.id,
            scope = ?row.scope(),
            "Billing settings saved"
        );

        Ok(row)
    }

    pub async fn delete(&self, user_id: Uuid, settings_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("DELETE FROM billing_settings WHERE id = $1 AND user_id = $2")
            .bind(settings_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Billing settings {} not found",
                settings_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::{date, datetime};

    pub(crate) fn settings(
        billing_type: BillingType,
        frequency: BillingFrequency,
        trigger: BillingTrigger,
        advance_days: i32,
    ) -> BillingSettings {
        BillingSettings {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            client_id: None,
            booking_id: None,
            amount_cents: 12_000,
            currency: "usd".to_string(),
            billing_type,
            frequency,
            trigger,
            advance_days,
            tax_rate_bps: 0,
            created_at: datetime!(2026-01-01 0:00 UTC),
            updated_at: datetime!(2026-01-01 0:00 UTC),
        }
    }

    fn consultation(trigger: BillingTrigger, advance: i32) -> BillingSettings {
        settings(
            BillingType::ConsultationBased,
            BillingFrequency::Weekly,
            trigger,
            advance,
        )
    }

    #[test]
    fn test_pick_most_specific_prefers_booking_then_client() {
        let client = Uuid::new_v4();
        let booking = Uuid::new_v4();

        let mut default = consultation(BillingTrigger::After, 0);
        default.amount_cents = 1;
        let mut per_client = default.clone();
        per_client.client_id = Some(client);
        per_client.amount_cents = 2;
        let mut per_booking = default.clone();
        per_booking.booking_id = Some(booking);
        per_booking.amount_cents = 3;
        let mut other_client = default.clone();
        other_client.client_id = Some(Uuid::new_v4());
        other_client.amount_cents = 4;

        let all = vec![
            default.clone(),
            other_client.clone(),
            per_client.clone(),
            per_booking,
        ];
        assert_eq!(pick_most_specific(&all, client, booking).unwrap().amount_cents, 3);

        let no_booking = vec![default.clone(), other_client.clone(), per_client];
        assert_eq!(
            pick_most_specific(&no_booking, client, booking).unwrap().amount_cents,
            2
        );

        let only_default = vec![other_client, default];
        assert_eq!(
            pick_most_specific(&only_default, client, booking).unwrap().amount_cents,
            1
        );

        assert!(pick_most_specific(&[], client, booking).is_none());
    }

    #[test]
    fn test_scheduled_date_consultation() {
        let start = datetime!(2026-03-10 15:00 UTC);
        let end = datetime!(2026-03-10 16:00 UTC);

        let before = consultation(BillingTrigger::Before, 3);
        assert_eq!(scheduled_date_for(&before, start, end).unwrap(), date!(2026 - 03 - 07));

        let after = consultation(BillingTrigger::After, 2);
        assert_eq!(scheduled_date_for(&after, start, end).unwrap(), date!(2026 - 03 - 12));
    }

    #[test]
    fn test_scheduled_date_monthly() {
        let start = datetime!(2026-12-15 15:00 UTC);
        let end = datetime!(2026-12-15 16:00 UTC);

        let after = settings(
            BillingType::Recurring,
            BillingFrequency::Monthly,
            BillingTrigger::After,
            0,
        );
        assert_eq!(scheduled_date_for(&after, start, end).unwrap(), date!(2027 - 01 - 01));

        let before = settings(
            BillingType::Recurring,
            BillingFrequency::Monthly,
            BillingTrigger::Before,
            5,
        );
        assert_eq!(scheduled_date_for(&before, start, end).unwrap(), date!(2026 - 11 - 26));
    }

    #[test]
    fn test_schedule_action() {
        let monthly = settings(
            BillingType::Recurring,
            BillingFrequency::Monthly,
            BillingTrigger::After,
            0,
        );
        assert_eq!(monthly.schedule_action(), ScheduleAction::ConsolidateInvoice);

        let weekly = settings(
            BillingType::Recurring,
            BillingFrequency::Weekly,
            BillingTrigger::After,
            0,
        );
        assert_eq!(weekly.schedule_action(), ScheduleAction::SendBill);
        assert_eq!(
            consultation(BillingTrigger::Before, 0).schedule_action(),
            ScheduleAction::SendBill
        );
    }

    #[test]
    fn test_input_validation() {
        let base = SettingsInput {
            client_id: None,
            booking_id: None,
            amount_cents: 5000,
            currency: "usd".to_string(),
            billing_type: BillingType::ConsultationBased,
            frequency: BillingFrequency::Weekly,
            trigger: BillingTrigger::After,
            advance_days: 0,
            tax_rate_bps: 0,
        };
        assert!(base.validate().is_ok());

        let mut negative = base.clone();
        negative.amount_cents = -1;
        assert!(negative.validate().is_err());

        let mut far = base.clone();
        far.advance_days = 61;
        assert!(far.validate().is_err());

        let mut edge = base.clone();
        edge.advance_days = 60;
        assert!(edge.validate().is_ok());

        let mut currency = base;
        currency.currency = "dollars".to_string();
        assert!(currency.validate().is_err());
    }
}
