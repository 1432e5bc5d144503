//! Mirrors booking lifecycle changes into the practitioner's Google Calendar

use bookwell_billing::booking::{get_context, BookingContext};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::google::{EventPayload, GoogleCalendarClient, TokenResponse};
use super::CalendarError;

/// Refresh access tokens this long before they expire
const REFRESH_MARGIN: time::Duration = time::Duration::seconds(60);

#[derive(Debug, Clone, sqlx::FromRow)]
struct CalendarConnection {
    access_token: String,
    refresh_token: Option<String>,
    token_expires_at: OffsetDateTime,
    calendar_id: String,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ConnectionStatus {
    pub google_email: Option<String>,
    pub calendar_id: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct CalendarSync {
    pool: PgPool,
    client: Option<GoogleCalendarClient>,
}

impl CalendarSync {
    pub fn new(pool: PgPool, client: Option<GoogleCalendarClient>) -> Self {
        Self { pool, client }
    }

    pub fn client(&self) -> Result<&GoogleCalendarClient, CalendarError> {
        self.client.as_ref().ok_or(CalendarError::NotConfigured)
    }

    /// Finish the OAuth flow: exchange the code and store the connection
    pub async fn connect(&self, user_id: Uuid, code: &str) -> Result<(), CalendarError> {
        let client = self.client()?;
        let tokens = client.exchange_code(code).await?;
        let email = match client.user_email(&tokens.access_token).await {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Could not read Google account email");
                None
            }
        };
        self.save_connection(user_id, &tokens, email.as_deref()).await
    }

    pub async fn save_connection(
        &self,
        user_id: Uuid,
        tokens: &TokenResponse,
        google_email: Option<&str>,
    ) -> Result<(), CalendarError> {
        // Google omits the refresh token on re-consent; keep the stored one
        sqlx::query(
            r#"
            INSERT INTO calendar_connections
                (user_id, google_email, access_token, refresh_token, token_expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                google_email = COALESCE(EXCLUDED.google_email, calendar_connections.google_email),
                access_token = EXCLUDED.access_token,
                refresh_token = COALESCE(EXCLUDED.refresh_token, calendar_connections.refresh_token),
                token_expires_at = EXCLUDED.token_expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(google_email)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, "Google Calendar connected");
        Ok(())
    }

    pub async fn status(&self, user_id: Uuid) -> Result<ConnectionStatus, CalendarError> {
        sqlx::query_as::<_, ConnectionStatus>(
            "SELECT google_email, calendar_id, created_at FROM calendar_connections WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CalendarError::NotConnected)
    }

    pub async fn disconnect(&self, user_id: Uuid) -> Result<(), CalendarError> {
        let result = sqlx::query("DELETE FROM calendar_connections WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CalendarError::NotConnected);
        }
        tracing::info!(user_id = %user_id, "Google Calendar disconnected");
        Ok(())
    }

    /// A usable access token, refreshed if close to expiry. `None` when not connected.
    async fn access(&self, user_id: Uuid) -> Result<Option<(String, String)>, CalendarError> {
        let Some(client) = self.client.as_ref() else {
            return Ok(None);
        };
        let Some(conn) = sqlx::query_as::<_, CalendarConnection>(
            r#"
            SELECT access_token, refresh_token, token_expires_at, calendar_id
            FROM calendar_connections WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        if conn.token_expires_at - REFRESH_MARGIN > now {
            return Ok(Some((conn.access_token, conn.calendar_id)));
        }

        let Some(refresh_token) = conn.refresh_token.as_deref() else {
            tracing::warn!(user_id = %user_id, "Calendar token expired and no refresh token stored");
            return Ok(None);
        };

        let tokens = client.refresh(refresh_token).await?;
        sqlx::query(
            r#"
            UPDATE calendar_connections
            SET access_token = $2,
                refresh_token = COALESCE($3, refresh_token),
                token_expires_at = $4,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at(now))
        .execute(&self.pool)
        .await?;

        tracing::debug!(user_id = %user_id, "Calendar access token refreshed");
        Ok(Some((tokens.access_token, conn.calendar_id)))
    }

    async fn active_event(&self, booking_id: Uuid) -> Result<Option<(Uuid, String)>, CalendarError> {
        Ok(sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, google_event_id FROM calendar_events WHERE booking_id = $1 AND status = 'active'",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn context(&self, booking_id: Uuid) -> Result<BookingContext, CalendarError> {
        get_context(&self.pool, booking_id)
            .await
            .map_err(|e| CalendarError::Database(e.to_string()))
    }

    fn payload(ctx: &BookingContext) -> Result<EventPayload, CalendarError> {
        EventPayload::for_booking(
            &ctx.client_name,
            ctx.booking.notes.as_deref(),
            ctx.booking.start_time,
            ctx.booking.end_time,
            &ctx.timezone,
        )
    }

    async fn upsert_event(&self, booking_id: Uuid) -> Result<(), CalendarError> {
        let ctx = self.context(booking_id).await?;
        let Some((token, calendar_id)) = self.access(ctx.booking.user_id).await? else {
            return Ok(());
        };
        let payload = Self::payload(&ctx)?;
        let client = self.client()?;

        if let Some((_, event_id)) = self.active_event(booking_id).await? {
            client
                .patch_event(&token, &calendar_id, &event_id, &payload)
                .await?;
            sqlx::query(
                "UPDATE calendar_events SET updated_at = NOW() WHERE booking_id = $1 AND status = 'active'",
            )
            .bind(booking_id)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let event_id = client.insert_event(&token, &calendar_id, &payload).await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO calendar_events (booking_id, user_id, google_event_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (booking_id) WHERE status = 'active' DO NOTHING
            "#,
        )
        .bind(booking_id)
        .bind(ctx.booking.user_id)
        .bind(&event_id)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            // lost a race with a concurrent sync; drop the duplicate
            client.cancel_event(&token, &calendar_id, &event_id).await?;
        }
        Ok(())
    }

    async fn cancel_event(&self, booking_id: Uuid) -> Result<(), CalendarError> {
        let Some((row_id, event_id)) = self.active_event(booking_id).await? else {
            return Ok(());
        };
        let user_id: Uuid = sqlx::query_scalar("SELECT user_id FROM calendar_events WHERE id = $1")
            .bind(row_id)
            .fetch_one(&self.pool)
            .await?;

        if let Some((token, calendar_id)) = self.access(user_id).await? {
            self.client()?
                .cancel_event(&token, &calendar_id, &event_id)
                .await?;
        }

        sqlx::query("UPDATE calendar_events SET status = 'canceled', updated_at = NOW() WHERE id = $1")
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn on_booking_created(&self, booking_id: Uuid) {
        if let Err(e) = self.upsert_event(booking_id).await {
            tracing::warn!(booking_id = %booking_id, error = %e, "Calendar create failed");
        }
    }

    pub async fn on_booking_updated(&self, booking_id: Uuid) {
        if let Err(e) = self.upsert_event(booking_id).await {
            tracing::warn!(booking_id = %booking_id, error = %e, "Calendar update failed");
        }
    }

    pub async fn on_booking_canceled(&self, booking_id: Uuid) {
        if let Err(e) = self.cancel_event(booking_id).await {
            tracing::warn!(booking_id = %booking_id, error = %e, "Calendar cancel failed");
        }
    }
}
