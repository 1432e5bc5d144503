//! Google OAuth and Calendar v3 REST client

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use super::CalendarError;
use crate::config::GoogleOAuthConfig;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

const SCOPES: &str = "https://www.googleapis.com/auth/calendar.events email";

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl TokenResponse {
    pub fn expires_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + time::Duration::seconds(self.expires_in)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    pub date_time: String,
    pub time_zone: String,
}

/// Body for event insert and patch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventPayload {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
}

fn rfc3339(at: OffsetDateTime) -> Result<String, CalendarError> {
    chrono::DateTime::from_timestamp(at.unix_timestamp(), 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .ok_or_else(|| CalendarError::Parse(format!("timestamp out of range: {}", at)))
}

impl EventPayload {
    pub fn for_booking(
        client_name: &str,
        notes: Option<&str>,
        start: OffsetDateTime,
        end: OffsetDateTime,
        timezone: &str,
    ) -> Result<Self, CalendarError> {
        Ok(Self {
            summary: format!("Session with {}", client_name),
            description: notes.map(str::to_string),
            start: EventTime {
                date_time: rfc3339(start)?,
                time_zone: timezone.to_string(),
            },
            end: EventTime {
                date_time: rfc3339(end)?,
                time_zone: timezone.to_string(),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreatedEvent {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    http: Client,
    config: GoogleOAuthConfig,
    auth_url: String,
    token_url: String,
    userinfo_url: String,
    api_base: String,
}

impl GoogleCalendarClient {
    pub fn new(http: Client, config: GoogleOAuthConfig) -> Self {
        Self {
            http,
            config,
            auth_url: AUTH_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            userinfo_url: USERINFO_URL.to_string(),
            api_base: CALENDAR_API.to_string(),
        }
    }

    /// Point every endpoint at `base` (mock servers)
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.auth_url = format!("{}/o/oauth2/v2/auth", base);
        self.token_url = format!("{}/token", base);
        self.userinfo_url = format!("{}/oauth2/v2/userinfo", base);
        self.api_base = format!("{}/calendar/v3", base);
        self
    }

    pub fn authorize_url(&self, state: &str) -> Result<String, CalendarError> {
        let url = Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", SCOPES),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| CalendarError::Parse(e.to_string()))?;
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, CalendarError> {
        self.token_request(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, CalendarError> {
        self.token_request(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, CalendarError> {
        let response = self.http.post(&self.token_url).form(form).send().await?;
        let response = check(response).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| CalendarError::Parse(e.to_string()))
    }

    pub async fn user_email(&self, access_token: &str) -> Result<Option<String>, CalendarError> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        let info: UserInfo = check(response)
            .await?
            .json()
            .await
            .map_err(|e| CalendarError::Parse(e.to_string()))?;
        Ok(info.email)
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!("{}/calendars/{}/events", self.api_base, calendar_id)
    }

    /// Create an event, returning its Google id
    pub async fn insert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &EventPayload,
    ) -> Result<String, CalendarError> {
        let response = self
            .http
            .post(self.events_url(calendar_id))
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await?;
        let created: CreatedEvent = check(response)
            .await?
            .json()
            .await
            .map_err(|e| CalendarError::Parse(e.to_string()))?;
        Ok(created.id)
    }

    pub async fn patch_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &EventPayload,
    ) -> Result<(), CalendarError> {
        let response = self
            .http
            .patch(format!("{}/{}", self.events_url(calendar_id), event_id))
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Delete an event; already-deleted events count as success
    pub async fn cancel_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), CalendarError> {
        let response = self
            .http
            .delete(format!("{}/{}", self.events_url(calendar_id), event_id))
            .bearer_auth(access_token)
            .send()
            .await?;

        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            tracing::debug!(event_id = %event_id, "Calendar event already gone");
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, CalendarError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(CalendarError::Api {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use time::macros::datetime;

    fn client(base: &str) -> GoogleCalendarClient {
        GoogleCalendarClient::new(
            Client::new(),
            GoogleOAuthConfig {
                client_id: "client-123".to_string(),
                client_secret: "shh".to_string(),
                redirect_uri: "https://api.example.com/calendar/callback".to_string(),
            },
        )
        .with_base_url(base)
    }

    fn payload() -> EventPayload {
        EventPayload::for_booking(
            "Ada",
            Some("First session"),
            datetime!(2026-03-02 15:00 UTC),
            datetime!(2026-03-02 15:50 UTC),
            "America/New_York",
        )
        .unwrap()
    }

    #[test]
    fn test_authorize_url() {
        let url = client("https://accounts.example.com")
            .authorize_url("abc.123.sig")
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["state"], "abc.123.sig");
        assert_eq!(params["access_type"], "offline");
        assert!(params["scope"].contains("calendar.events"));
    }

    #[test]
    fn test_event_payload_shape() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(json["summary"], "Session with Ada");
        assert_eq!(json["start"]["dateTime"], "2026-03-02T15:00:00Z");
        assert_eq!(json["end"]["timeZone"], "America/New_York");
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at","refresh_token":"rt","expires_in":3599}"#)
            .create_async()
            .await;

        let tokens = client(&server.url()).exchange_code("auth-code").await.unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let err = client(&server.url()).refresh("revoked").await.unwrap_err();
        assert!(matches!(err, CalendarError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_insert_event() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/calendar/v3/calendars/primary/events")
            .match_header("authorization", "Bearer at")
            .match_body(Matcher::PartialJson(
                serde_json::json!({"summary": "Session with Ada"}),
            ))
            .with_status(200)
            .with_body(r#"{"id":"evt_1","status":"confirmed"}"#)
            .create_async()
            .await;

        let id = client(&server.url())
            .insert_event("at", "primary", &payload())
            .await
            .unwrap();
        assert_eq!(id, "evt_1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_event_already_deleted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/calendar/v3/calendars/primary/events/evt_1")
            .with_status(410)
            .create_async()
            .await;

        assert!(client(&server.url())
            .cancel_event("at", "primary", "evt_1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_patch_event_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PATCH", "/calendar/v3/calendars/primary/events/evt_1")
            .with_status(401)
            .create_async()
            .await;

        let err = client(&server.url())
            .patch_event("expired", "primary", "evt_1", &payload())
            .await
            .unwrap_err();
        assert!(matches!(err, CalendarError::Api { status: 401, .. }));
    }
}
