//! Transactional email over the Resend HTTP API
//!
//! Sending is disabled (logged and skipped) when `RESEND_API_KEY` is unset so
//! local environments work without a provider. Callers in the booking and
//! payment paths use [`BillingEmailService::send_best_effort`]; a failed email
//! never fails the operation that triggered it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

const RESEND_API_BASE: &str = "https://api.resend.com";

/// Pause between messages in a bulk run, to stay under the provider rate limit
pub const BULK_SEND_DELAY: Duration = Duration::from_millis(600);

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from: String,
    pub api_base: String,
    pub app_base_url: String,
    pub max_retries: usize,
    pub bulk_delay: Duration,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Bookwell <billing@bookwell.app>".to_string()),
            api_base: RESEND_API_BASE.to_string(),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            max_retries: 3,
            bulk_delay: BULK_SEND_DELAY,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

/// A rendered message ready to hand to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(serde::Deserialize)]
struct ResendResponse {
    id: String,
}

#[derive(Debug)]
enum DeliveryError {
    /// Network errors, 429 and 5xx
    Transient(String),
    Permanent(String),
}

impl DeliveryError {
    fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    fn into_message(self) -> String {
        match self {
            DeliveryError::Transient(m) | DeliveryError::Permanent(m) => m,
        }
    }
}

/// Outcome counts for a bulk run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkSendReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: Arc<EmailConfig>,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> Self {
        let config = EmailConfig::from_env();
        if !config.is_enabled() {
            tracing::warn!("RESEND_API_KEY not set, outgoing email is disabled");
        }
        Self::new(config)
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    /// Send one message. Returns the provider message id, or `None` when
    /// sending is disabled.
    pub async fn send(&self, message: &EmailMessage) -> BillingResult<Option<String>> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::info!(to = %message.to, subject = %message.subject, "Email disabled, skipping send");
            return Ok(None);
        };

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            strategy,
            || self.deliver(api_key, message),
            |e: &DeliveryError| e.is_transient(),
        )
        .await;

        match result {
            Ok(id) => {
                tracing::info!(to = %message.to, message_id = %id, "Email sent");
                Ok(Some(id))
            }
            Err(e) => Err(BillingError::Email(e.into_message())),
        }
    }

    async fn deliver(&self, api_key: &str, message: &EmailMessage) -> Result<String, DeliveryError> {
        let body = ResendRequest {
            from: &self.config.from,
            to: [&message.to],
            subject: &message.subject,
            html: &message.html,
        };

        let response = self
            .http
            .post(format!("{}/emails", self.config.api_base))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let parsed: ResendResponse = response
                .json()
                .await
                .map_err(|e| DeliveryError::Permanent(format!("Invalid provider response: {}", e)))?;
            return Ok(parsed.id);
        }

        let text = response.text().await.unwrap_or_default();
        let msg = format!("Resend returned {}: {}", status, text);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(status = %status, "Transient email provider error");
            Err(DeliveryError::Transient(msg))
        } else {
            Err(DeliveryError::Permanent(msg))
        }
    }

    /// Send and swallow failures
    pub async fn send_best_effort(&self, message: &EmailMessage) {
        if let Err(e) = self.send(message).await {
            tracing::error!(to = %message.to, subject = %message.subject, error = %e, "Failed to send email");
        }
    }

    /// Send messages one at a time with a fixed pause between them
    pub async fn send_bulk(&self, messages: &[EmailMessage]) -> BulkSendReport {
        let mut report = BulkSendReport::default();

        for (i, message) in messages.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.bulk_delay).await;
            }
            match self.send(message).await {
                Ok(Some(_)) => report.sent += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(to = %message.to, error = %e, "Bulk email send failed");
                }
            }
        }

        tracing::info!(
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            "Bulk email run finished"
        );
        report
    }

    pub fn link(&self, path: &str) -> String {
        format!("{}{}", self.config.app_base_url, path)
    }
}

/// "$12.50" style amount for display
pub fn format_amount(amount_cents: i64, currency: &str) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.unsigned_abs();
    let major = abs / 100;
    let minor = abs % 100;
    match currency.to_ascii_lowercase().as_str() {
        "usd" | "cad" | "aud" => format!("{}${}.{:02}", sign, major, minor),
        "eur" => format!("{}€{}.{:02}", sign, major, minor),
        "gbp" => format!("{}£{}.{:02}", sign, major, minor),
        other => format!("{}{}.{:02} {}", sign, major, minor, other.to_uppercase()),
    }
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(heading: &str, body: &str) -> String {
    format!(
        "<div style=\"font-family:sans-serif;max-width:560px;margin:0 auto\">\
         <h2>{}</h2>{}<p style=\"color:#888;font-size:12px\">Sent by Bookwell</p></div>",
        escape(heading),
        body
    )
}

fn button(url: &str, label: &str) -> String {
    format!(
        "<p><a href=\"{}\" style=\"background:#2f6fed;color:#fff;padding:10px 16px;\
         border-radius:6px;text-decoration:none\">{}</a></p>",
        escape(url),
        escape(label)
    )
}

impl EmailMessage {
    pub fn bill_due(
        to: &str,
        client_name: &str,
        practitioner: &str,
        session_date: &str,
        amount: &str,
        pay_url: &str,
    ) -> Self {
        let body = format!(
            "<p>Hi {},</p><p>{} has sent you a bill of <strong>{}</strong> for your session on {}.</p>{}",
            escape(client_name),
            escape(practitioner),
            escape(amount),
            escape(session_date),
            button(pay_url, "Pay now")
        );
        Self {
            to: to.to_string(),
            subject: format!("Bill from {} for {}", practitioner, amount),
            html: layout("Your bill is ready", &body),
        }
    }

    /// Summary of a monthly draft invoice, sent to the practitioner
    pub fn invoice_consolidated(
        to: &str,
        client_name: &str,
        period_label: &str,
        bill_count: usize,
        total: &str,
        invoice_url: &str,
    ) -> Self {
        let body = format!(
            "<p>The {} invoice for {} now covers {} session(s) totalling <strong>{}</strong>.</p>\
             <p>Review it and issue it when you're ready.</p>{}",
            escape(period_label),
            escape(client_name),
            bill_count,
            escape(total),
            button(invoice_url, "Review invoice")
        );
        Self {
            to: to.to_string(),
            subject: format!("Invoice for {} updated ({})", client_name, period_label),
            html: layout("Monthly invoice updated", &body),
        }
    }

    pub fn invoice_issued(
        to: &str,
        client_name: &str,
        practitioner: &str,
        period_label: &str,
        total: &str,
        pay_url: &str,
    ) -> Self {
        let body = format!(
            "<p>Hi {},</p><p>{} has issued your invoice for {}: <strong>{}</strong>.</p>{}",
            escape(client_name),
            escape(practitioner),
            escape(period_label),
            escape(total),
            button(pay_url, "Pay invoice")
        );
        Self {
            to: to.to_string(),
            subject: format!("Invoice from {} for {}", practitioner, period_label),
            html: layout("Your invoice", &body),
        }
    }

    pub fn booking_confirmation(
        to: &str,
        client_name: &str,
        practitioner: &str,
        when: &str,
    ) -> Self {
        let body = format!(
            "<p>Hi {},</p><p>Your session with {} is booked for <strong>{}</strong>.</p>",
            escape(client_name),
            escape(practitioner),
            escape(when)
        );
        Self {
            to: to.to_string(),
            subject: format!("Booking confirmed with {}", practitioner),
            html: layout("Booking confirmed", &body),
        }
    }

    pub fn booking_canceled(
        to: &str,
        client_name: &str,
        practitioner: &str,
        when: &str,
        reason: Option<&str>,
    ) -> Self {
        let reason_html = reason
            .map(|r| format!("<p>Reason: {}</p>", escape(r)))
            .unwrap_or_default();
        let body = format!(
            "<p>Hi {},</p><p>Your session with {} on {} has been canceled.</p>{}",
            escape(client_name),
            escape(practitioner),
            escape(when),
            reason_html
        );
        Self {
            to: to.to_string(),
            subject: format!("Session with {} canceled", practitioner),
            html: layout("Booking canceled", &body),
        }
    }

    pub fn refund_issued(to: &str, client_name: &str, practitioner: &str, amount: &str) -> Self {
        let body = format!(
            "<p>Hi {},</p><p>{} has refunded <strong>{}</strong> to your original payment method. \
             It can take 5 to 10 business days to appear.</p>",
            escape(client_name),
            escape(practitioner),
            escape(amount)
        );
        Self {
            to: to.to_string(),
            subject: format!("Refund of {} from {}", amount, practitioner),
            html: layout("Refund issued", &body),
        }
    }

    pub fn payment_receipt(to: &str, client_name: &str, practitioner: &str, amount: &str) -> Self {
        let body = format!(
            "<p>Hi {},</p><p>We received your payment of <strong>{}</strong> to {}. Thank you!</p>",
            escape(client_name),
            escape(amount),
            escape(practitioner)
        );
        Self {
            to: to.to_string(),
            subject: format!("Receipt for your payment to {}", practitioner),
            html: layout("Payment received", &body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_base: String, api_key: Option<&str>) -> EmailConfig {
        EmailConfig {
            api_key: api_key.map(str::to_string),
            from: "Bookwell <test@bookwell.app>".to_string(),
            api_base,
            app_base_url: "http://localhost:3000".to_string(),
            max_retries: 2,
            bulk_delay: Duration::from_millis(1),
        }
    }

    fn message() -> EmailMessage {
        EmailMessage::payment_receipt("client@example.com", "Sam", "Dr. Lee", "$80.00")
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(8000, "usd"), "$80.00");
        assert_eq!(format_amount(1205, "EUR"), "€12.05");
        assert_eq!(format_amount(-150, "gbp"), "-£1.50");
        assert_eq!(format_amount(99, "chf"), "0.99 CHF");
    }

    #[test]
    fn test_templates_escape_user_input() {
        let msg = EmailMessage::booking_canceled(
            "a@b.c",
            "<script>",
            "Dr. Lee",
            "Mon 10:00",
            Some("sick & tired"),
        );
        assert!(msg.html.contains("&lt;script&gt;"));
        assert!(msg.html.contains("sick &amp; tired"));
        assert!(!msg.html.contains("<script>"));
    }

    #[tokio::test]
    async fn test_send_disabled_without_key() {
        let service = BillingEmailService::new(config("http://unused".to_string(), None));
        assert_eq!(service.send(&message()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_posts_to_resend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "to": ["client@example.com"]
            })))
            .with_status(200)
            .with_body(r#"{"id":"msg_123"}"#)
            .create_async()
            .await;

        let service = BillingEmailService::new(config(server.url(), Some("re_test")));
        let id = service.send(&message()).await.unwrap();

        assert_eq!(id.as_deref(), Some("msg_123"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        // first attempt + 2 retries
        let mock = server
            .mock("POST", "/emails")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let mut cfg = config(server.url(), Some("re_test"));
        cfg.max_retries = 2;
        let service = BillingEmailService::new(cfg);

        let err = service.send(&message()).await.unwrap_err();
        assert!(matches!(err, BillingError::Email(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid to"}"#)
            .expect(1)
            .create_async()
            .await;

        let service = BillingEmailService::new(config(server.url(), Some("re_test")));
        assert!(service.send(&message()).await.is_err());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_bulk_counts_outcomes() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server
            .mock("POST", "/emails")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "to": ["ok@example.com"]
            })))
            .with_status(200)
            .with_body(r#"{"id":"msg_ok"}"#)
            .expect(2)
            .create_async()
            .await;
        let _bad = server
            .mock("POST", "/emails")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "to": ["bad@example.com"]
            })))
            .with_status(400)
            .create_async()
            .await;

        let service = BillingEmailService::new(config(server.url(), Some("re_test")));
        let mk = |to: &str| EmailMessage::payment_receipt(to, "Sam", "Dr. Lee", "$1.00");
        let report = service
            .send_bulk(&[mk("ok@example.com"), mk("bad@example.com"), mk("ok@example.com")])
            .await;

        assert_eq!(
            report,
            BulkSendReport {
                sent: 2,
                skipped: 0,
                failed: 1
            }
        );
    }
}
