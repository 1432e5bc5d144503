//! HTTP routes

pub mod admin;
pub mod billing;
pub mod bookings;
pub mod calendar;
pub mod cron;
pub mod health;
pub mod payments;
pub mod stripe_connect;
pub mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Practitioner routes (Supabase session required)
    let protected = Router::new()
        .route(
            "/bookings",
            get(bookings::list_bookings).post(bookings::create_booking),
        )
        .route("/bookings/{id}", get(bookings::get_booking))
        .route("/bookings/{id}/confirm", post(bookings::confirm_booking))
        .route("/bookings/{id}/cancel", post(bookings::cancel_booking))
        .route("/bookings/{id}/reschedule", post(bookings::reschedule_booking))
        .route("/bookings/{id}/refund", post(bookings::refund_booking))
        .route(
            "/billing/settings",
            get(billing::list_settings).put(billing::upsert_settings),
        )
        .route("/billing/settings/{id}", delete(billing::delete_settings))
        .route("/billing/invoices", get(billing::list_invoices))
        .route("/billing/invoices/{id}", get(billing::get_invoice))
        .route("/billing/invoices/{id}/issue", post(billing::issue_invoice))
        .route("/billing/invoices/{id}/cancel", post(billing::cancel_invoice))
        .route("/billing/invoices/{id}/pdf", put(billing::set_invoice_pdf))
        .route(
            "/billing/consolidation",
            get(billing::preview_consolidation).post(billing::run_consolidation),
        )
        .route("/billing/refunds", get(billing::refund_history))
        .route("/payments/checkout", post(payments::create_checkout))
        .route("/stripe/connect", post(stripe_connect::start_onboarding))
        .route("/stripe/account", get(stripe_connect::get_account))
        .route("/calendar/connect", get(calendar::connect))
        .route(
            "/calendar/connection",
            get(calendar::connection_status).delete(calendar::disconnect),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    // Browser redirects, Stripe, cron and operator routes authenticate themselves
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/stripe/connect/return", get(stripe_connect::onboarding_return))
        .route("/stripe/connect/refresh", get(stripe_connect::onboarding_refresh))
        .route("/calendar/callback", get(calendar::callback))
        .route("/cron/billing", post(cron::run_billing))
        .route("/cron/consolidation", post(cron::run_consolidation))
        .route("/admin/invariants", get(admin::run_invariants))
        .route("/admin/webhooks/failed", get(admin::list_failed_webhooks))
        .route(
            "/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook),
        );

    public.merge(protected).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    fn app() -> Router {
        // never connects unless a handler touches the database
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/bookwell_test")
            .unwrap();
        create_router(AppState::new(pool, test_config()))
    }

    async fn status_of(request: Request<Body>) -> StatusCode {
        app().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_protected_routes_require_auth() {
        for (method, uri) in [
            ("GET", "/bookings"),
            ("POST", "/bookings/00000000-0000-0000-0000-000000000000/cancel"),
            ("GET", "/billing/invoices"),
            ("POST", "/payments/checkout"),
            ("GET", "/calendar/connect"),
        ] {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            assert_eq!(status_of(request).await, StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_cron_rejects_wrong_secret() {
        let request = Request::builder()
            .method("POST")
            .uri("/cron/billing")
            .header("Authorization", "Bearer not-the-secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_rejects_missing_secret() {
        let request = Request::builder()
            .uri("/admin/invariants")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_unavailable_without_billing() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("stripe-signature", "t=1,v1=00")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(status_of(request).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_calendar_callback_redirects_on_bad_state() {
        let request = Request::builder()
            .uri("/calendar/callback?code=abc&state=forged")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("https://app.example.com/error?reason="));
    }

    #[tokio::test]
    async fn test_unsigned_onboarding_refresh_redirects_to_error() {
        let request = Request::builder()
            .uri("/stripe/connect/refresh?account=acct_123")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("https://app.example.com/error?reason="));
    }
}
