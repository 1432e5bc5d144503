// API crate clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Bookwell API Library
//!
//! HTTP server for practitioners: bookings, billing settings and invoices,
//! Stripe Connect onboarding and webhooks, Google Calendar connection, and
//! cron entry points for scheduled billing.

pub mod auth;
pub mod bookings;
pub mod calendar;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
