//! Bookwell shared types
//!
//! Domain enums, database pool helpers, and recurrence date math used by
//! the API server, billing crate, and background worker.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod recurrence;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use recurrence::{
    first_of_next_month, generate_occurrences, month_period, occurrence_end, parse_timezone,
    resolve_local, Occurrence, RecurrenceError, MAX_DURATION_MINUTES, MAX_OCCURRENCES,
};
pub use types::{
    BillStatus, BillingFrequency, BillingTrigger, BillingType, BookingStatus, InvoiceStatus,
    ParseEnumError, PaymentSessionStatus, RecurrencePattern, ScheduleAction, ScheduleStatus,
};
