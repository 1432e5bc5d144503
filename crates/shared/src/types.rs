//! Status and configuration enums shared by the API, billing, and worker crates.
//!
//! Rows keep these as TEXT columns; services convert with `as_str()` / `parse()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Returned when a stored string does not match any known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle of an appointment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Scheduled,
    Completed,
    Canceled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Completed => "completed",
            BookingStatus::Canceled => "canceled",
        }
    }

    /// Canceled and completed bookings accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Canceled)
    }
}

impl FromStr for BookingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "scheduled" => Ok(BookingStatus::Scheduled),
            "completed" => Ok(BookingStatus::Completed),
            // Older rows were written with the British spelling
            "canceled" | "cancelled" => Ok(BookingStatus::Canceled),
            other => Err(ParseEnumError::new("booking status", other)),
        }
    }
}

/// Status of a single line-item charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Scheduled,
    Pending,
    Sent,
    Paid,
    Disputed,
    Canceled,
    Refunded,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Scheduled => "scheduled",
            BillStatus::Pending => "pending",
            BillStatus::Sent => "sent",
            BillStatus::Paid => "paid",
            BillStatus::Disputed => "disputed",
            BillStatus::Canceled => "canceled",
            BillStatus::Refunded => "refunded",
        }
    }

    /// Bills that have not been collected yet and may still be canceled or invoiced
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            BillStatus::Scheduled | BillStatus::Pending | BillStatus::Sent
        )
    }

    /// SQL list literal of open statuses, for `status IN (...)` clauses
    pub const OPEN_SQL: &'static str = "('scheduled', 'pending', 'sent')";
}

impl FromStr for BillStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(BillStatus::Scheduled),
            "pending" => Ok(BillStatus::Pending),
            "sent" => Ok(BillStatus::Sent),
            "paid" => Ok(BillStatus::Paid),
            "disputed" => Ok(BillStatus::Disputed),
            "canceled" | "cancelled" => Ok(BillStatus::Canceled),
            "refunded" => Ok(BillStatus::Refunded),
            other => Err(ParseEnumError::new("bill status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Canceled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "issued" => Ok(InvoiceStatus::Issued),
            "paid" => Ok(InvoiceStatus::Paid),
            "canceled" | "cancelled" => Ok(InvoiceStatus::Canceled),
            other => Err(ParseEnumError::new("invoice status", other)),
        }
    }
}

/// How a practitioner bills a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    /// Bills accumulate and are consolidated per period
    Recurring,
    /// One bill per appointment, sent relative to that appointment
    ConsultationBased,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::Recurring => "recurring",
            BillingType::ConsultationBased => "consultation_based",
        }
    }
}

impl FromStr for BillingType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recurring" => Ok(BillingType::Recurring),
            "consultation_based" => Ok(BillingType::ConsultationBased),
            other => Err(ParseEnumError::new("billing type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingFrequency {
    Weekly,
    Monthly,
}

impl BillingFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingFrequency::Weekly => "weekly",
            BillingFrequency::Monthly => "monthly",
        }
    }
}

impl FromStr for BillingFrequency {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(BillingFrequency::Weekly),
            "monthly" => Ok(BillingFrequency::Monthly),
            other => Err(ParseEnumError::new("billing frequency", other)),
        }
    }
}

/// Whether the bill goes out before or after the appointment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingTrigger {
    Before,
    After,
}

impl BillingTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingTrigger::Before => "before",
            BillingTrigger::After => "after",
        }
    }
}

impl FromStr for BillingTrigger {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(BillingTrigger::Before),
            "after" => Ok(BillingTrigger::After),
            other => Err(ParseEnumError::new("billing trigger", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Processed,
    /// Gave up after too many attempts
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Processed => "processed",
            ScheduleStatus::Failed => "failed",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScheduleStatus::Pending),
            "processed" => Ok(ScheduleStatus::Processed),
            "failed" => Ok(ScheduleStatus::Failed),
            other => Err(ParseEnumError::new("schedule status", other)),
        }
    }
}

/// What a billing schedule row does when it comes due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAction {
    SendBill,
    ConsolidateInvoice,
}

impl ScheduleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleAction::SendBill => "send_bill",
            ScheduleAction::ConsolidateInvoice => "consolidate_invoice",
        }
    }
}

impl FromStr for ScheduleAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_bill" => Ok(ScheduleAction::SendBill),
            "consolidate_invoice" => Ok(ScheduleAction::ConsolidateInvoice),
            other => Err(ParseEnumError::new("schedule action", other)),
        }
    }
}

/// Local mirror of a Stripe Checkout Session's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSessionStatus {
    Open,
    Completed,
    Expired,
    Canceled,
}

impl PaymentSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentSessionStatus::Open => "open",
            PaymentSessionStatus::Completed => "completed",
            PaymentSessionStatus::Expired => "expired",
            PaymentSessionStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for PaymentSessionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PaymentSessionStatus::Open),
            "completed" => Ok(PaymentSessionStatus::Completed),
            "expired" => Ok(PaymentSessionStatus::Expired),
            "canceled" | "cancelled" => Ok(PaymentSessionStatus::Canceled),
            other => Err(ParseEnumError::new("payment session status", other)),
        }
    }
}

/// Repeat cadence for a booking series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrencePattern {
    Weekly,
    Biweekly,
}

impl RecurrencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Biweekly => "biweekly",
        }
    }

    pub fn interval_days(&self) -> i64 {
        match self {
            RecurrencePattern::Weekly => 7,
            RecurrencePattern::Biweekly => 14,
        }
    }
}

impl FromStr for RecurrencePattern {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(RecurrencePattern::Weekly),
            "biweekly" | "bi-weekly" => Ok(RecurrencePattern::Biweekly),
            other => Err(ParseEnumError::new("recurrence pattern", other)),
        }
    }
}

// Display mirrors storage; TryFrom<String> lets row structs use `#[sqlx(try_from = "String")]`
macro_rules! impl_text_column {
    ($($ty:ty),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl TryFrom<String> for $ty {
                type Error = ParseEnumError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }
        )*
    };
}

impl_text_column!(
    BookingStatus,
    BillStatus,
    InvoiceStatus,
    BillingType,
    BillingFrequency,
    BillingTrigger,
    ScheduleStatus,
    ScheduleAction,
    PaymentSessionStatus,
    RecurrencePattern,
);
