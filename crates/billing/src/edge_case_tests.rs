// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests across the billing pipeline
//!
//! - Bill creation from resolved settings
//! - Monthly consolidation reruns
//! - Booking cancellation
//! - Duplicate checkout completion
//! - Refund preconditions
//! - Queue retries

#[cfg(test)]
mod bill_creation_tests {
    use crate::bills::plan_bill;
    use crate::settings::pick_most_specific;
    use crate::settings::tests::settings;
    use bookwell_shared::{BillingFrequency, BillingTrigger, BillingType, ScheduleAction};
    use time::macros::{date, datetime};
    use uuid::Uuid;

    // =========================================================================
    // Bill amount is copied from the resolved settings at creation
    // =========================================================================
    #[test]
    fn test_bill_amount_equals_settings_amount() {
        let mut s = settings(
            BillingType::ConsultationBased,
            BillingFrequency::Weekly,
            BillingTrigger::After,
            0,
        );
        s.amount_cents = 8_750;
        s.currency = "eur".to_string();

        let plan = plan_bill(
            datetime!(2026-05-04 14:00 UTC),
            datetime!(2026-05-04 15:00 UTC),
            &s,
        )
        .unwrap();

        assert_eq!(plan.amount_cents, 8_750);
        assert_eq!(plan.currency, "eur");
        assert_eq!(plan.action, ScheduleAction::SendBill);
        assert_eq!(plan.due_date, date!(2026 - 05 - 04));
    }

    // =========================================================================
    // Booking-level override wins over client and practitioner defaults
    // =========================================================================
    #[test]
    fn test_bill_uses_most_specific_settings_amount() {
        let client = Uuid::new_v4();
        let booking = Uuid::new_v4();

        let mut default = settings(
            BillingType::ConsultationBased,
            BillingFrequency::Weekly,
            BillingTrigger::After,
            0,
        );
        default.amount_cents = 10_000;
        let mut per_client = default.clone();
        per_client.id = Uuid::new_v4();
        per_client.client_id = Some(client);
        per_client.amount_cents = 9_000;
        let mut per_booking = default.clone();
        per_booking.id = Uuid::new_v4();
        per_booking.booking_id = Some(booking);
        per_booking.amount_cents = 5_000;

        let all = vec![default, per_client.clone(), per_booking];

        let chosen = pick_most_specific(&all, client, booking).unwrap();
        let plan = plan_bill(
            datetime!(2026-05-04 14:00 UTC),
            datetime!(2026-05-04 15:00 UTC),
            chosen,
        )
        .unwrap();
        assert_eq!(plan.amount_cents, 5_000);

        // a different booking for the same client falls back to the client row
        let other = pick_most_specific(&all, client, Uuid::new_v4()).unwrap();
        assert_eq!(other.id, per_client.id);
    }

    // =========================================================================
    // Recurring monthly bills queue for consolidation, not a direct send
    // =========================================================================
    #[test]
    fn test_recurring_monthly_consolidates_next_month() {
        let s = settings(
            BillingType::Recurring,
            BillingFrequency::Monthly,
            BillingTrigger::After,
            2,
        );
        let plan = plan_bill(
            datetime!(2026-12-28 23:00 UTC),
            datetime!(2026-12-29 00:00 UTC),
            &s,
        )
        .unwrap();

        assert_eq!(plan.action, ScheduleAction::ConsolidateInvoice);
        assert_eq!(plan.due_date, date!(2027 - 01 - 03));
        assert_eq!(plan.amount_cents, s.amount_cents);
    }

    // =========================================================================
    // Zero-amount settings still produce a bill row (free intro sessions)
    // =========================================================================
    #[test]
    fn test_zero_amount_bill() {
        let mut s = settings(
            BillingType::ConsultationBased,
            BillingFrequency::Weekly,
            BillingTrigger::Before,
            1,
        );
        s.amount_cents = 0;
        let plan = plan_bill(
            datetime!(2026-05-04 14:00 UTC),
            datetime!(2026-05-04 15:00 UTC),
            &s,
        )
        .unwrap();
        assert_eq!(plan.amount_cents, 0);
        assert_eq!(plan.due_date, date!(2026 - 05 - 03));
    }
}

#[cfg(test)]
mod consolidation_tests {
    use crate::consolidation::{plan_links, should_send_summary, EligibleBill};
    use crate::invoices::compute_totals;
    use bookwell_shared::BillStatus;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn eligible(status: BillStatus, invoice_id: Option<Uuid>, amount_cents: i64) -> EligibleBill {
        EligibleBill {
            bill_id: Uuid::new_v4(),
            invoice_id,
            status,
            amount_cents,
        }
    }

    // =========================================================================
    // A second pass over the same month links nothing and sends nothing
    // =========================================================================
    #[test]
    fn test_rerun_links_nothing_new() {
        let invoice = Uuid::new_v4();
        let a = eligible(BillStatus::Scheduled, None, 10_000);
        let b = eligible(BillStatus::Scheduled, None, 12_500);

        let first = plan_links(&[], &[a.clone(), b.clone()]);
        assert_eq!(first.new_links.len(), 2);
        assert_eq!(first.total_cents, 22_500);
        assert!(first.should_email);

        // after the first pass both bills carry the invoice id
        let linked: Vec<EligibleBill> = [a, b]
            .into_iter()
            .map(|mut bill| {
                bill.invoice_id = Some(invoice);
                bill
            })
            .collect();

        let second = plan_links(&linked, &linked);
        assert!(second.new_links.is_empty());
        assert_eq!(second.already_linked, 2);
        assert_eq!(second.total_cents, 22_500);
        assert!(!second.should_email);
    }

    // =========================================================================
    // Duplicate candidate rows in one batch are linked once
    // =========================================================================
    #[test]
    fn test_duplicate_candidates_linked_once() {
        let bill = eligible(BillStatus::Pending, None, 4_000);
        let plan = plan_links(&[], &[bill.clone(), bill.clone()]);
        assert_eq!(plan.new_links, vec![bill.bill_id]);
        assert_eq!(plan.total_cents, 4_000);
    }

    // =========================================================================
    // Canceled and paid bills never join an invoice
    // =========================================================================
    #[test]
    fn test_closed_bills_are_skipped() {
        let plan = plan_links(
            &[],
            &[
                eligible(BillStatus::Canceled, None, 1_000),
                eligible(BillStatus::Paid, None, 2_000),
                eligible(BillStatus::Refunded, None, 3_000),
            ],
        );
        assert!(plan.new_links.is_empty());
        assert_eq!(plan.total_cents, 0);
        assert!(!plan.should_email);
    }

    // =========================================================================
    // Bills already on another invoice stay where they are
    // =========================================================================
    #[test]
    fn test_bill_on_other_invoice_not_relinked() {
        let other_invoice = Uuid::new_v4();
        let plan = plan_links(&[], &[eligible(BillStatus::Sent, Some(other_invoice), 5_000)]);
        assert!(plan.new_links.is_empty());
    }

    // =========================================================================
    // The run-level guard sends one email per invoice even when several
    // groups resolve to the same draft
    // =========================================================================
    #[test]
    fn test_emailed_guard_is_per_invoice() {
        let invoice = Uuid::new_v4();
        let mut emailed: HashSet<Uuid> = HashSet::new();

        let first = plan_links(&[], &[eligible(BillStatus::Scheduled, None, 10_000)]);
        let second = plan_links(&[], &[eligible(BillStatus::Scheduled, None, 10_000)]);

        assert!(should_send_summary(&first, invoice, &mut emailed));
        assert!(!should_send_summary(&second, invoice, &mut emailed));
        assert!(should_send_summary(&second, Uuid::new_v4(), &mut emailed));
    }

    // =========================================================================
    // A plan with nothing new sends no email and does not use up the invoice
    // =========================================================================
    #[test]
    fn test_empty_plan_does_not_claim_email() {
        let invoice = Uuid::new_v4();
        let mut emailed: HashSet<Uuid> = HashSet::new();

        let nothing_new = plan_links(&[], &[]);
        assert!(!should_send_summary(&nothing_new, invoice, &mut emailed));
        assert!(emailed.is_empty());

        let later = plan_links(&[], &[eligible(BillStatus::Pending, None, 4_000)]);
        assert!(should_send_summary(&later, invoice, &mut emailed));
    }

    // =========================================================================
    // Invoice total tracks the non-canceled bills after a cancellation
    // =========================================================================
    #[test]
    fn test_totals_after_bill_removed() {
        let before = compute_totals(&[10_000, 10_000, 10_000], 825);
        let after = compute_totals(&[10_000, 10_000], 825);
        assert_eq!(before.subtotal_cents, 30_000);
        assert_eq!(before.tax_cents, 2_475);
        assert_eq!(after.subtotal_cents, 20_000);
        assert_eq!(after.tax_cents, 1_650);
        assert_eq!(after.total_cents, 21_650);
    }
}

#[cfg(test)]
mod cancellation_tests {
    use crate::bills::tests::bill;
    use crate::bills::{issued_invoices, plan_cancellation};
    use bookwell_shared::{BillStatus, InvoiceStatus};
    use uuid::Uuid;

    // =========================================================================
    // Canceling a booking cancels its pending bill and clears the invoice link
    // =========================================================================
    #[test]
    fn test_pending_bill_canceled_and_unlinked() {
        let invoice = Uuid::new_v4();
        let pending = bill(BillStatus::Pending, Some(invoice));

        let plan = plan_cancellation(std::slice::from_ref(&pending));
        assert_eq!(plan.cancel_bill_ids, vec![pending.id]);
        assert_eq!(plan.affected_invoice_ids, vec![invoice]);
    }

    // =========================================================================
    // Paid bills survive cancellation so they can still be refunded
    // =========================================================================
    #[test]
    fn test_paid_bill_untouched() {
        let plan = plan_cancellation(&[bill(BillStatus::Paid, Some(Uuid::new_v4()))]);
        assert!(plan.cancel_bill_ids.is_empty());
        assert!(plan.affected_invoice_ids.is_empty());
    }

    // =========================================================================
    // Canceling twice is a no-op the second time
    // =========================================================================
    #[test]
    fn test_already_canceled_bill_ignored() {
        let plan = plan_cancellation(&[bill(BillStatus::Canceled, None)]);
        assert!(plan.cancel_bill_ids.is_empty());
    }

    // =========================================================================
    // Several bills on the same invoice recompute it once
    // =========================================================================
    #[test]
    fn test_shared_invoice_listed_once() {
        let invoice = Uuid::new_v4();
        let plan = plan_cancellation(&[
            bill(BillStatus::Scheduled, Some(invoice)),
            bill(BillStatus::Sent, Some(invoice)),
        ]);
        assert_eq!(plan.cancel_bill_ids.len(), 2);
        assert_eq!(plan.affected_invoice_ids, vec![invoice]);
    }

    // =========================================================================
    // A bill on an issued invoice flags that invoice's checkout for expiry
    // =========================================================================
    #[test]
    fn test_issued_invoice_needs_session_expiry() {
        let issued = Uuid::new_v4();
        let draft = Uuid::new_v4();
        let plan = plan_cancellation(&[
            bill(BillStatus::Sent, Some(issued)),
            bill(BillStatus::Pending, Some(draft)),
        ]);
        let statuses = [
            (issued, InvoiceStatus::Issued),
            (draft, InvoiceStatus::Draft),
        ];
        assert_eq!(issued_invoices(&plan, &statuses), vec![issued]);
    }

    #[test]
    fn test_paid_bill_on_issued_invoice_needs_no_expiry() {
        let issued = Uuid::new_v4();
        let plan = plan_cancellation(&[bill(BillStatus::Paid, Some(issued))]);
        assert!(issued_invoices(&plan, &[(issued, InvoiceStatus::Issued)]).is_empty());
    }
}

#[cfg(test)]
mod webhook_completion_tests {
    use crate::checkout::{completion_action, is_reusable, CompletionAction, PaymentSession};
    use bookwell_shared::PaymentSessionStatus;
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    fn session(status: PaymentSessionStatus) -> PaymentSession {
        PaymentSession {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            booking_id: Some(Uuid::new_v4()),
            invoice_id: None,
            stripe_session_id: "cs_test_123".to_string(),
            stripe_payment_intent_id: None,
            stripe_account_id: "acct_123".to_string(),
            amount_cents: 10_000,
            currency: "usd".to_string(),
            status,
            checkout_url: Some("https://checkout.stripe.com/c/pay/cs_test_123".to_string()),
            expires_at: Some(datetime!(2026-05-05 12:00 UTC)),
            completed_at: None,
            created_at: datetime!(2026-05-04 12:00 UTC),
        }
    }

    // =========================================================================
    // A completion for an already-completed session changes nothing
    // =========================================================================
    #[test]
    fn test_completed_session_is_noop() {
        assert_eq!(
            completion_action(PaymentSessionStatus::Completed),
            CompletionAction::NoOp
        );
    }

    #[test]
    fn test_open_session_applies_once() {
        let mut s = session(PaymentSessionStatus::Open);
        assert_eq!(completion_action(s.status), CompletionAction::Apply);

        // the conditional update flips the row; a redelivery sees Completed
        s.status = PaymentSessionStatus::Completed;
        assert_eq!(completion_action(s.status), CompletionAction::NoOp);
    }

    #[test]
    fn test_expired_and_canceled_sessions_ignore_completion() {
        assert_eq!(
            completion_action(PaymentSessionStatus::Expired),
            CompletionAction::NoOp
        );
        assert_eq!(
            completion_action(PaymentSessionStatus::Canceled),
            CompletionAction::NoOp
        );
    }

    // =========================================================================
    // Session reuse: only open, same amount, and not about to expire
    // =========================================================================
    #[test]
    fn test_session_reuse_window() {
        let s = session(PaymentSessionStatus::Open);
        let now = datetime!(2026-05-04 13:00 UTC);
        assert!(is_reusable(&s, 10_000, now));
        assert!(!is_reusable(&s, 12_000, now));
        assert!(!is_reusable(&s, 10_000, datetime!(2026-05-05 11:55 UTC)));

        let completed = session(PaymentSessionStatus::Completed);
        assert!(!is_reusable(&completed, 10_000, now));

        let mut no_url = session(PaymentSessionStatus::Open);
        no_url.checkout_url = None;
        assert!(!is_reusable(&no_url, 10_000, now - Duration::hours(1)));
    }
}

#[cfg(test)]
mod refund_tests {
    use crate::bills::select_refundable_bill;
    use crate::bills::tests::bill;
    use crate::error::BillingError;
    use bookwell_shared::BillStatus;
    use uuid::Uuid;

    // =========================================================================
    // No paid bill: refund is refused with a client error
    // =========================================================================
    #[test]
    fn test_refund_without_paid_bill_rejected() {
        let booking = Uuid::new_v4();
        let bills = vec![
            bill(BillStatus::Scheduled, None),
            bill(BillStatus::Sent, None),
            bill(BillStatus::Refunded, None),
        ];

        let err = select_refundable_bill(booking, &bills).unwrap_err();
        assert!(matches!(err, BillingError::NoPaidBill(id) if id == booking));
        assert_eq!(err.to_string(), format!("No paid bill found for booking {}", booking));
    }

    #[test]
    fn test_refund_with_no_bills_rejected() {
        assert!(matches!(
            select_refundable_bill(Uuid::nil(), &[]),
            Err(BillingError::NoPaidBill(_))
        ));
    }

    #[test]
    fn test_refund_finds_paid_bill() {
        let paid = bill(BillStatus::Paid, None);
        let bills = vec![bill(BillStatus::Canceled, None), paid.clone()];
        assert_eq!(select_refundable_bill(Uuid::nil(), &bills).unwrap().id, paid.id);
    }

    // =========================================================================
    // Disputed bills cannot be refunded through the API
    // =========================================================================
    #[test]
    fn test_disputed_bill_not_refundable() {
        assert!(select_refundable_bill(Uuid::nil(), &[bill(BillStatus::Disputed, None)]).is_err());
    }
}

#[cfg(test)]
mod schedule_retry_tests {
    use crate::schedule::{group_due, next_failure_state, MAX_RETRIES};
    use crate::schedule::tests::due_item;
    use bookwell_shared::{ScheduleAction, ScheduleStatus};
    use time::macros::datetime;
    use uuid::Uuid;

    // =========================================================================
    // A row is retried until the retry limit, then parked as failed
    // =========================================================================
    #[test]
    fn test_retry_until_limit() {
        let mut count = 0;
        let mut status = ScheduleStatus::Pending;
        let mut attempts = 0;
        while status == ScheduleStatus::Pending {
            (count, status) = next_failure_state(count);
            attempts += 1;
        }
        assert_eq!(attempts, MAX_RETRIES);
        assert_eq!(status, ScheduleStatus::Failed);
    }

    // =========================================================================
    // Bookings late on the last day of the month group by their UTC date
    // =========================================================================
    #[test]
    fn test_month_boundary_grouping() {
        let user = Uuid::new_v4();
        let client = Uuid::new_v4();
        let work = group_due(vec![
            due_item(ScheduleAction::ConsolidateInvoice, user, client, datetime!(2026-01-31 23:30 UTC)),
            due_item(ScheduleAction::ConsolidateInvoice, user, client, datetime!(2026-02-01 00:30 UTC)),
        ])
        .unwrap();
        assert_eq!(work.monthly.len(), 2);
    }
}
