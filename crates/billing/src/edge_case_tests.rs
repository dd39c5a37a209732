// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing System
//!
//! Tests critical boundary conditions in:
//! - Dunning classification (QK-FP01 to QK-FP06)
//! - Refund eligibility window (QK-RF01 to QK-RF06)
//! - Proration math (QK-PR01 to QK-PR04)
//! - Status state machines (QK-ST01 to QK-ST07)
//! - History merge (QK-HI01 to QK-HI03)
//! - Follow-up scheduling (QK-FU01 to QK-FU03)

#[cfg(test)]
mod dunning_tests {
    use crate::failed_payment::{classify_failure, DunningDecision, MAX_PAYMENT_ATTEMPTS};
    use crate::retry::dunning_delay;
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // QK-FP01: First soft decline - retry in 1 day
    // =========================================================================
    #[test]
    fn test_first_failure_retries_next_day() {
        let before = OffsetDateTime::now_utc();
        match classify_failure(1, Some("insufficient_funds")) {
            DunningDecision::Retry { next_attempt_at } => {
                let delta = next_attempt_at - before;
                assert!(delta >= Duration::days(1), "should wait a full day");
                assert!(delta < Duration::days(1) + Duration::minutes(1));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    // =========================================================================
    // QK-FP02: Hard decline on the very first attempt - no retry at all
    // =========================================================================
    #[test]
    fn test_hard_decline_never_retries() {
        let decision = classify_failure(1, Some("stolen_card"));
        assert!(
            matches!(decision, DunningDecision::Terminal { .. }),
            "stolen card must not be retried"
        );
    }

    // =========================================================================
    // QK-FP03: Attempt exactly at the budget - terminal
    // =========================================================================
    #[test]
    fn test_attempt_budget_boundary() {
        // One below the budget still retries
        assert!(matches!(
            classify_failure(MAX_PAYMENT_ATTEMPTS - 1, None),
            DunningDecision::Retry { .. }
        ));
        // At the budget it stops
        assert!(matches!(
            classify_failure(MAX_PAYMENT_ATTEMPTS, None),
            DunningDecision::Terminal { .. }
        ));
    }

    // =========================================================================
    // QK-FP04: Unknown decline code is treated as soft
    // =========================================================================
    #[test]
    fn test_unknown_decline_code_is_soft() {
        let decision = classify_failure(1, Some("some_future_stripe_code"));
        assert!(matches!(decision, DunningDecision::Retry { .. }));
    }

    // =========================================================================
    // QK-FP05: Zero attempt count (Stripe omitted the field) - retries
    // =========================================================================
    #[test]
    fn test_zero_attempt_count_retries() {
        let decision = classify_failure(0, None);
        assert!(matches!(decision, DunningDecision::Retry { .. }));
    }

    // =========================================================================
    // QK-FP06: Ladder escalates 1 -> 3 -> 5 days and stays at 5
    // =========================================================================
    #[test]
    fn test_ladder_escalation() {
        assert_eq!(dunning_delay(1), Duration::days(1));
        assert_eq!(dunning_delay(2), Duration::days(3));
        assert_eq!(dunning_delay(3), Duration::days(5));
        assert_eq!(dunning_delay(99), Duration::days(5));
    }
}

#[cfg(test)]
mod refund_window_tests {
    use crate::refunds::{check_eligibility, RefundEligibility, REFUND_WINDOW_DAYS};
    use time::{Duration, OffsetDateTime};

    fn charge_aged(days: i64) -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        (now - Duration::days(days), now)
    }

    // =========================================================================
    // QK-RF01: Charge exactly at the window boundary - still eligible
    // =========================================================================
    #[test]
    fn test_charge_on_last_window_day_eligible() {
        let (created, now) = charge_aged(REFUND_WINDOW_DAYS);
        let result = check_eligibility(created, now, true, false, false);
        assert!(result.is_eligible(), "day {} is inside the window", REFUND_WINDOW_DAYS);
    }

    // =========================================================================
    // QK-RF02: One day past the window - rejected with the age in the reason
    // =========================================================================
    #[test]
    fn test_charge_one_day_past_window_rejected() {
        let (created, now) = charge_aged(REFUND_WINDOW_DAYS + 1);
        match check_eligibility(created, now, true, false, false) {
            RefundEligibility::WindowExpired { days_old } => {
                assert_eq!(days_old, REFUND_WINDOW_DAYS + 1)
            }
            other => panic!("expected WindowExpired, got {:?}", other),
        }
    }

    // =========================================================================
    // QK-RF03: Charge made seconds ago - eligible
    // =========================================================================
    #[test]
    fn test_fresh_charge_eligible() {
        let (created, now) = charge_aged(0);
        assert!(check_eligibility(created, now, true, false, false).is_eligible());
    }

    // =========================================================================
    // QK-RF04: Unpaid charge - never refundable
    // =========================================================================
    #[test]
    fn test_unpaid_charge_not_refundable() {
        let (created, now) = charge_aged(1);
        assert_eq!(
            check_eligibility(created, now, false, false, false),
            RefundEligibility::NotPaid
        );
    }

    // =========================================================================
    // QK-RF05: Already fully refunded - rejected before the window check
    // =========================================================================
    #[test]
    fn test_already_refunded_rejected() {
        let (created, now) = charge_aged(REFUND_WINDOW_DAYS + 10);
        assert_eq!(
            check_eligibility(created, now, true, true, false),
            RefundEligibility::AlreadyRefunded
        );
    }

    // =========================================================================
    // QK-RF06: Disputed charge - refunding would double-credit the customer
    // =========================================================================
    #[test]
    fn test_disputed_charge_rejected() {
        let (created, now) = charge_aged(1);
        assert_eq!(
            check_eligibility(created, now, true, false, true),
            RefundEligibility::Disputed
        );
    }
}

#[cfg(test)]
mod proration_tests {
    use crate::proration::prorated_amount_cents;
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // QK-PR01: Change at the exact start of the period - full amount
    // =========================================================================
    #[test]
    fn test_change_at_period_start() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);
        assert_eq!(prorated_amount_cents(2900, start, end, start), 2900);
    }

    // =========================================================================
    // QK-PR02: Change one second before the period ends - nearly zero, never negative
    // =========================================================================
    #[test]
    fn test_change_one_second_before_end() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);
        let at = end - Duration::seconds(1);

        let prorated = prorated_amount_cents(2900, start, end, at);
        assert!(prorated >= 0);
        assert!(prorated <= 1, "one second of a month rounds to at most 1 cent");
    }

    // =========================================================================
    // QK-PR03: Change after the period already ended - zero
    // =========================================================================
    #[test]
    fn test_change_after_period_end() {
        let start = OffsetDateTime::now_utc() - Duration::days(60);
        let end = start + Duration::days(30);
        assert_eq!(
            prorated_amount_cents(2900, start, end, OffsetDateTime::now_utc()),
            0
        );
    }

    // =========================================================================
    // QK-PR04: Zero-length period does not divide by zero
    // =========================================================================
    #[test]
    fn test_zero_length_period() {
        let t = OffsetDateTime::now_utc();
        assert_eq!(prorated_amount_cents(2900, t, t, t), 0);
    }
}

#[cfg(test)]
mod state_machine_tests {
    use crate::status::{
        check_dispute_transition, check_subscription_transition, DisputeStatus,
        SubscriptionStatus,
    };

    // =========================================================================
    // QK-ST01: Canceled is terminal for subscriptions
    // =========================================================================
    #[test]
    fn test_canceled_is_terminal() {
        for to in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Trialing,
        ] {
            assert!(
                check_subscription_transition(SubscriptionStatus::Canceled, to).is_err(),
                "canceled -> {} must be rejected",
                to
            );
        }
    }

    // =========================================================================
    // QK-ST02: Same-status transition is allowed (idempotent redelivery)
    // =========================================================================
    #[test]
    fn test_same_status_allowed() {
        assert!(check_subscription_transition(
            SubscriptionStatus::PastDue,
            SubscriptionStatus::PastDue
        )
        .is_ok());
        assert!(
            check_dispute_transition(DisputeStatus::UnderReview, DisputeStatus::UnderReview)
                .is_ok()
        );
    }

    // =========================================================================
    // QK-ST03: past_due can recover, pause, cancel, or exhaust
    // =========================================================================
    #[test]
    fn test_past_due_exits() {
        for to in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Canceled,
        ] {
            assert!(check_subscription_transition(SubscriptionStatus::PastDue, to).is_ok());
        }
    }

    // =========================================================================
    // QK-ST04: unpaid cannot go back to past_due, only recover or cancel
    // =========================================================================
    #[test]
    fn test_unpaid_cannot_return_to_past_due() {
        assert!(check_subscription_transition(
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::PastDue
        )
        .is_err());
        assert!(check_subscription_transition(
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Active
        )
        .is_ok());
    }

    // =========================================================================
    // QK-ST05: won and lost disputes are terminal
    // =========================================================================
    #[test]
    fn test_dispute_outcomes_terminal() {
        assert!(check_dispute_transition(DisputeStatus::Won, DisputeStatus::UnderReview).is_err());
        assert!(
            check_dispute_transition(DisputeStatus::Lost, DisputeStatus::NeedsResponse).is_err()
        );
    }

    // =========================================================================
    // QK-ST06: disputes can close directly from needs_response
    // =========================================================================
    #[test]
    fn test_dispute_closes_without_review() {
        // Stripe closes disputes without an under_review phase when the
        // merchant does not respond
        assert!(check_dispute_transition(DisputeStatus::NeedsResponse, DisputeStatus::Lost).is_ok());
        assert!(check_dispute_transition(DisputeStatus::NeedsResponse, DisputeStatus::Won).is_ok());
    }

    // =========================================================================
    // QK-ST07: the rejection names both states
    // =========================================================================
    #[test]
    fn test_invalid_transition_error_is_descriptive() {
        let err = check_subscription_transition(
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Active,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("canceled"));
        assert!(msg.contains("active"));
    }
}

#[cfg(test)]
mod history_merge_tests {
    use crate::history::{merge_history, BillingHistoryEntry, HistorySource};
    use time::{Duration, OffsetDateTime};

    fn entry(source: HistorySource, reference_id: &str, minutes_ago: i64) -> BillingHistoryEntry {
        BillingHistoryEntry {
            source,
            reference_id: reference_id.to_string(),
            kind: "test".to_string(),
            amount_cents: 0,
            currency: "usd".to_string(),
            description: String::new(),
            occurred_at: OffsetDateTime::now_utc() - Duration::minutes(minutes_ago),
            invoice_url: None,
        }
    }

    // =========================================================================
    // QK-HI01: Empty feed stays empty
    // =========================================================================
    #[test]
    fn test_empty_feed() {
        assert!(merge_history(vec![], 50).is_empty());
    }

    // =========================================================================
    // QK-HI02: Duplicate invoice delivered by two sources of the same kind
    // =========================================================================
    #[test]
    fn test_duplicate_within_source_collapsed() {
        let merged = merge_history(
            vec![
                entry(HistorySource::Invoice, "in_dup", 10),
                entry(HistorySource::Invoice, "in_dup", 10),
                entry(HistorySource::Invoice, "in_other", 20),
            ],
            50,
        );
        assert_eq!(merged.len(), 2);
    }

    // =========================================================================
    // QK-HI03: Limit of zero returns nothing rather than panicking
    // =========================================================================
    #[test]
    fn test_zero_limit() {
        let merged = merge_history(vec![entry(HistorySource::Invoice, "in_1", 1)], 0);
        assert!(merged.is_empty());
    }
}

#[cfg(test)]
mod follow_up_tests {
    use crate::retry::{reschedule_delay, FollowUpAction};
    use time::Duration;

    // =========================================================================
    // QK-FU01: Backoff doubles until the cap
    // =========================================================================
    #[test]
    fn test_backoff_sequence() {
        let mut delay = Duration::days(1);
        let mut seen = Vec::new();
        for _ in 0..5 {
            delay = reschedule_delay(delay);
            seen.push(delay.whole_days());
        }
        assert_eq!(seen, vec![2, 4, 7, 7, 7]);
    }

    // =========================================================================
    // QK-FU02: Sub-day delays still grow
    // =========================================================================
    #[test]
    fn test_backoff_from_small_delay() {
        assert_eq!(
            reschedule_delay(Duration::hours(1)),
            Duration::hours(2)
        );
    }

    // =========================================================================
    // QK-FU03: Action strings survive a database round trip
    // =========================================================================
    #[test]
    fn test_action_strings_stable() {
        for action in [
            FollowUpAction::RetryPayment,
            FollowUpAction::EscalateDispute,
            FollowUpAction::ReplayEvent,
        ] {
            assert_eq!(FollowUpAction::parse(action.as_str()), Some(action));
        }
    }
}

#[cfg(test)]
mod evidence_tests {
    use crate::disputes::{generate_evidence_text, DisputeEvidenceInput};
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // Evidence drafts must carry the service period when it is known
    // =========================================================================
    #[test]
    fn test_evidence_includes_service_period() {
        let start = OffsetDateTime::now_utc() - Duration::days(20);
        let end = start + Duration::days(30);
        let input = DisputeEvidenceInput {
            customer_id: "cus_ev".to_string(),
            customer_email: None,
            invoice_id: None,
            subscription_id: None,
            amount_cents: 990,
            currency: "eur".to_string(),
            service_start: Some(start),
            service_end: Some(end),
            dispute_reason: "general".to_string(),
        };

        let text = generate_evidence_text(&input);
        assert!(text.contains(&start.date().to_string()));
        assert!(text.contains(&end.date().to_string()));
        assert!(text.contains("9.90 EUR"));
    }
}
