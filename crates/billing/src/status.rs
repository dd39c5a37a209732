//! Subscription and dispute status state machines
//!
//! Statuses are stored as text in Postgres but every mutation goes through
//! these enums, so an event handler can never write a transition the
//! lifecycle does not allow (e.g. resurrecting a canceled subscription).

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Local subscription lifecycle
///
/// Mirrors the Stripe statuses we care about plus `paused`, which we enter
/// when a dispute freezes collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "paused" => Some(SubscriptionStatus::Paused),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Transition table for the subscription lifecycle
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if *self == next {
            // Idempotent re-delivery of the same event is always fine
            return true;
        }
        match self {
            // Unpaid is reachable directly from trialing/active: a hard
            // decline ends dunning on the first attempt, without ever
            // passing through past_due.
            Trialing => matches!(next, Active | PastDue | Unpaid | Paused | Canceled),
            Active => matches!(next, PastDue | Unpaid | Paused | Canceled),
            PastDue => matches!(next, Active | Unpaid | Paused | Canceled),
            Unpaid => matches!(next, Active | Canceled),
            Paused => matches!(next, Active | PastDue | Canceled),
            // Canceled is terminal
            Canceled => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispute lifecycle as mirrored from Stripe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    NeedsResponse,
    WarningNeedsResponse,
    UnderReview,
    Won,
    Lost,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::NeedsResponse => "needs_response",
            DisputeStatus::WarningNeedsResponse => "warning_needs_response",
            DisputeStatus::UnderReview => "under_review",
            DisputeStatus::Won => "won",
            DisputeStatus::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "needs_response" => Some(DisputeStatus::NeedsResponse),
            "warning_needs_response" => Some(DisputeStatus::WarningNeedsResponse),
            "under_review" => Some(DisputeStatus::UnderReview),
            "won" => Some(DisputeStatus::Won),
            "lost" => Some(DisputeStatus::Lost),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: DisputeStatus) -> bool {
        use DisputeStatus::*;
        if *self == next {
            return true;
        }
        match self {
            WarningNeedsResponse => matches!(next, NeedsResponse | UnderReview | Won | Lost),
            NeedsResponse => matches!(next, UnderReview | Won | Lost),
            UnderReview => matches!(next, Won | Lost),
            Won | Lost => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DisputeStatus::Won | DisputeStatus::Lost)
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a subscription status transition, returning a typed error on refusal
pub fn check_subscription_transition(
    from: SubscriptionStatus,
    to: SubscriptionStatus,
) -> BillingResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Validate a dispute status transition
pub fn check_dispute_transition(from: DisputeStatus, to: DisputeStatus) -> BillingResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_is_terminal() {
        let canceled = SubscriptionStatus::Canceled;
        for next in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Paused,
        ] {
            assert!(!canceled.can_transition_to(next), "canceled -> {}", next);
        }
        // Same-status re-delivery stays allowed
        assert!(canceled.can_transition_to(SubscriptionStatus::Canceled));
    }

    #[test]
    fn test_dunning_path() {
        assert!(SubscriptionStatus::Active.can_transition_to(SubscriptionStatus::PastDue));
        assert!(SubscriptionStatus::PastDue.can_transition_to(SubscriptionStatus::Unpaid));
        assert!(SubscriptionStatus::PastDue.can_transition_to(SubscriptionStatus::Active));
        // Unpaid can't go back to past_due, only recover or cancel
        assert!(!SubscriptionStatus::Unpaid.can_transition_to(SubscriptionStatus::PastDue));
    }

    #[test]
    fn test_hard_decline_suspends_without_past_due() {
        // stolen_card on the very first attempt goes straight to unpaid
        assert!(SubscriptionStatus::Active.can_transition_to(SubscriptionStatus::Unpaid));
        assert!(SubscriptionStatus::Trialing.can_transition_to(SubscriptionStatus::Unpaid));
    }

    #[test]
    fn test_pause_resume_for_disputes() {
        assert!(SubscriptionStatus::Active.can_transition_to(SubscriptionStatus::Paused));
        assert!(SubscriptionStatus::Paused.can_transition_to(SubscriptionStatus::Active));
        assert!(SubscriptionStatus::Paused.can_transition_to(SubscriptionStatus::Canceled));
        assert!(!SubscriptionStatus::Paused.can_transition_to(SubscriptionStatus::Unpaid));
    }

    #[test]
    fn test_dispute_lifecycle() {
        assert!(DisputeStatus::NeedsResponse.can_transition_to(DisputeStatus::UnderReview));
        assert!(DisputeStatus::UnderReview.can_transition_to(DisputeStatus::Won));
        assert!(DisputeStatus::UnderReview.can_transition_to(DisputeStatus::Lost));
        assert!(!DisputeStatus::Won.can_transition_to(DisputeStatus::Lost));
        assert!(!DisputeStatus::Lost.can_transition_to(DisputeStatus::NeedsResponse));
    }

    #[test]
    fn test_transition_error_carries_states() {
        let err = check_subscription_transition(
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Active,
        )
        .unwrap_err();
        assert!(err.to_string().contains("canceled"));
        assert!(err.to_string().contains("active"));
    }

    #[test]
    fn test_round_trip_parse() {
        for s in ["trialing", "active", "past_due", "unpaid", "paused", "canceled"] {
            assert_eq!(SubscriptionStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
        for s in ["needs_response", "warning_needs_response", "under_review", "won", "lost"] {
            assert_eq!(DisputeStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
        assert!(SubscriptionStatus::parse("suspended").is_none());
    }
}
