// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
#![allow(clippy::type_complexity)] // Complex return types for Stripe API wrappers
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! QuoteKit Billing Module
//!
//! Handles the Stripe billing edge cases that the happy-path checkout flow
//! never sees.
//!
//! ## Features
//!
//! - **Edge Case Coordinator**: Verified, idempotent webhook processing with replay
//! - **Failed Payments**: Dunning ladder with hard-decline detection
//! - **Proration**: Mid-cycle plan change preview and execution
//! - **Refunds**: Policy-window enforcement, refunds, credit notes
//! - **Disputes**: Chargeback lifecycle with collection freezing and evidence drafts
//! - **Retry Queue**: Persisted follow-ups executed by the worker
//! - **Billing History**: Merged customer-facing timeline
//! - **Invariants**: Runnable consistency checks over the billing tables

pub mod client;
pub mod context;
pub mod coordinator;
pub mod disputes;
pub mod error;
pub mod events;
pub mod failed_payment;
pub mod history;
pub mod invariants;
pub mod notifications;
pub mod proration;
pub mod refunds;
pub mod retry;
pub mod status;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Context
pub use context::EdgeCaseContext;

// Coordinator
pub use coordinator::{EdgeCaseCoordinator, EdgeCaseEventRecord, EventReplayResult};

// Disputes
pub use disputes::{generate_evidence_text, DisputeEvidenceInput, DisputeService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingHistoryRecord, HistoryEntryBuilder, HistoryKind, HistoryLogger};

// Failed payments
pub use failed_payment::{
    classify_failure, DunningDecision, FailedPaymentService, MAX_PAYMENT_ATTEMPTS,
};

// History
pub use history::{BillingHistoryEntry, BillingHistoryService, HistorySource};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notifications::{AlertSeverity, NotificationService};

// Proration
pub use proration::{PlanChangeResult, ProrationPreview, ProrationService};

// Refunds
pub use refunds::{RefundEligibility, RefundResult, RefundService, REFUND_WINDOW_DAYS};

// Retry queue
pub use retry::{FollowUpAction, FollowUpEntry, RetryQueue};

// Status
pub use status::{DisputeStatus, SubscriptionStatus};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub coordinator: EdgeCaseCoordinator,
    pub failed_payments: FailedPaymentService,
    pub proration: ProrationService,
    pub refunds: RefundService,
    pub disputes: DisputeService,
    pub history: BillingHistoryService,
    pub queue: RetryQueue,
    pub invariants: InvariantChecker,
    pub notifications: NotificationService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);

        Self {
            coordinator: EdgeCaseCoordinator::new(stripe.clone(), pool.clone()),
            failed_payments: FailedPaymentService::new(stripe.clone(), pool.clone()),
            proration: ProrationService::new(stripe.clone(), pool.clone()),
            refunds: RefundService::new(stripe.clone(), pool.clone()),
            disputes: DisputeService::new(stripe.clone(), pool.clone()),
            history: BillingHistoryService::new(stripe, pool.clone()),
            queue: RetryQueue::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            notifications: NotificationService::new(pool),
        }
    }
}
