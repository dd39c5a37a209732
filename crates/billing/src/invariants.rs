//! Billing invariants
//!
//! Runnable consistency checks over the billing tables. Safe to run after
//! any webhook replay or follow-up batch: every check is a plain SQL read
//! with enough context attached to debug a violation.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A single failed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Customers affected, where known
    pub customer_ids: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may be charging or suspending incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of one full run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnfrozenDisputeRow {
    stripe_dispute_id: String,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    subscription_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UnloggedRefundRow {
    stripe_refund_id: Option<String>,
    stripe_charge_id: String,
    customer_id: Option<String>,
    amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BadFollowUpRow {
    id: Uuid,
    action: String,
    attempt: i32,
    max_attempts: i32,
    run_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct TerminalWithRetryRow {
    stripe_subscription_id: String,
    customer_id: String,
    status: String,
    pending_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OpenClosedDisputeRow {
    stripe_dispute_id: String,
    customer_id: Option<String>,
    status: String,
}

/// Runs the consistency checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Names accepted by [`run_check`](Self::run_check)
    pub const CHECK_NAMES: &'static [&'static str] = &[
        "no_stuck_event_processing",
        "disputed_subscriptions_frozen",
        "completed_refunds_logged",
        "pending_follow_ups_valid",
        "terminal_subscriptions_no_retries",
        "closed_disputes_have_closed_at",
    ];

    /// Run one check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();

        let violations = match name {
            "no_stuck_event_processing" => self.check_no_stuck_event_processing().await?,
            "disputed_subscriptions_frozen" => self.check_disputed_subscriptions_frozen().await?,
            "completed_refunds_logged" => self.check_completed_refunds_logged().await?,
            "pending_follow_ups_valid" => self.check_pending_follow_ups_valid().await?,
            "terminal_subscriptions_no_retries" => {
                self.check_terminal_subscriptions_no_retries().await?
            }
            "closed_disputes_have_closed_at" => {
                self.check_closed_disputes_have_closed_at().await?
            }
            other => {
                return Err(BillingError::NotFound(format!(
                    "unknown invariant check: {}",
                    other
                )))
            }
        };

        let failed = usize::from(!violations.is_empty());
        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: 1,
            checks_passed: 1 - failed,
            checks_failed: failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run every check and return the summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_no_stuck_event_processing().await?);
        violations.extend(self.check_disputed_subscriptions_frozen().await?);
        violations.extend(self.check_completed_refunds_logged().await?);
        violations.extend(self.check_pending_follow_ups_valid().await?);
        violations.extend(self.check_terminal_subscriptions_no_retries().await?);
        violations.extend(self.check_closed_disputes_have_closed_at().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: No event stays in 'processing' or 'replaying' past the
    /// claim timeout.
    ///
    /// A stuck claim means a handler (or replay) crashed between claiming
    /// and recording its outcome; the event needs a replay or reset.
    async fn check_no_stuck_event_processing(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM edge_case_events
            WHERE processing_result IN ('processing', 'replaying')
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_event_processing".to_string(),
                customer_ids: vec![],
                description: format!(
                    "Event {} ({}) has been claimed past the timeout without an outcome",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: A subscription with an open dispute is paused or canceled.
    ///
    /// Collecting from a customer who is actively disputing a charge invites
    /// further disputes and network fines.
    async fn check_disputed_subscriptions_frozen(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnfrozenDisputeRow> = sqlx::query_as(
            r#"
            SELECT
                d.stripe_dispute_id,
                d.customer_id,
                d.subscription_id,
                s.status AS subscription_status
            FROM payment_disputes d
            JOIN subscriptions s ON s.stripe_subscription_id = d.subscription_id
            WHERE d.status IN ('needs_response', 'warning_needs_response', 'under_review')
              AND s.status IN ('active', 'trialing')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "disputed_subscriptions_frozen".to_string(),
                customer_ids: row.customer_id.clone().into_iter().collect(),
                description: format!(
                    "Subscription {} is '{}' while dispute {} is open",
                    row.subscription_id.as_deref().unwrap_or("(unknown)"),
                    row.subscription_status,
                    row.stripe_dispute_id
                ),
                context: serde_json::json!({
                    "stripe_dispute_id": row.stripe_dispute_id,
                    "subscription_id": row.subscription_id,
                    "subscription_status": row.subscription_status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Every completed refund has a billing history row.
    ///
    /// The customer-facing feed must show all money returned.
    async fn check_completed_refunds_logged(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnloggedRefundRow> = sqlx::query_as(
            r#"
            SELECT r.stripe_refund_id, r.stripe_charge_id, r.customer_id, r.amount_cents
            FROM refund_audit r
            WHERE r.status = 'completed'
              AND NOT EXISTS (
                  SELECT 1 FROM billing_history h
                  WHERE h.kind = 'refund_processed'
                    AND h.reference_id = COALESCE(r.stripe_refund_id, r.stripe_charge_id)
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_refunds_logged".to_string(),
                customer_ids: row.customer_id.clone().into_iter().collect(),
                description: format!(
                    "Completed refund on charge {} has no billing history row",
                    row.stripe_charge_id
                ),
                context: serde_json::json!({
                    "stripe_refund_id": row.stripe_refund_id,
                    "stripe_charge_id": row.stripe_charge_id,
                    "amount_cents": row.amount_cents,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Queue entries are live.
    ///
    /// A pending entry with its attempt budget spent or overdue by more than
    /// a week will never run usefully, and a 'running' entry older than the
    /// stale-claim timeout belongs to a crashed worker.
    async fn check_pending_follow_ups_valid(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadFollowUpRow> = sqlx::query_as(
            r#"
            SELECT id, action, attempt, max_attempts, run_at
            FROM scheduled_follow_ups
            WHERE (status = 'pending'
                   AND (attempt >= max_attempts OR run_at < NOW() - INTERVAL '7 days'))
               OR (status = 'running'
                   AND started_at < NOW() - INTERVAL '30 minutes')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_follow_ups_valid".to_string(),
                customer_ids: vec![],
                description: format!(
                    "Follow-up {} ({}) is dead in the queue: attempt {}/{}, run_at {}",
                    row.id, row.action, row.attempt, row.max_attempts, row.run_at
                ),
                context: serde_json::json!({
                    "follow_up_id": row.id,
                    "action": row.action,
                    "attempt": row.attempt,
                    "max_attempts": row.max_attempts,
                    "run_at": row.run_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Terminal subscriptions have no pending payment retries.
    ///
    /// Retrying against a canceled or unpaid subscription either errors or,
    /// worse, collects money for service we no longer provide.
    async fn check_terminal_subscriptions_no_retries(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TerminalWithRetryRow> = sqlx::query_as(
            r#"
            SELECT
                s.stripe_subscription_id,
                s.customer_id,
                s.status,
                COUNT(f.id) AS pending_count
            FROM subscriptions s
            JOIN scheduled_follow_ups f ON f.subscription_id = s.stripe_subscription_id
            WHERE s.status IN ('canceled', 'unpaid')
              AND f.status = 'pending'
              AND f.action = 'retry_payment'
            GROUP BY s.stripe_subscription_id, s.customer_id, s.status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_subscriptions_no_retries".to_string(),
                customer_ids: vec![row.customer_id.clone()],
                description: format!(
                    "Subscription {} is '{}' but has {} pending payment retries",
                    row.stripe_subscription_id, row.status, row.pending_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.stripe_subscription_id,
                    "status": row.status,
                    "pending_count": row.pending_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Won or lost disputes carry a closed_at timestamp.
    async fn check_closed_disputes_have_closed_at(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OpenClosedDisputeRow> = sqlx::query_as(
            r#"
            SELECT stripe_dispute_id, customer_id, status
            FROM payment_disputes
            WHERE status IN ('won', 'lost')
              AND closed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "closed_disputes_have_closed_at".to_string(),
                customer_ids: row.customer_id.clone().into_iter().collect(),
                description: format!(
                    "Dispute {} is '{}' but has no closed_at",
                    row.stripe_dispute_id, row.status
                ),
                context: serde_json::json!({
                    "stripe_dispute_id": row.stripe_dispute_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_summary_round_trips() {
        let summary = InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 6,
            checks_passed: 5,
            checks_failed: 1,
            violations: vec![InvariantViolation {
                invariant: "no_stuck_event_processing".to_string(),
                customer_ids: vec![],
                description: "test".to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::High,
            }],
            healthy: false,
        };

        let json = match serde_json::to_string(&summary) {
            Ok(j) => j,
            Err(e) => panic!("serialize failed: {}", e),
        };
        let parsed: InvariantCheckSummary = match serde_json::from_str(&json) {
            Ok(p) => p,
            Err(e) => panic!("deserialize failed: {}", e),
        };
        assert!(!parsed.healthy);
        assert_eq!(parsed.violations.len(), 1);
    }
}
