//! Persisted retry queue
//!
//! Dunning retries and dispute follow-ups live in the scheduled_follow_ups
//! table and are executed by the worker, never inline in a webhook handler.
//! Claiming uses FOR UPDATE SKIP LOCKED so multiple worker instances can run
//! against the same database without double-executing an entry.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// What the worker should do when the entry comes due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpAction {
    RetryPayment,
    EscalateDispute,
    ReplayEvent,
}

impl FollowUpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpAction::RetryPayment => "retry_payment",
            FollowUpAction::EscalateDispute => "escalate_dispute",
            FollowUpAction::ReplayEvent => "replay_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retry_payment" => Some(FollowUpAction::RetryPayment),
            "escalate_dispute" => Some(FollowUpAction::EscalateDispute),
            "replay_event" => Some(FollowUpAction::ReplayEvent),
            _ => None,
        }
    }
}

/// A claimed queue entry
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FollowUpEntry {
    pub id: Uuid,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    pub dispute_id: Option<String>,
    pub event_id: Option<String>,
    pub action: String,
    pub run_at: OffsetDateTime,
    pub attempt: i32,
    pub max_attempts: i32,
}

/// Delay before the next dunning attempt, by how many payment attempts
/// Stripe has already made. The ladder is 1 day, then 3, then 5; anything
/// past the ladder gets the final rung.
pub fn dunning_delay(attempt_count: i32) -> Duration {
    match attempt_count {
        i32::MIN..=1 => Duration::days(1),
        2 => Duration::days(3),
        _ => Duration::days(5),
    }
}

/// Backoff applied when a queue entry itself fails: double the previous
/// delay, capped at 7 days.
pub fn reschedule_delay(previous: Duration) -> Duration {
    let doubled = previous * 2;
    let cap = Duration::days(7);
    if doubled > cap {
        cap
    } else {
        doubled
    }
}

/// Persisted follow-up queue
#[derive(Clone)]
pub struct RetryQueue {
    pool: PgPool,
}

impl RetryQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Schedule a follow-up. Duplicate pending entries for the same
    /// (action, invoice), (action, dispute) or (action, event) pair are
    /// collapsed into the earlier run_at.
    pub async fn enqueue(
        &self,
        action: FollowUpAction,
        subscription_id: Option<&str>,
        invoice_id: Option<&str>,
        dispute_id: Option<&str>,
        event_id: Option<&str>,
        run_at: OffsetDateTime,
        max_attempts: i32,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();

        // The arbiter index differs by what the entry references, and an
        // INSERT can only name one.
        let query = if event_id.is_some() {
            r#"
            INSERT INTO scheduled_follow_ups (
                id, subscription_id, invoice_id, dispute_id, event_id, action,
                run_at, attempt, max_attempts, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, 'pending', NOW())
            ON CONFLICT (action, event_id) WHERE status = 'pending' DO UPDATE SET
                run_at = LEAST(scheduled_follow_ups.run_at, EXCLUDED.run_at)
            "#
        } else if dispute_id.is_some() {
            r#"
            INSERT INTO scheduled_follow_ups (
                id, subscription_id, invoice_id, dispute_id, event_id, action,
                run_at, attempt, max_attempts, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, 'pending', NOW())
            ON CONFLICT (action, dispute_id) WHERE status = 'pending' DO UPDATE SET
                run_at = LEAST(scheduled_follow_ups.run_at, EXCLUDED.run_at)
            "#
        } else {
            r#"
            INSERT INTO scheduled_follow_ups (
                id, subscription_id, invoice_id, dispute_id, event_id, action,
                run_at, attempt, max_attempts, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, 'pending', NOW())
            ON CONFLICT (action, invoice_id) WHERE status = 'pending' DO UPDATE SET
                run_at = LEAST(scheduled_follow_ups.run_at, EXCLUDED.run_at)
            "#
        };

        sqlx::query(query)
            .bind(id)
            .bind(subscription_id)
            .bind(invoice_id)
            .bind(dispute_id)
            .bind(event_id)
            .bind(action.as_str())
            .bind(run_at)
            .bind(max_attempts)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            follow_up_id = %id,
            action = action.as_str(),
            invoice_id = ?invoice_id,
            event_id = ?event_id,
            run_at = %run_at,
            "Follow-up scheduled"
        );

        Ok(id)
    }

    /// Claim up to `limit` due entries for exclusive processing.
    ///
    /// The row state flips to 'running' inside the same transaction that
    /// locks it, so a concurrent worker skips it.
    pub async fn claim_due(&self, limit: i64) -> BillingResult<Vec<FollowUpEntry>> {
        let mut tx = self.pool.begin().await?;

        let entries: Vec<FollowUpEntry> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, invoice_id, dispute_id, event_id, action,
                   run_at, attempt, max_attempts
            FROM scheduled_follow_ups
            WHERE status = 'pending'
              AND run_at <= NOW()
            ORDER BY run_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if entries.is_empty() {
            tx.commit().await?;
            return Ok(entries);
        }

        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
        sqlx::query(
            r#"
            UPDATE scheduled_follow_ups
            SET status = 'running', attempt = attempt + 1, started_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(entries)
    }

    /// Mark an entry as done
    pub async fn complete(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE scheduled_follow_ups SET status = 'done', completed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failure and either reschedule with backoff or exhaust the entry
    pub async fn fail_and_reschedule(
        &self,
        entry: &FollowUpEntry,
        error: &str,
    ) -> BillingResult<()> {
        // attempt was already incremented by the claim
        let attempts_used = entry.attempt + 1;

        if attempts_used >= entry.max_attempts {
            sqlx::query(
                r#"
                UPDATE scheduled_follow_ups
                SET status = 'exhausted', last_error = $2, completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(entry.id)
            .bind(error)
            .execute(&self.pool)
            .await?;

            tracing::warn!(
                follow_up_id = %entry.id,
                action = %entry.action,
                attempts = attempts_used,
                error = %error,
                "Follow-up exhausted after max attempts"
            );
            return Ok(());
        }

        let previous = Duration::days(1) * attempts_used;
        let next_run = OffsetDateTime::now_utc() + reschedule_delay(previous);

        sqlx::query(
            r#"
            UPDATE scheduled_follow_ups
            SET status = 'pending', run_at = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(next_run)
        .bind(error)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            follow_up_id = %entry.id,
            next_run = %next_run,
            error = %error,
            "Follow-up rescheduled after failure"
        );

        Ok(())
    }

    /// Recover entries stranded in 'running' by a crashed worker.
    ///
    /// Exhausted entries close out, entries whose slot was re-filled by a
    /// newer pending duplicate are cancelled, and the rest go back to
    /// 'pending' due now. Same idea as the stale webhook-claim timeout.
    pub async fn requeue_stale(&self, timeout_minutes: i64) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        // attempt was incremented at claim time, so a crash on the last
        // allowed attempt counts as spent
        sqlx::query(
            r#"
            UPDATE scheduled_follow_ups
            SET status = 'exhausted', last_error = 'claim went stale', completed_at = NOW()
            WHERE status = 'running'
              AND started_at < NOW() - ($1 * INTERVAL '1 minute')
              AND attempt >= max_attempts
            "#,
        )
        .bind(timeout_minutes)
        .execute(&mut *tx)
        .await?;

        let requeued = sqlx::query(
            r#"
            UPDATE scheduled_follow_ups AS s
            SET status = 'pending', run_at = NOW(), last_error = 'claim went stale, requeued'
            WHERE s.status = 'running'
              AND s.started_at < NOW() - ($1 * INTERVAL '1 minute')
              AND NOT EXISTS (
                  SELECT 1 FROM scheduled_follow_ups p
                  WHERE p.status = 'pending'
                    AND p.action = s.action
                    AND ((s.invoice_id IS NOT NULL AND p.invoice_id = s.invoice_id)
                      OR (s.dispute_id IS NOT NULL AND p.dispute_id = s.dispute_id)
                      OR (s.event_id IS NOT NULL AND p.event_id = s.event_id))
              )
            "#,
        )
        .bind(timeout_minutes)
        .execute(&mut *tx)
        .await?;

        // Anything still stale at this point has a newer pending duplicate
        // that would collide with the partial unique indexes
        sqlx::query(
            r#"
            UPDATE scheduled_follow_ups
            SET status = 'cancelled', last_error = 'stale claim superseded', completed_at = NOW()
            WHERE status = 'running'
              AND started_at < NOW() - ($1 * INTERVAL '1 minute')
            "#,
        )
        .bind(timeout_minutes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let count = requeued.rows_affected();
        if count > 0 {
            tracing::warn!(requeued = count, "Requeued follow-ups with stale running claims");
        }

        Ok(count)
    }

    /// Cancel pending retries for an invoice (e.g. it was paid or the
    /// failure became terminal)
    pub async fn cancel_for_invoice(&self, invoice_id: &str) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_follow_ups
            SET status = 'cancelled', completed_at = NOW()
            WHERE invoice_id = $1 AND status = 'pending'
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancel pending retries for a subscription (terminal status reached)
    pub async fn cancel_for_subscription(&self, subscription_id: &str) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_follow_ups
            SET status = 'cancelled', completed_at = NOW()
            WHERE subscription_id = $1 AND status = 'pending'
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancel pending follow-ups for a dispute (it was closed)
    pub async fn cancel_for_dispute(&self, dispute_id: &str) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_follow_ups
            SET status = 'cancelled', completed_at = NOW()
            WHERE dispute_id = $1 AND status = 'pending'
            "#,
        )
        .bind(dispute_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub fn action_of(entry: &FollowUpEntry) -> BillingResult<FollowUpAction> {
        FollowUpAction::parse(&entry.action).ok_or_else(|| {
            BillingError::Internal(format!("unknown follow-up action: {}", entry.action))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dunning_ladder() {
        assert_eq!(dunning_delay(0), Duration::days(1));
        assert_eq!(dunning_delay(1), Duration::days(1));
        assert_eq!(dunning_delay(2), Duration::days(3));
        assert_eq!(dunning_delay(3), Duration::days(5));
        // Past the ladder stays on the final rung
        assert_eq!(dunning_delay(10), Duration::days(5));
    }

    #[test]
    fn test_reschedule_backoff_doubles_and_caps() {
        assert_eq!(reschedule_delay(Duration::days(1)), Duration::days(2));
        assert_eq!(reschedule_delay(Duration::days(3)), Duration::days(6));
        assert_eq!(reschedule_delay(Duration::days(4)), Duration::days(7));
        assert_eq!(reschedule_delay(Duration::days(30)), Duration::days(7));
    }

    #[test]
    fn test_action_round_trip() {
        assert_eq!(
            FollowUpAction::parse("retry_payment"),
            Some(FollowUpAction::RetryPayment)
        );
        assert_eq!(
            FollowUpAction::parse(FollowUpAction::EscalateDispute.as_str()),
            Some(FollowUpAction::EscalateDispute)
        );
        assert_eq!(
            FollowUpAction::parse("replay_event"),
            Some(FollowUpAction::ReplayEvent)
        );
        assert_eq!(FollowUpAction::parse("send_email"), None);
    }
}
