//! Failed payment handling (dunning)
//!
//! Decides retry vs terminal failure from the invoice attempt count and the
//! card decline code, moves the local subscription through the status state
//! machine under a row lock, schedules the next attempt in the persisted
//! queue, and logs the outcome for the customer and the history feed.

use sqlx::PgPool;
use stripe::Invoice;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::context::EdgeCaseContext;
use crate::error::{BillingError, BillingResult};
use crate::events::{HistoryEntryBuilder, HistoryKind, HistoryLogger};
use crate::notifications::{AlertSeverity, NotificationService};
use crate::retry::{dunning_delay, FollowUpAction, RetryQueue};
use crate::status::{check_subscription_transition, SubscriptionStatus};

/// Decline codes where retrying can never succeed. Retrying a card reported
/// stolen also risks network fines, so these end dunning immediately.
const HARD_DECLINE_CODES: &[&str] = &[
    "fraudulent",
    "stolen_card",
    "lost_card",
    "pickup_card",
    "do_not_honor",
];

/// Maximum payment attempts before dunning gives up
pub const MAX_PAYMENT_ATTEMPTS: i32 = 4;

/// Outcome of classifying a failed payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DunningDecision {
    /// Schedule another attempt after the given ladder delay
    Retry { next_attempt_at: OffsetDateTime },
    /// Stop retrying
    Terminal { reason: String },
}

/// Decide retry vs terminal from the attempt count and decline code.
///
/// Hard declines are terminal on any attempt; everything else retries until
/// the attempt budget is spent.
pub fn classify_failure(attempt_count: i32, decline_code: Option<&str>) -> DunningDecision {
    if let Some(code) = decline_code {
        if HARD_DECLINE_CODES.contains(&code) {
            return DunningDecision::Terminal {
                reason: format!("hard decline: {}", code),
            };
        }
    }

    if attempt_count >= MAX_PAYMENT_ATTEMPTS {
        return DunningDecision::Terminal {
            reason: format!("{} attempts exhausted", attempt_count),
        };
    }

    DunningDecision::Retry {
        next_attempt_at: OffsetDateTime::now_utc() + dunning_delay(attempt_count),
    }
}

/// Handles invoice.payment_failed events
pub struct FailedPaymentService {
    stripe: StripeClient,
    pool: PgPool,
    history: HistoryLogger,
    notifications: NotificationService,
    queue: RetryQueue,
}

impl FailedPaymentService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let history = HistoryLogger::new(pool.clone());
        let notifications = NotificationService::new(pool.clone());
        let queue = RetryQueue::new(pool.clone());
        Self {
            stripe,
            pool,
            history,
            notifications,
            queue,
        }
    }

    /// Process a failed invoice payment
    pub async fn handle_payment_failed(
        &self,
        ctx: &EdgeCaseContext,
        invoice: &Invoice,
    ) -> BillingResult<()> {
        let invoice_id = invoice.id.to_string();
        let customer_id = ctx
            .customer_id
            .clone()
            .ok_or_else(|| BillingError::Internal("no customer on failed invoice".to_string()))?;
        let subscription_id = ctx.subscription_id.clone();

        let attempt_count = invoice.attempt_count.unwrap_or(0) as i32;
        let amount_due = invoice.amount_due.unwrap_or(0);
        let decline_code = self.lookup_decline_code(ctx).await;

        let decision = classify_failure(attempt_count, decline_code.as_deref());

        tracing::warn!(
            invoice_id = %invoice_id,
            customer_id = %customer_id,
            attempt_count = attempt_count,
            amount_due_cents = amount_due,
            decline_code = ?decline_code,
            decision = ?decision,
            "Invoice payment failed"
        );

        match &decision {
            DunningDecision::Retry { next_attempt_at } => {
                let Some(sub_id) = &subscription_id else {
                    // One-off invoice with no subscription: nothing to dun,
                    // and a "retry scheduled" history row would be a lie.
                    tracing::warn!(
                        invoice_id = %invoice_id,
                        customer_id = %customer_id,
                        "Failed payment without a subscription, no retry to schedule"
                    );
                    return Ok(());
                };

                self.transition_subscription(sub_id, SubscriptionStatus::PastDue)
                    .await?;
                self.queue
                    .enqueue(
                        FollowUpAction::RetryPayment,
                        Some(sub_id),
                        Some(&invoice_id),
                        None,
                        None,
                        *next_attempt_at,
                        MAX_PAYMENT_ATTEMPTS,
                    )
                    .await?;

                if let Err(e) = self
                    .history
                    .record(
                        HistoryEntryBuilder::new(&customer_id, HistoryKind::PaymentFailed, &invoice_id)
                            .amount_cents(amount_due)
                            .description(format!(
                                "Payment attempt {} failed, retry scheduled",
                                attempt_count
                            ))
                            .stripe_event(&ctx.event_id),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log payment_failed history row");
                }

                if let Err(e) = self
                    .notifications
                    .notify_customer(
                        &customer_id,
                        "Payment failed",
                        &format!(
                            "We could not collect ${:.2} for your subscription. We will retry automatically; please check your payment method.",
                            amount_due as f64 / 100.0
                        ),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to write payment failed notification");
                }
            }
            DunningDecision::Terminal { reason } => {
                if let Some(sub_id) = &subscription_id {
                    self.transition_subscription(sub_id, SubscriptionStatus::Unpaid)
                        .await?;
                    self.queue.cancel_for_invoice(&invoice_id).await?;
                }

                if let Err(e) = self
                    .history
                    .record(
                        HistoryEntryBuilder::new(&customer_id, HistoryKind::PaymentFailed, &invoice_id)
                            .amount_cents(amount_due)
                            .description(format!("Payment failed terminally: {}", reason))
                            .stripe_event(&ctx.event_id),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log terminal payment failure");
                }

                if let Err(e) = self
                    .notifications
                    .alert_admin(
                        AlertSeverity::Warning,
                        "failed_payment",
                        &format!(
                            "Subscription moved to unpaid after terminal payment failure ({})",
                            reason
                        ),
                        serde_json::json!({
                            "invoice_id": invoice_id,
                            "customer_id": customer_id,
                            "subscription_id": subscription_id,
                            "attempt_count": attempt_count,
                            "decline_code": decline_code,
                        }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to write terminal failure alert");
                }

                if let Err(e) = self
                    .notifications
                    .notify_customer(
                        &customer_id,
                        "Subscription suspended",
                        "We were unable to collect payment for your subscription. Update your payment method to restore access.",
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to write suspension notification");
                }
            }
        }

        Ok(())
    }

    /// Re-attempt payment for an invoice from a due queue entry.
    /// Called by the worker, not by webhook handlers.
    pub async fn retry_invoice_payment(&self, invoice_id: &str) -> BillingResult<()> {
        let parsed = invoice_id
            .parse::<stripe::InvoiceId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid invoice id: {}", e)))?;

        let invoice = Invoice::pay(self.stripe.inner(), &parsed).await?;

        tracing::info!(
            invoice_id = %invoice_id,
            status = ?invoice.status,
            "Retried invoice payment"
        );

        // A successful pay triggers invoice.paid via webhook, which restores
        // the subscription status; nothing more to do here.
        Ok(())
    }

    /// Restore a past_due subscription after a successful payment
    pub async fn handle_payment_recovered(
        &self,
        ctx: &EdgeCaseContext,
        invoice: &Invoice,
    ) -> BillingResult<()> {
        let invoice_id = invoice.id.to_string();

        if let Some(sub_id) = &ctx.subscription_id {
            self.transition_subscription(sub_id, SubscriptionStatus::Active)
                .await?;
        }
        let cancelled = self.queue.cancel_for_invoice(&invoice_id).await?;

        tracing::info!(
            invoice_id = %invoice_id,
            retries_cancelled = cancelled,
            "Payment recovered, dunning stopped"
        );

        Ok(())
    }

    /// Move the local subscription row through the state machine under a row
    /// lock, so concurrent deliveries for the same subscription serialize.
    async fn transition_subscription(
        &self,
        stripe_subscription_id: &str,
        to: SubscriptionStatus,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current = match current {
            Some((status,)) => status,
            None => {
                // Unknown subscription: nothing local to update. Stripe can
                // send events for subscriptions created before we mirrored.
                tracing::warn!(
                    subscription_id = %stripe_subscription_id,
                    "Payment event for subscription with no local row"
                );
                tx.commit().await?;
                return Ok(());
            }
        };

        let from = SubscriptionStatus::parse(&current).ok_or_else(|| {
            BillingError::Internal(format!("unknown local subscription status: {}", current))
        })?;

        if from == to {
            tx.commit().await?;
            return Ok(());
        }

        check_subscription_transition(from, to)?;

        sqlx::query(
            "UPDATE subscriptions SET status = $1, updated_at = NOW() WHERE stripe_subscription_id = $2",
        )
        .bind(to.as_str())
        .bind(stripe_subscription_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %stripe_subscription_id,
            from = %from,
            to = %to,
            "Subscription status transitioned"
        );

        Ok(())
    }

    /// Fetch the decline code from the charge behind the invoice, if any
    async fn lookup_decline_code(&self, ctx: &EdgeCaseContext) -> Option<String> {
        let charge_id = ctx.charge_id.as_ref()?;
        let parsed = charge_id.parse::<stripe::ChargeId>().ok()?;

        match stripe::Charge::retrieve(self.stripe.inner(), &parsed, &[]).await {
            Ok(charge) => charge.failure_code.as_ref().map(|c| c.to_string()),
            Err(e) => {
                tracing::warn!(
                    charge_id = %charge_id,
                    error = %e,
                    "Could not retrieve charge for decline code"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_decline_retries() {
        let decision = classify_failure(1, Some("insufficient_funds"));
        assert!(matches!(decision, DunningDecision::Retry { .. }));
    }

    #[test]
    fn test_missing_code_retries() {
        let decision = classify_failure(2, None);
        assert!(matches!(decision, DunningDecision::Retry { .. }));
    }

    #[test]
    fn test_hard_decline_terminal_on_first_attempt() {
        for code in ["fraudulent", "stolen_card", "lost_card", "pickup_card", "do_not_honor"] {
            let decision = classify_failure(1, Some(code));
            match decision {
                DunningDecision::Terminal { reason } => {
                    assert!(reason.contains(code), "reason should name the code")
                }
                other => panic!("expected terminal for {}, got {:?}", code, other),
            }
        }
    }

    #[test]
    fn test_first_attempt_hard_decline_can_reach_unpaid() {
        // The terminal branch suspends the subscription directly; the state
        // machine has to accept active/trialing -> unpaid for that to land.
        let decision = classify_failure(1, Some("stolen_card"));
        assert!(matches!(decision, DunningDecision::Terminal { .. }));

        for from in [SubscriptionStatus::Active, SubscriptionStatus::Trialing] {
            check_subscription_transition(from, SubscriptionStatus::Unpaid)
                .unwrap_or_else(|e| panic!("{} -> unpaid refused: {}", from, e));
        }
    }

    #[test]
    fn test_attempts_exhausted_terminal() {
        let decision = classify_failure(MAX_PAYMENT_ATTEMPTS, Some("insufficient_funds"));
        assert!(matches!(decision, DunningDecision::Terminal { .. }));

        let decision = classify_failure(MAX_PAYMENT_ATTEMPTS + 3, None);
        assert!(matches!(decision, DunningDecision::Terminal { .. }));
    }

    #[test]
    fn test_retry_delay_follows_ladder() {
        let before = OffsetDateTime::now_utc();
        match classify_failure(2, None) {
            DunningDecision::Retry { next_attempt_at } => {
                let delta = next_attempt_at - before;
                assert!(delta >= time::Duration::days(3));
                assert!(delta < time::Duration::days(3) + time::Duration::minutes(1));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }
}
