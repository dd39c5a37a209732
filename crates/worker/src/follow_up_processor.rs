//! Follow-up queue processing
//!
//! Claims due entries from scheduled_follow_ups and executes them. Payment
//! retries go to Stripe with a short transient-error retry; anything that
//! still fails is handed back to the queue for backoff rescheduling.

use std::sync::Arc;

use quotekit_billing::{AlertSeverity, BillingService, FollowUpAction, FollowUpEntry, RetryQueue};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

/// How many entries one pass may claim
const CLAIM_BATCH_SIZE: i64 = 25;

/// Run one pass over the due follow-ups
pub async fn process_follow_up_queue(billing: &Arc<BillingService>) {
    let entries = match billing.queue.claim_due(CLAIM_BATCH_SIZE).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(error = %e, "Failed to claim due follow-ups");
            return;
        }
    };

    if entries.is_empty() {
        return;
    }

    tracing::info!(count = entries.len(), "Processing due follow-ups");

    let mut completed = 0;
    let mut failed = 0;

    for entry in &entries {
        match execute_entry(billing, entry).await {
            Ok(()) => {
                if let Err(e) = billing.queue.complete(entry.id).await {
                    tracing::error!(
                        follow_up_id = %entry.id,
                        error = %e,
                        "Follow-up succeeded but completion was not recorded"
                    );
                }
                completed += 1;
            }
            Err(e) => {
                if let Err(resched_err) = billing
                    .queue
                    .fail_and_reschedule(entry, &e.to_string())
                    .await
                {
                    tracing::error!(
                        follow_up_id = %entry.id,
                        error = %resched_err,
                        "Failed to reschedule follow-up after failure"
                    );
                }
                failed += 1;
            }
        }
    }

    tracing::info!(
        completed = completed,
        failed = failed,
        "Follow-up pass complete"
    );
}

async fn execute_entry(
    billing: &Arc<BillingService>,
    entry: &FollowUpEntry,
) -> anyhow::Result<()> {
    let action = RetryQueue::action_of(entry)?;

    match action {
        FollowUpAction::RetryPayment => {
            let invoice_id = entry
                .invoice_id
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("retry_payment entry without invoice_id"))?;

            tracing::info!(
                follow_up_id = %entry.id,
                invoice_id = %invoice_id,
                attempt = entry.attempt,
                "Retrying invoice payment"
            );

            // Short in-process retry for transient Stripe failures; a real
            // decline comes back as an error and goes through queue backoff.
            let strategy = ExponentialBackoff::from_millis(500).take(2);
            Retry::spawn(strategy, || {
                billing.failed_payments.retry_invoice_payment(invoice_id)
            })
            .await?;

            Ok(())
        }
        FollowUpAction::ReplayEvent => {
            let event_id = entry
                .event_id
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("replay_event entry without event_id"))?;

            tracing::info!(
                follow_up_id = %entry.id,
                event_id = %event_id,
                attempt = entry.attempt,
                "Replaying failed webhook event"
            );

            let result = billing.coordinator.replay_event(event_id).await?;
            if !result.success {
                anyhow::bail!(
                    "replay of {} ended in '{}': {}",
                    event_id,
                    result.new_status,
                    result.new_error.unwrap_or_else(|| "unknown".to_string())
                );
            }

            Ok(())
        }
        FollowUpAction::EscalateDispute => {
            let dispute_id = entry
                .dispute_id
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("escalate_dispute entry without dispute_id"))?;

            tracing::warn!(
                follow_up_id = %entry.id,
                dispute_id = %dispute_id,
                "Escalating unanswered dispute"
            );

            billing
                .notifications
                .alert_admin(
                    AlertSeverity::Critical,
                    "dispute_escalation",
                    &format!(
                        "Dispute {} still needs a response and its follow-up came due",
                        dispute_id
                    ),
                    serde_json::json!({
                        "dispute_id": dispute_id,
                        "subscription_id": entry.subscription_id,
                    }),
                )
                .await?;

            Ok(())
        }
    }
}
