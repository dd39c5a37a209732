//! Edge case coordinator
//!
//! Single entry point for Stripe webhooks: verifies the signature, claims the
//! event in edge_case_events so concurrent deliveries cannot double-process,
//! dispatches to the per-concern services, and records the outcome. Failed
//! events stay queryable and replayable through the admin surface.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Charge, Dispute, Event, EventObject, EventType, Invoice, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::context::EdgeCaseContext;
use crate::disputes::DisputeService;
use crate::error::{BillingError, BillingResult};
use crate::failed_payment::FailedPaymentService;
use crate::notifications::{AlertSeverity, NotificationService};
use crate::refunds::RefundService;
use crate::retry::{FollowUpAction, RetryQueue};
use crate::status::SubscriptionStatus;

type HmacSha256 = Hmac<Sha256>;

/// How long a claim may sit in 'processing' before another delivery may
/// reclaim it. Covers crashes between claim and outcome write.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Whether dispatch found a handler for the event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Handled,
    Ignored,
}

/// Coordinates webhook verification, idempotent claiming, and dispatch
pub struct EdgeCaseCoordinator {
    stripe: StripeClient,
    pool: PgPool,
    failed_payments: FailedPaymentService,
    disputes: DisputeService,
    refunds: RefundService,
    notifications: NotificationService,
    queue: RetryQueue,
}

impl EdgeCaseCoordinator {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let failed_payments = FailedPaymentService::new(stripe.clone(), pool.clone());
        let disputes = DisputeService::new(stripe.clone(), pool.clone());
        let refunds = RefundService::new(stripe.clone(), pool.clone());
        let notifications = NotificationService::new(pool.clone());
        let queue = RetryQueue::new(pool.clone());
        Self {
            stripe,
            pool,
            failed_payments,
            disputes,
            refunds,
            notifications,
            queue,
        }
    }

    /// Verify and parse a Stripe webhook payload.
    ///
    /// Tries the SDK verifier first, then falls back to manual signature
    /// verification: the SDK rejects payloads from API versions newer than
    /// the one it was generated against, but the signature scheme is stable.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = self.stripe.config().webhook_secret.as_str();

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "SDK webhook verification failed, trying manual verification"
                );
            }
        }

        // Signature header format: t=timestamp,v1=signature[,v0=signature]
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        // 5 minute replay tolerance
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > 300 {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse verified webhook payload");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification passed"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The INSERT...ON CONFLICT...RETURNING claim guarantees exactly one
    /// concurrent delivery wins processing rights; a claim stuck in
    /// 'processing' past the timeout may be reclaimed by a later delivery.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();
        let ctx = EdgeCaseContext::from_event(&event);

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO edge_case_events
                (stripe_event_id, event_type, event_timestamp, context, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE edge_case_events.processing_result = 'processing'
              AND edge_case_events.processing_started_at < NOW() - ($5 * INTERVAL '1 minute')
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(ctx.event_created)
        .bind(ctx.to_json())
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            let existing_status: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM edge_case_events WHERE stripe_event_id = $1",
            )
            .bind(&event_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                existing_status = ?existing_status.map(|(s,)| s),
                "Duplicate webhook delivery, claim not granted"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event_type_str,
            event_id = %event_id,
            "Processing Stripe event"
        );

        let result = self.dispatch(&ctx, &event).await;

        let (processing_result, error_message) = match &result {
            Ok(DispatchOutcome::Handled) => ("success".to_string(), None),
            Ok(DispatchOutcome::Ignored) => ("ignored".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        self.record_outcome(&event_id, &processing_result, error_message.as_deref())
            .await;

        if let Err(e) = &result {
            if e.is_retryable() {
                self.schedule_event_replay(&ctx, e).await;
            }
        }

        result.map(|_| ())
    }

    /// A transient failure gets a replay follow-up and an operator alert;
    /// the worker re-drives it once Stripe or the database recovers.
    async fn schedule_event_replay(&self, ctx: &EdgeCaseContext, error: &BillingError) {
        if let Err(queue_err) = self
            .queue
            .enqueue(
                FollowUpAction::ReplayEvent,
                ctx.subscription_id.as_deref(),
                None,
                None,
                Some(&ctx.event_id),
                OffsetDateTime::now_utc() + time::Duration::minutes(5),
                5,
            )
            .await
        {
            tracing::error!(
                event_id = %ctx.event_id,
                error = %queue_err,
                "Failed to schedule replay for failed event"
            );
        }

        if let Err(alert_err) = self
            .notifications
            .alert_admin(
                AlertSeverity::Warning,
                "webhook",
                &format!(
                    "Event {} failed with retryable error: {}",
                    ctx.event_id, error
                ),
                serde_json::json!({
                    "event_id": ctx.event_id,
                    "event_type": ctx.event_type,
                }),
            )
            .await
        {
            tracing::warn!(error = %alert_err, "Failed to write webhook failure alert");
        }
    }

    async fn dispatch(
        &self,
        ctx: &EdgeCaseContext,
        event: &Event,
    ) -> BillingResult<DispatchOutcome> {
        match event.type_ {
            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event)?;
                self.failed_payments
                    .handle_payment_failed(ctx, &invoice)
                    .await?;
            }
            EventType::InvoicePaid => {
                let invoice = extract_invoice(event)?;
                self.failed_payments
                    .handle_payment_recovered(ctx, &invoice)
                    .await?;
            }

            EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event)?;
                self.sync_subscription(&subscription).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                self.handle_subscription_deleted(&subscription).await?;
            }

            EventType::ChargeRefunded => {
                let charge = extract_charge(event)?;
                self.refunds.handle_charge_refunded(ctx, &charge).await?;
            }

            EventType::ChargeDisputeCreated => {
                let dispute = extract_dispute(event)?;
                self.disputes.handle_dispute_created(ctx, &dispute).await?;
            }
            EventType::ChargeDisputeUpdated => {
                let dispute = extract_dispute(event)?;
                self.disputes.handle_dispute_updated(ctx, &dispute).await?;
            }
            EventType::ChargeDisputeClosed => {
                let dispute = extract_dispute(event)?;
                self.disputes.handle_dispute_closed(ctx, &dispute).await?;
            }

            // Card updates resolve dunning only once a payment actually
            // succeeds, but they are worth an info line for support.
            EventType::PaymentMethodAttached | EventType::SetupIntentSucceeded => {
                tracing::info!(
                    event_id = %ctx.event_id,
                    customer_id = ?ctx.customer_id,
                    "Customer updated payment method"
                );
            }

            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Unhandled Stripe event type"
                );
                return Ok(DispatchOutcome::Ignored);
            }
        }

        Ok(DispatchOutcome::Handled)
    }

    /// Mirror subscription state from Stripe into the local row. Stripe is
    /// the source of truth for everything except our paused flag, which only
    /// the dispute flow sets.
    async fn sync_subscription(&self, subscription: &stripe::Subscription) -> BillingResult<()> {
        let subscription_id = subscription.id.to_string();
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string());

        let stripe_status = map_stripe_subscription_status(subscription.status);

        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE",
        )
        .bind(&subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let local_status = current
            .as_ref()
            .and_then(|(s,)| SubscriptionStatus::parse(s));
        let status = resolve_synced_status(local_status, stripe_status);
        if status != stripe_status {
            // Either the dispute freeze or a transition the lifecycle refuses
            // (e.g. a late-delivered update for a canceled subscription)
            tracing::warn!(
                subscription_id = %subscription_id,
                local_status = ?local_status,
                stripe_status = %stripe_status,
                "Stripe status not applied, keeping local status"
            );
        }

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, customer_id, stripe_price_id, status,
                current_period_start, current_period_end, cancel_at_period_end,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                stripe_price_id = EXCLUDED.stripe_price_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&subscription_id)
        .bind(&customer_id)
        .bind(&price_id)
        .bind(status.as_str())
        .bind(timestamp_or_now(subscription.current_period_start))
        .bind(timestamp_or_now(subscription.current_period_end))
        .bind(subscription.cancel_at_period_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            status = %status,
            "Subscription synced from Stripe"
        );

        Ok(())
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: &stripe::Subscription,
    ) -> BillingResult<()> {
        let subscription_id = subscription.id.to_string();

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(&subscription_id)
        .execute(&self.pool)
        .await?;

        let cancelled = self.queue.cancel_for_subscription(&subscription_id).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            follow_ups_cancelled = cancelled,
            "Subscription deleted"
        );

        Ok(())
    }

    async fn record_outcome(&self, event_id: &str, result: &str, error: Option<&str>) {
        let update = sqlx::query(
            r#"
            UPDATE edge_case_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result)
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await;

        // The outcome row is what idempotency and replay key off, so retry
        // once before giving up.
        if let Err(e) = update {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "Failed to record event outcome, retrying"
            );

            if let Err(retry_err) = sqlx::query(
                r#"
                UPDATE edge_case_events
                SET processing_result = $1, error_message = $2
                WHERE stripe_event_id = $3
                "#,
            )
            .bind(result)
            .bind(error)
            .bind(event_id)
            .execute(&self.pool)
            .await
            {
                tracing::error!(
                    event_id = %event_id,
                    result = %result,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record event outcome after retry; event may appear stuck in 'processing'"
                );
            }
        }
    }

    // ============ REPLAY SURFACE ============

    /// List events that failed or appear stuck
    pub async fn list_failed_events(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<EdgeCaseEventRecord>> {
        let records: Vec<EdgeCaseEventRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, event_timestamp,
                   processing_result, processing_started_at, error_message, created_at
            FROM edge_case_events
            WHERE processing_result IN ('error', 'processing', 'replaying')
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Put events stranded in 'replaying' by a crashed replay back into
    /// 'error' so they show up as failed and can be replayed again.
    pub async fn reset_stuck_replays(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE edge_case_events
            SET processing_result = 'error',
                error_message = CONCAT('Replay interrupted. ', COALESCE(error_message, ''))
            WHERE processing_result = 'replaying'
              AND processing_started_at < NOW() - ($1 * INTERVAL '1 minute')
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::warn!(count = count, "Reset events stuck in replaying");
        }

        Ok(count)
    }

    /// List events with an optional status filter
    pub async fn list_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<EdgeCaseEventRecord>> {
        let records: Vec<EdgeCaseEventRecord> = match status_filter {
            Some(status) => {
                sqlx::query_as(
                    r#"
                    SELECT id, stripe_event_id, event_type, event_timestamp,
                           processing_result, processing_started_at, error_message, created_at
                    FROM edge_case_events
                    WHERE processing_result = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, stripe_event_id, event_type, event_timestamp,
                           processing_result, processing_started_at, error_message, created_at
                    FROM edge_case_events
                    ORDER BY created_at DESC
                    LIMIT $1 OFFSET $2
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(records)
    }

    /// Re-fetch an event from Stripe and run it through dispatch again
    pub async fn replay_event(&self, stripe_event_id: &str) -> BillingResult<EventReplayResult> {
        let existing: Option<(Uuid, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, processing_result, error_message
            FROM edge_case_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        let (record_id, previous_status, previous_error) = existing.ok_or_else(|| {
            BillingError::NotFound(format!("Event {} not found", stripe_event_id))
        })?;

        let event_id = stripe_event_id
            .parse::<stripe::EventId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid event id: {}", e)))?;

        let event = stripe::Event::retrieve(self.stripe.inner(), &event_id, &[])
            .await
            .map_err(|e| {
                BillingError::StripeApi(format!("failed to fetch event from Stripe: {}", e))
            })?;

        sqlx::query(
            r#"
            UPDATE edge_case_events
            SET processing_result = 'replaying',
                processing_started_at = NOW(),
                error_message = CONCAT('Replay initiated. Previous status: ', $2, '. Previous error: ', COALESCE($3, 'none'))
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .bind(&previous_status)
        .bind(&previous_error)
        .execute(&self.pool)
        .await?;

        let ctx = EdgeCaseContext::from_event(&event);
        let process_result = self.dispatch(&ctx, &event).await;

        let (new_status, new_error) = match &process_result {
            Ok(DispatchOutcome::Handled) => ("success".to_string(), None),
            Ok(DispatchOutcome::Ignored) => ("ignored".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        self.record_outcome(stripe_event_id, &new_status, new_error.as_deref())
            .await;

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %previous_status,
            new_status = %new_status,
            "Event replay completed"
        );

        Ok(EventReplayResult {
            record_id,
            stripe_event_id: stripe_event_id.to_string(),
            event_type: event.type_.to_string(),
            previous_status,
            previous_error,
            new_status,
            new_error,
            success: process_result.is_ok(),
        })
    }

    /// Replay every event currently in 'error', oldest first
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
    ) -> BillingResult<Vec<EventReplayResult>> {
        let limit = max_events.unwrap_or(100);

        // Strays from interrupted replays become 'error' and join this batch
        self.reset_stuck_replays().await?;

        let failed: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_event_id
            FROM edge_case_events
            WHERE processing_result = 'error'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(failed.len());

        for (event_id,) in failed {
            match self.replay_event(&event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %event_id,
                        error = %e,
                        "Failed to replay event"
                    );
                    results.push(EventReplayResult {
                        record_id: Uuid::nil(),
                        stripe_event_id: event_id,
                        event_type: "unknown".to_string(),
                        previous_status: "error".to_string(),
                        previous_error: None,
                        new_status: "error".to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Delete processed event rows older than `retention_days`.
    /// Failed rows are kept so they stay replayable.
    pub async fn prune_events(&self, retention_days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM edge_case_events
            WHERE processing_result IN ('success', 'ignored')
              AND created_at < NOW() - ($1 * INTERVAL '1 day')
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn timestamp_or_now(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Decide what a Stripe-sourced sync may write over the local status.
///
/// Paused is ours (the dispute freeze; Stripe's view is stale until the
/// dispute closes), and any transition the lifecycle refuses keeps the local
/// value instead of writing a bad row.
pub fn resolve_synced_status(
    local: Option<SubscriptionStatus>,
    remote: SubscriptionStatus,
) -> SubscriptionStatus {
    match local {
        None => remote,
        Some(SubscriptionStatus::Paused) => SubscriptionStatus::Paused,
        Some(local) if local.can_transition_to(remote) => remote,
        Some(local) => local,
    }
}

/// Map Stripe's subscription status onto the local state machine
pub fn map_stripe_subscription_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
        stripe::SubscriptionStatus::Canceled
        | stripe::SubscriptionStatus::Incomplete
        | stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::Canceled,
    }
}

fn extract_invoice(event: &Event) -> BillingResult<Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "expected Invoice".to_string(),
        )),
    }
}

fn extract_subscription(event: &Event) -> BillingResult<stripe::Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "expected Subscription".to_string(),
        )),
    }
}

fn extract_charge(event: &Event) -> BillingResult<Charge> {
    match &event.data.object {
        EventObject::Charge(charge) => Ok(charge.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "expected Charge".to_string(),
        )),
    }
}

fn extract_dispute(event: &Event) -> BillingResult<Dispute> {
    match &event.data.object {
        EventObject::Dispute(dispute) => Ok(dispute.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "expected Dispute".to_string(),
        )),
    }
}

/// Stored event record
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct EdgeCaseEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Result of replaying one event
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_status_mapping() {
        assert_eq!(
            map_stripe_subscription_status(stripe::SubscriptionStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_stripe_subscription_status(stripe::SubscriptionStatus::PastDue),
            SubscriptionStatus::PastDue
        );
        // Incomplete states never got a working payment method; treat as canceled
        assert_eq!(
            map_stripe_subscription_status(stripe::SubscriptionStatus::Incomplete),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_stripe_subscription_status(stripe::SubscriptionStatus::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_sync_never_resurrects_canceled() {
        // A late-delivered subscription.updated for a canceled row stays canceled
        assert_eq!(
            resolve_synced_status(
                Some(SubscriptionStatus::Canceled),
                SubscriptionStatus::Active
            ),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_sync_keeps_dispute_pause() {
        assert_eq!(
            resolve_synced_status(Some(SubscriptionStatus::Paused), SubscriptionStatus::Active),
            SubscriptionStatus::Paused
        );
        assert_eq!(
            resolve_synced_status(
                Some(SubscriptionStatus::Paused),
                SubscriptionStatus::PastDue
            ),
            SubscriptionStatus::Paused
        );
    }

    #[test]
    fn test_sync_follows_allowed_transitions() {
        assert_eq!(
            resolve_synced_status(None, SubscriptionStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            resolve_synced_status(
                Some(SubscriptionStatus::Active),
                SubscriptionStatus::PastDue
            ),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            resolve_synced_status(
                Some(SubscriptionStatus::PastDue),
                SubscriptionStatus::Active
            ),
            SubscriptionStatus::Active
        );
    }
}
