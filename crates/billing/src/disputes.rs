//! Dispute (chargeback) lifecycle
//!
//! dispute.created pauses collection on the subscription behind the disputed
//! charge and drafts evidence text for the operator; dispute.closed either
//! resumes (won) or cancels the subscription (lost). Every step mirrors the
//! dispute into payment_disputes through the status state machine and raises
//! an admin alert.

use sqlx::PgPool;
use stripe::{Dispute, Subscription, UpdateSubscription};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::context::EdgeCaseContext;
use crate::error::{BillingError, BillingResult};
use crate::events::{HistoryEntryBuilder, HistoryKind, HistoryLogger};
use crate::notifications::{AlertSeverity, NotificationService};
use crate::retry::{FollowUpAction, RetryQueue};
use crate::status::{
    check_dispute_transition, check_subscription_transition, DisputeStatus, SubscriptionStatus,
};

/// Facts fed into the evidence template
#[derive(Debug, Clone)]
pub struct DisputeEvidenceInput {
    pub customer_id: String,
    pub customer_email: Option<String>,
    pub invoice_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub service_start: Option<OffsetDateTime>,
    pub service_end: Option<OffsetDateTime>,
    pub dispute_reason: String,
}

/// Draft a product-description + usage narrative for the dispute response.
/// Operators edit this before submission; it is a starting point, not a filing.
pub fn generate_evidence_text(input: &DisputeEvidenceInput) -> String {
    let mut text = String::new();

    text.push_str(&format!(
        "Customer {} holds a paid QuoteKit subscription",
        input.customer_id
    ));
    if let Some(sub) = &input.subscription_id {
        text.push_str(&format!(" ({})", sub));
    }
    text.push_str(". ");

    if let Some(email) = &input.customer_email {
        text.push_str(&format!(
            "The account is registered to {} and was accessed with those credentials. ",
            email
        ));
    }

    text.push_str(&format!(
        "The disputed amount of {:.2} {} corresponds to",
        input.amount_cents as f64 / 100.0,
        input.currency.to_uppercase()
    ));
    if let Some(invoice) = &input.invoice_id {
        text.push_str(&format!(" invoice {}", invoice));
    } else {
        text.push_str(" a subscription charge");
    }

    match (input.service_start, input.service_end) {
        (Some(start), Some(end)) => {
            text.push_str(&format!(
                " covering service from {} to {}. ",
                start.date(),
                end.date()
            ));
        }
        _ => text.push_str(". "),
    }

    text.push_str(
        "The service was provisioned immediately upon payment and remained available \
         for the full billing period. Our records show the subscription was neither \
         cancelled nor was a refund requested through support before the dispute was filed.",
    );

    if input.dispute_reason == "fraudulent" {
        text.push_str(
            " The account predates the disputed charge and shows continued usage after it, \
             which is inconsistent with an unauthorized payment.",
        );
    }

    text
}

/// Map Stripe's dispute status string onto our lifecycle enum
pub fn map_stripe_dispute_status(status: &str) -> Option<DisputeStatus> {
    match status {
        "needs_response" => Some(DisputeStatus::NeedsResponse),
        "warning_needs_response" | "warning_under_review" => {
            Some(DisputeStatus::WarningNeedsResponse)
        }
        "under_review" => Some(DisputeStatus::UnderReview),
        "won" | "warning_closed" => Some(DisputeStatus::Won),
        "lost" => Some(DisputeStatus::Lost),
        _ => None,
    }
}

/// Handles charge.dispute.* events
pub struct DisputeService {
    stripe: StripeClient,
    pool: PgPool,
    history: HistoryLogger,
    notifications: NotificationService,
    queue: RetryQueue,
}

impl DisputeService {
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

    /// charge.dispute.created: mirror, pause collection, draft evidence, alert
    pub async fn handle_dispute_created(
        &self,
        ctx: &EdgeCaseContext,
        dispute: &Dispute,
    ) -> BillingResult<()> {
        let dispute_id = dispute.id.to_string();
        let charge_id = ctx
            .charge_id
            .clone()
            .ok_or_else(|| BillingError::Internal("dispute without charge".to_string()))?;

        let status = map_stripe_dispute_status(&format_status(dispute))
            .unwrap_or(DisputeStatus::NeedsResponse);
        let reason = if dispute.reason.is_empty() {
            "unknown".to_string()
        } else {
            dispute.reason.clone()
        };

        tracing::error!(
            dispute_id = %dispute_id,
            charge_id = %charge_id,
            amount_cents = dispute.amount,
            reason = %reason,
            "Chargeback dispute opened"
        );

        // Find customer/subscription behind the charge
        let (customer_id, subscription_id) = self.resolve_charge(&charge_id).await?;

        let evidence_due = dispute
            .evidence_details
            .due_by
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        let evidence_input = DisputeEvidenceInput {
            customer_id: customer_id.clone().unwrap_or_default(),
            customer_email: None,
            invoice_id: ctx.invoice_id.clone(),
            subscription_id: subscription_id.clone(),
            amount_cents: dispute.amount,
            currency: dispute.currency.to_string(),
            service_start: None,
            service_end: None,
            dispute_reason: reason.clone(),
        };
        let evidence_draft = generate_evidence_text(&evidence_input);

        sqlx::query(
            r#"
            INSERT INTO payment_disputes (
                id, stripe_dispute_id, stripe_charge_id, customer_id, subscription_id,
                amount_cents, currency, reason, status, evidence_draft, evidence_due_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (stripe_dispute_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&dispute_id)
        .bind(&charge_id)
        .bind(&customer_id)
        .bind(&subscription_id)
        .bind(dispute.amount)
        .bind(dispute.currency.to_string())
        .bind(&reason)
        .bind(status.as_str())
        .bind(&evidence_draft)
        .bind(evidence_due)
        .execute(&self.pool)
        .await?;

        // Escalate a day before the evidence deadline if the dispute is
        // still open by then
        if let Some(due) = evidence_due {
            let run_at = std::cmp::max(
                due - time::Duration::hours(24),
                OffsetDateTime::now_utc(),
            );
            if let Err(e) = self
                .queue
                .enqueue(
                    FollowUpAction::EscalateDispute,
                    subscription_id.as_deref(),
                    None,
                    Some(&dispute_id),
                    None,
                    run_at,
                    3,
                )
                .await
            {
                tracing::error!(
                    dispute_id = %dispute_id,
                    error = %e,
                    "Failed to schedule dispute escalation"
                );
            }
        }

        // Freeze collection while the dispute is open
        if let Some(sub_id) = &subscription_id {
            if let Err(e) = self.pause_subscription(sub_id, &dispute_id).await {
                tracing::error!(
                    subscription_id = %sub_id,
                    dispute_id = %dispute_id,
                    error = %e,
                    "Failed to pause subscription for dispute"
                );
            }
        }

        if let Some(customer) = &customer_id {
            if let Err(e) = self
                .history
                .record(
                    HistoryEntryBuilder::new(customer, HistoryKind::DisputeCreated, &dispute_id)
                        .amount_cents(dispute.amount)
                        .currency(dispute.currency.to_string())
                        .description(format!("Dispute opened: {}", reason))
                        .stripe_event(&ctx.event_id),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log dispute created history row");
            }
        }

        if let Err(e) = self
            .notifications
            .alert_admin(
                AlertSeverity::Critical,
                "dispute",
                &format!(
                    "Chargeback opened for {:.2} {} ({}), evidence due {}",
                    dispute.amount as f64 / 100.0,
                    dispute.currency,
                    reason,
                    evidence_due
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "(unknown)".to_string())
                ),
                serde_json::json!({
                    "dispute_id": dispute_id,
                    "charge_id": charge_id,
                    "customer_id": customer_id,
                    "subscription_id": subscription_id,
                    "evidence_draft": evidence_draft,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to write dispute alert");
        }

        Ok(())
    }

    /// charge.dispute.updated: move the mirror row through the lifecycle
    pub async fn handle_dispute_updated(
        &self,
        _ctx: &EdgeCaseContext,
        dispute: &Dispute,
    ) -> BillingResult<()> {
        let dispute_id = dispute.id.to_string();
        let new_status = map_stripe_dispute_status(&format_status(dispute)).ok_or_else(|| {
            BillingError::WebhookEventNotSupported(format!(
                "unmapped dispute status: {:?}",
                dispute.status
            ))
        })?;

        self.transition_dispute(&dispute_id, new_status).await?;

        tracing::info!(
            dispute_id = %dispute_id,
            status = %new_status,
            "Dispute updated"
        );

        Ok(())
    }

    /// charge.dispute.closed: resume on won, cancel on lost
    pub async fn handle_dispute_closed(
        &self,
        ctx: &EdgeCaseContext,
        dispute: &Dispute,
    ) -> BillingResult<()> {
        let dispute_id = dispute.id.to_string();
        let outcome = map_stripe_dispute_status(&format_status(dispute)).ok_or_else(|| {
            BillingError::WebhookEventNotSupported(format!(
                "unmapped dispute outcome: {:?}",
                dispute.status
            ))
        })?;

        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT customer_id, subscription_id FROM payment_disputes WHERE stripe_dispute_id = $1",
        )
        .bind(&dispute_id)
        .fetch_optional(&self.pool)
        .await?;

        let (customer_id, subscription_id) = row.ok_or_else(|| {
            BillingError::DisputeNotFound(dispute_id.clone())
        })?;

        self.transition_dispute(&dispute_id, outcome).await?;

        // The escalation follow-up is moot once the dispute is closed
        if outcome.is_terminal() {
            self.queue.cancel_for_dispute(&dispute_id).await?;
        }

        match outcome {
            DisputeStatus::Won => {
                if let Some(sub_id) = &subscription_id {
                    self.resume_subscription(sub_id).await?;
                }
                if let Some(customer) = &customer_id {
                    if let Err(e) = self
                        .history
                        .record(
                            HistoryEntryBuilder::new(customer, HistoryKind::DisputeWon, &dispute_id)
                                .amount_cents(dispute.amount)
                                .description("Dispute resolved in our favor")
                                .stripe_event(&ctx.event_id),
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to log dispute won history row");
                    }
                }
                tracing::info!(dispute_id = %dispute_id, "Dispute won, collection resumed");
            }
            DisputeStatus::Lost => {
                if let Some(sub_id) = &subscription_id {
                    self.cancel_subscription(sub_id).await?;
                    self.queue.cancel_for_subscription(sub_id).await?;
                }
                if let Some(customer) = &customer_id {
                    if let Err(e) = self
                        .history
                        .record(
                            HistoryEntryBuilder::new(customer, HistoryKind::DisputeLost, &dispute_id)
                                .amount_cents(dispute.amount)
                                .description("Dispute lost, subscription canceled")
                                .stripe_event(&ctx.event_id),
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to log dispute lost history row");
                    }
                }
                if let Err(e) = self
                    .notifications
                    .alert_admin(
                        AlertSeverity::Critical,
                        "dispute",
                        &format!(
                            "Dispute {} lost; {:.2} {} withdrawn plus network fee",
                            dispute_id,
                            dispute.amount as f64 / 100.0,
                            dispute.currency
                        ),
                        serde_json::json!({
                            "dispute_id": dispute_id,
                            "customer_id": customer_id,
                            "subscription_id": subscription_id,
                        }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to write dispute lost alert");
                }
                tracing::warn!(dispute_id = %dispute_id, "Dispute lost, subscription canceled");
            }
            other => {
                // closed with a non-terminal status is a Stripe oddity; record it
                tracing::warn!(
                    dispute_id = %dispute_id,
                    status = %other,
                    "Dispute closed with non-terminal status"
                );
            }
        }

        Ok(())
    }

    /// Disputes whose evidence deadline is within `hours` and still need a response
    pub async fn disputes_near_deadline(
        &self,
        hours: i64,
    ) -> BillingResult<Vec<(String, Option<String>, OffsetDateTime)>> {
        let rows: Vec<(String, Option<String>, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT stripe_dispute_id, customer_id, evidence_due_by
            FROM payment_disputes
            WHERE status IN ('needs_response', 'warning_needs_response')
              AND evidence_due_by IS NOT NULL
              AND evidence_due_by < NOW() + ($1 * INTERVAL '1 hour')
              AND evidence_due_by > NOW()
            "#,
        )
        .bind(hours)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn transition_dispute(&self, dispute_id: &str, to: DisputeStatus) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM payment_disputes WHERE stripe_dispute_id = $1 FOR UPDATE",
        )
        .bind(dispute_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current = current
            .map(|(s,)| s)
            .ok_or_else(|| BillingError::DisputeNotFound(dispute_id.to_string()))?;

        let from = DisputeStatus::parse(&current).ok_or_else(|| {
            BillingError::Internal(format!("unknown local dispute status: {}", current))
        })?;

        if from == to {
            tx.commit().await?;
            return Ok(());
        }

        check_dispute_transition(from, to)?;

        let closed_at = if to.is_terminal() {
            Some(OffsetDateTime::now_utc())
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE payment_disputes
            SET status = $1, closed_at = COALESCE($2, closed_at), updated_at = NOW()
            WHERE stripe_dispute_id = $3
            "#,
        )
        .bind(to.as_str())
        .bind(closed_at)
        .bind(dispute_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Pause collection: stop Stripe invoicing via pause_collection, tag the
    /// dispute in metadata, and move the local row to paused under a row lock.
    async fn pause_subscription(&self, subscription_id: &str, dispute_id: &str) -> BillingResult<()> {
        let parsed = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid subscription id: {}", e)))?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &parsed, &[]).await?;

        let mut metadata = subscription.metadata.clone();
        metadata.insert("paused_for_dispute".to_string(), dispute_id.to_string());
        metadata.insert(
            "paused_at".to_string(),
            OffsetDateTime::now_utc().unix_timestamp().to_string(),
        );

        let mut update = UpdateSubscription::new();
        update.metadata = Some(metadata);
        // Invoices raised while the dispute is open are marked uncollectible
        // instead of being pushed at the same contested card
        update.pause_collection = Some(stripe::UpdateSubscriptionPauseCollection {
            behavior: stripe::UpdateSubscriptionPauseCollectionBehavior::MarkUncollectible,
            resumes_at: None,
        });
        Subscription::update(self.stripe.inner(), &parsed, update).await?;

        self.transition_local(subscription_id, SubscriptionStatus::Paused)
            .await
    }

    /// Resume collection after a won dispute
    async fn resume_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let parsed = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid subscription id: {}", e)))?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &parsed, &[]).await?;

        let mut metadata = subscription.metadata.clone();
        metadata.remove("paused_for_dispute");
        metadata.remove("paused_at");

        let mut update = UpdateSubscription::new();
        update.metadata = Some(metadata);
        // The typed API cannot clear pause_collection; a resumes_at of now
        // ends the pause immediately
        update.pause_collection = Some(stripe::UpdateSubscriptionPauseCollection {
            behavior: stripe::UpdateSubscriptionPauseCollectionBehavior::MarkUncollectible,
            resumes_at: Some(OffsetDateTime::now_utc().unix_timestamp()),
        });
        Subscription::update(self.stripe.inner(), &parsed, update).await?;

        self.transition_local(subscription_id, SubscriptionStatus::Active)
            .await
    }

    /// Cancel immediately after a lost dispute
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let parsed = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid subscription id: {}", e)))?;

        Subscription::cancel(
            self.stripe.inner(),
            &parsed,
            stripe::CancelSubscription::default(),
        )
        .await?;

        self.transition_local(subscription_id, SubscriptionStatus::Canceled)
            .await
    }

    async fn transition_local(
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
                tracing::warn!(
                    subscription_id = %stripe_subscription_id,
                    "Dispute action on subscription with no local row"
                );
                tx.commit().await?;
                return Ok(());
            }
        };

        let from = SubscriptionStatus::parse(&current).ok_or_else(|| {
            BillingError::Internal(format!("unknown local subscription status: {}", current))
        })?;

        if from != to {
            check_subscription_transition(from, to)?;
            sqlx::query(
                "UPDATE subscriptions SET status = $1, updated_at = NOW() WHERE stripe_subscription_id = $2",
            )
            .bind(to.as_str())
            .bind(stripe_subscription_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Find the customer and subscription behind a charge, preferring the
    /// local invoice mirror and falling back to the Stripe API.
    async fn resolve_charge(
        &self,
        charge_id: &str,
    ) -> BillingResult<(Option<String>, Option<String>)> {
        let parsed = match charge_id.parse::<stripe::ChargeId>() {
            Ok(id) => id,
            Err(_) => return Ok((None, None)),
        };

        match stripe::Charge::retrieve(self.stripe.inner(), &parsed, &[]).await {
            Ok(charge) => {
                let customer_id = charge.customer.as_ref().map(|c| match c {
                    stripe::Expandable::Id(id) => id.to_string(),
                    stripe::Expandable::Object(c) => c.id.to_string(),
                });

                let subscription_id = match &customer_id {
                    Some(cus) => {
                        let row: Option<(String,)> = sqlx::query_as(
                            r#"
                            SELECT stripe_subscription_id FROM subscriptions
                            WHERE customer_id = $1 AND status NOT IN ('canceled')
                            ORDER BY created_at DESC
                            LIMIT 1
                            "#,
                        )
                        .bind(cus)
                        .fetch_optional(&self.pool)
                        .await?;
                        row.map(|(id,)| id)
                    }
                    None => None,
                };

                Ok((customer_id, subscription_id))
            }
            Err(e) => {
                tracing::warn!(charge_id = %charge_id, error = %e, "Could not resolve disputed charge");
                Ok((None, None))
            }
        }
    }
}

fn format_status(dispute: &Dispute) -> String {
    // DisputeStatus in the SDK serializes as the API's snake_case string
    serde_json::to_value(&dispute.status)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| format!("{:?}", dispute.status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> DisputeEvidenceInput {
        DisputeEvidenceInput {
            customer_id: "cus_123".to_string(),
            customer_email: Some("owner@example.com".to_string()),
            invoice_id: Some("in_456".to_string()),
            subscription_id: Some("sub_789".to_string()),
            amount_cents: 4900,
            currency: "usd".to_string(),
            service_start: None,
            service_end: None,
            dispute_reason: "product_not_received".to_string(),
        }
    }

    #[test]
    fn test_evidence_names_customer_and_invoice() {
        let text = generate_evidence_text(&sample_input());
        assert!(text.contains("cus_123"));
        assert!(text.contains("sub_789"));
        assert!(text.contains("in_456"));
        assert!(text.contains("49.00 USD"));
        assert!(text.contains("owner@example.com"));
    }

    #[test]
    fn test_evidence_fraud_addendum() {
        let mut input = sample_input();
        input.dispute_reason = "fraudulent".to_string();
        let text = generate_evidence_text(&input);
        assert!(text.contains("unauthorized"));

        input.dispute_reason = "duplicate".to_string();
        let text = generate_evidence_text(&input);
        assert!(!text.contains("unauthorized"));
    }

    #[test]
    fn test_evidence_without_invoice_or_email() {
        let mut input = sample_input();
        input.invoice_id = None;
        input.customer_email = None;
        let text = generate_evidence_text(&input);
        assert!(text.contains("a subscription charge"));
        assert!(!text.contains("@"));
    }

    #[test]
    fn test_stripe_status_mapping() {
        assert_eq!(
            map_stripe_dispute_status("needs_response"),
            Some(DisputeStatus::NeedsResponse)
        );
        assert_eq!(
            map_stripe_dispute_status("warning_needs_response"),
            Some(DisputeStatus::WarningNeedsResponse)
        );
        assert_eq!(map_stripe_dispute_status("won"), Some(DisputeStatus::Won));
        assert_eq!(
            map_stripe_dispute_status("warning_closed"),
            Some(DisputeStatus::Won)
        );
        assert_eq!(map_stripe_dispute_status("lost"), Some(DisputeStatus::Lost));
        assert_eq!(map_stripe_dispute_status("charge_refunded"), None);
    }
}
