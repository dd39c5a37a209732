//! Plan change proration
//!
//! Previews a mid-cycle plan change with Stripe's invoice preview endpoint,
//! executes the change with proration enabled, and appends the change to the
//! subscription_changes audit table.
//!
//! The preview uses a raw reqwest call: the create_preview endpoint replaced
//! GET /invoices/upcoming and the SDK does not cover it yet.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{Subscription, SubscriptionId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{HistoryEntryBuilder, HistoryKind, HistoryLogger};

/// Preview of what a plan change would bill today
#[derive(Debug, Clone, Serialize)]
pub struct ProrationPreview {
    pub subscription_id: String,
    pub new_price_id: String,
    /// Total the customer would owe on the next invoice, in cents
    pub amount_due_cents: i64,
    /// Sum of the proration line items only, in cents (can be negative on downgrade)
    pub proration_line_cents: i64,
    pub currency: String,
    pub description: String,
}

/// Result of an executed plan change
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeResult {
    pub subscription_id: String,
    pub old_price_id: Option<String>,
    pub new_price_id: String,
    /// Proration line total from the pre-change preview, if it could be fetched
    pub prorated_delta_cents: Option<i64>,
    pub change_id: Uuid,
}

/// Prorated value of an amount over the remaining fraction of a billing
/// period, floored toward the customer.
pub fn prorated_amount_cents(
    amount_cents: i64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    at: OffsetDateTime,
) -> i64 {
    if at >= period_end {
        return 0;
    }

    let total_secs = (period_end - period_start).whole_seconds();
    if total_secs <= 0 {
        return 0;
    }

    let remaining_secs = (period_end - at).whole_seconds().max(0).min(total_secs);
    let prorated = (amount_cents as f64) * (remaining_secs as f64 / total_secs as f64);

    prorated.floor() as i64
}

/// Handles subscription plan changes
pub struct ProrationService {
    stripe: StripeClient,
    pool: PgPool,
    history: HistoryLogger,
    http: reqwest::Client,
}

impl ProrationService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let history = HistoryLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            history,
            http: reqwest::Client::new(),
        }
    }

    /// Preview the invoice a plan change would produce, without changing anything
    pub async fn preview_plan_change(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProrationPreview> {
        let parsed = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid subscription id: {}", e)))?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &parsed, &[]).await?;

        let item_id = subscription
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::Internal("subscription has no items to reprice".to_string())
            })?;

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let params = [
            ("customer", customer_id.as_str()),
            ("subscription", subscription_id),
            ("subscription_details[items][0][id]", item_id.as_str()),
            ("subscription_details[items][0][price]", new_price_id),
            (
                "subscription_details[proration_behavior]",
                "create_prorations",
            ),
        ];

        let response = self
            .http
            .post("https://api.stripe.com/v1/invoices/create_preview")
            .basic_auth(self.stripe.secret_key(), None::<&str>)
            .form(&params)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("preview request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::StripeApi(format!(
                "preview returned {}: {}",
                status, body
            )));
        }

        let preview: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BillingError::StripeApi(format!("invalid preview body: {}", e)))?;

        let amount_due_cents = preview["amount_due"].as_i64().unwrap_or(0);
        let currency = preview["currency"].as_str().unwrap_or("usd").to_string();

        let proration_line_cents = preview["lines"]["data"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| l["proration"].as_bool().unwrap_or(false))
                    .filter_map(|l| l["amount"].as_i64())
                    .sum()
            })
            .unwrap_or(0);

        tracing::info!(
            subscription_id = %subscription_id,
            new_price_id = %new_price_id,
            amount_due_cents = amount_due_cents,
            proration_line_cents = proration_line_cents,
            "Previewed plan change"
        );

        Ok(ProrationPreview {
            subscription_id: subscription_id.to_string(),
            new_price_id: new_price_id.to_string(),
            amount_due_cents,
            proration_line_cents,
            currency,
            description: format!(
                "Switching to {} mid-cycle bills {} cents of prorated adjustments",
                new_price_id, proration_line_cents
            ),
        })
    }

    /// Execute a plan change with prorations and record the audit row
    pub async fn execute_plan_change(
        &self,
        subscription_id: &str,
        new_price_id: &str,
        initiated_by: &str,
    ) -> BillingResult<PlanChangeResult> {
        let parsed = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid subscription id: {}", e)))?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &parsed, &[]).await?;

        let item = subscription
            .items
            .data
            .first()
            .ok_or_else(|| BillingError::Internal("subscription has no items".to_string()))?;
        let old_price_id = item.price.as_ref().map(|p| p.id.to_string());

        // The delta has to be previewed before the update; losing it only
        // leaves a NULL in the audit row, so a preview failure is not fatal.
        let prorated_delta_cents = match self.preview_plan_change(subscription_id, new_price_id).await
        {
            Ok(preview) => Some(preview.proration_line_cents),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Could not preview proration delta before plan change"
                );
                None
            }
        };

        let mut items = Vec::new();
        items.push(stripe::UpdateSubscriptionItems {
            id: Some(item.id.to_string()),
            price: Some(new_price_id.to_string()),
            ..Default::default()
        });

        let mut params = stripe::UpdateSubscription::new();
        params.items = Some(items);
        // The glob re-export of SubscriptionProrationBehavior resolves to the
        // subscription_item enum; UpdateSubscription wants the subscription one.
        params.proration_behavior = Some(
            stripe::generated::billing::subscription::SubscriptionProrationBehavior::CreateProrations,
        );

        let updated = Subscription::update(self.stripe.inner(), &parsed, params).await?;

        let customer_id = match &updated.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        // Mirror the new price and period into the local row
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET stripe_price_id = $1,
                current_period_start = $2,
                current_period_end = $3,
                updated_at = NOW()
            WHERE stripe_subscription_id = $4
            "#,
        )
        .bind(new_price_id)
        .bind(
            OffsetDateTime::from_unix_timestamp(updated.current_period_start)
                .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        )
        .bind(
            OffsetDateTime::from_unix_timestamp(updated.current_period_end)
                .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        // Append the change audit row
        let change_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO subscription_changes (
                id, stripe_subscription_id, customer_id, old_price_id,
                new_price_id, prorated_delta_cents, initiated_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(change_id)
        .bind(subscription_id)
        .bind(&customer_id)
        .bind(&old_price_id)
        .bind(new_price_id)
        .bind(prorated_delta_cents)
        .bind(initiated_by)
        .execute(&self.pool)
        .await?;

        if let Err(e) = self
            .history
            .record(
                HistoryEntryBuilder::new(
                    &customer_id,
                    HistoryKind::PlanChanged,
                    change_id.to_string(),
                )
                .subscription(subscription_id)
                .description(format!(
                    "Plan changed from {} to {}",
                    old_price_id.as_deref().unwrap_or("(unknown)"),
                    new_price_id
                )),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log plan change history row");
        }

        tracing::info!(
            subscription_id = %subscription_id,
            old_price_id = ?old_price_id,
            new_price_id = %new_price_id,
            initiated_by = %initiated_by,
            "Plan change executed with prorations"
        );

        Ok(PlanChangeResult {
            subscription_id: subscription_id.to_string(),
            old_price_id,
            new_price_id: new_price_id.to_string(),
            prorated_delta_cents,
            change_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_prorated_amount_halfway() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);
        let at = start + Duration::days(15);

        let prorated = prorated_amount_cents(3000, start, end, at);
        assert_eq!(prorated, 1500);
    }

    #[test]
    fn test_prorated_amount_floors() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(3);
        let at = start + Duration::days(1);

        // 1000 * 2/3 = 666.66..., floored to 666
        assert_eq!(prorated_amount_cents(1000, start, end, at), 666);
    }

    #[test]
    fn test_prorated_amount_after_period_ends() {
        let start = OffsetDateTime::now_utc() - Duration::days(40);
        let end = start + Duration::days(30);
        let at = OffsetDateTime::now_utc();

        assert_eq!(prorated_amount_cents(3000, start, end, at), 0);
    }

    #[test]
    fn test_prorated_amount_degenerate_period() {
        let start = OffsetDateTime::now_utc();
        assert_eq!(prorated_amount_cents(3000, start, start, start), 0);
    }

    #[test]
    fn test_prorated_amount_full_period() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);

        assert_eq!(prorated_amount_cents(3000, start, end, start), 3000);
    }
}
