//! Billing history log
//!
//! Append-only record of money-movement events. Handlers write a row for
//! every payment failure, refund, credit, and dispute outcome; the history
//! feed reads them back merged with Stripe invoices. Writes are idempotent
//! on (kind, reference_id) so webhook re-deliveries cannot double-log.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Kind of a billing history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    PaymentFailed,
    PaymentRetryScheduled,
    RefundProcessed,
    CreditIssued,
    PlanChanged,
    DisputeCreated,
    DisputeWon,
    DisputeLost,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::PaymentFailed => "payment_failed",
            HistoryKind::PaymentRetryScheduled => "payment_retry_scheduled",
            HistoryKind::RefundProcessed => "refund_processed",
            HistoryKind::CreditIssued => "credit_issued",
            HistoryKind::PlanChanged => "plan_changed",
            HistoryKind::DisputeCreated => "dispute_created",
            HistoryKind::DisputeWon => "dispute_won",
            HistoryKind::DisputeLost => "dispute_lost",
        }
    }
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored billing history row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingHistoryRecord {
    pub id: Uuid,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub kind: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub stripe_event_id: Option<String>,
    pub reference_id: String,
    pub created_at: OffsetDateTime,
}

/// Builder for a billing history entry
pub struct HistoryEntryBuilder {
    customer_id: String,
    subscription_id: Option<String>,
    kind: HistoryKind,
    amount_cents: i64,
    currency: String,
    description: String,
    stripe_event_id: Option<String>,
    reference_id: String,
}

impl HistoryEntryBuilder {
    /// `reference_id` is the Stripe object this entry is about (invoice,
    /// refund, dispute...); together with `kind` it forms the dedup key.
    pub fn new(customer_id: impl Into<String>, kind: HistoryKind, reference_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            subscription_id: None,
            kind,
            amount_cents: 0,
            currency: "usd".to_string(),
            description: String::new(),
            stripe_event_id: None,
            reference_id: reference_id.into(),
        }
    }

    pub fn subscription(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }

    pub fn amount_cents(mut self, amount: i64) -> Self {
        self.amount_cents = amount;
        self
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }
}

/// Writes billing history rows
#[derive(Clone)]
pub struct HistoryLogger {
    pool: PgPool,
}

impl HistoryLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a history row, skipping silently on a duplicate (kind, reference_id)
    pub async fn record(&self, entry: HistoryEntryBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_history (
                id, customer_id, subscription_id, kind, amount_cents,
                currency, description, stripe_event_id, reference_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (kind, reference_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.customer_id)
        .bind(&entry.subscription_id)
        .bind(entry.kind.as_str())
        .bind(entry.amount_cents)
        .bind(&entry.currency)
        .bind(&entry.description)
        .bind(&entry.stripe_event_id)
        .bind(&entry.reference_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch history rows for a customer, newest first
    pub async fn list_for_customer(
        &self,
        customer_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingHistoryRecord>> {
        let records: Vec<BillingHistoryRecord> = sqlx::query_as(
            r#"
            SELECT id, customer_id, subscription_id, kind, amount_cents,
                   currency, description, stripe_event_id, reference_id, created_at
            FROM billing_history
            WHERE customer_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(customer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_kind_strings() {
        assert_eq!(HistoryKind::PaymentFailed.as_str(), "payment_failed");
        assert_eq!(HistoryKind::RefundProcessed.as_str(), "refund_processed");
        assert_eq!(HistoryKind::DisputeLost.as_str(), "dispute_lost");
    }

    #[test]
    fn test_builder_defaults() {
        let entry = HistoryEntryBuilder::new("cus_123", HistoryKind::CreditIssued, "cn_1")
            .amount_cents(1500)
            .description("Credit note for in_42");
        assert_eq!(entry.currency, "usd");
        assert_eq!(entry.amount_cents, 1500);
        assert!(entry.subscription_id.is_none());
    }
}
