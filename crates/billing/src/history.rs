//! Billing history feed
//!
//! Merges three sources into one customer-facing timeline: invoices fetched
//! live from Stripe, plan changes from subscription_changes, and the local
//! billing_history rows (failures, refunds, credits, disputes). The merge is
//! pure so it can be tested without a database or Stripe.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{Invoice, ListInvoices};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::HistoryLogger;

/// Where a feed entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySource {
    Invoice,
    PlanChange,
    BillingEvent,
}

impl HistorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistorySource::Invoice => "invoice",
            HistorySource::PlanChange => "plan_change",
            HistorySource::BillingEvent => "billing_event",
        }
    }
}

/// One entry in the merged feed
#[derive(Debug, Clone, Serialize)]
pub struct BillingHistoryEntry {
    pub source: HistorySource,
    /// Stripe object or local row this entry is about; with `source` it
    /// forms the dedup key
    pub reference_id: String,
    pub kind: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub occurred_at: OffsetDateTime,
    pub invoice_url: Option<String>,
}

/// Merge feed entries from all sources: dedup on (source, reference_id)
/// keeping the first occurrence, newest first, truncated to `limit`.
pub fn merge_history(
    mut entries: Vec<BillingHistoryEntry>,
    limit: usize,
) -> Vec<BillingHistoryEntry> {
    entries.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));

    let mut seen = std::collections::HashSet::new();
    entries.retain(|e| seen.insert((e.source, e.reference_id.clone())));

    entries.truncate(limit);
    entries
}

/// Serves the merged billing history
pub struct BillingHistoryService {
    stripe: StripeClient,
    pool: PgPool,
    history: HistoryLogger,
}

impl BillingHistoryService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let history = HistoryLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            history,
        }
    }

    /// Full feed for one customer, newest first
    pub async fn customer_history(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        let mut entries = Vec::new();

        // Stripe is the source of truth for invoices; a failure here fails
        // the feed rather than silently hiding charges.
        entries.extend(self.invoice_entries(customer_id).await?);
        entries.extend(self.plan_change_entries(customer_id).await?);
        entries.extend(self.billing_event_entries(customer_id, limit).await?);

        Ok(merge_history(entries, limit))
    }

    async fn invoice_entries(&self, customer_id: &str) -> BillingResult<Vec<BillingHistoryEntry>> {
        let parsed = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid customer id: {}", e)))?;

        let mut params = ListInvoices::new();
        params.customer = Some(parsed);
        params.limit = Some(100);

        let invoices = Invoice::list(self.stripe.inner(), &params).await?;

        let entries = invoices
            .data
            .iter()
            .map(invoice_entry)
            .collect();

        Ok(entries)
    }

    async fn plan_change_entries(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        let rows: Vec<(
            uuid::Uuid,
            Option<String>,
            String,
            Option<i64>,
            OffsetDateTime,
        )> = sqlx::query_as(
            r#"
            SELECT id, old_price_id, new_price_id, prorated_delta_cents, created_at
            FROM subscription_changes
            WHERE customer_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .into_iter()
            .map(|(id, old_price, new_price, delta, created_at)| BillingHistoryEntry {
                source: HistorySource::PlanChange,
                reference_id: id.to_string(),
                kind: "plan_changed".to_string(),
                amount_cents: delta.unwrap_or(0),
                currency: "usd".to_string(),
                description: format!(
                    "Plan changed from {} to {}",
                    old_price.as_deref().unwrap_or("(unknown)"),
                    new_price
                ),
                occurred_at: created_at,
                invoice_url: None,
            })
            .collect();

        Ok(entries)
    }

    async fn billing_event_entries(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        let records = self
            .history
            .list_for_customer(customer_id, limit as i64)
            .await?;

        let entries = records
            .into_iter()
            .map(|r| BillingHistoryEntry {
                source: HistorySource::BillingEvent,
                reference_id: r.reference_id,
                kind: r.kind,
                amount_cents: r.amount_cents,
                currency: r.currency,
                description: r.description,
                occurred_at: r.created_at,
                invoice_url: None,
            })
            .collect();

        Ok(entries)
    }
}

fn invoice_entry(invoice: &Invoice) -> BillingHistoryEntry {
    let status = invoice
        .status
        .map(|s| format!("{:?}", s).to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    let occurred_at = invoice
        .created
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    BillingHistoryEntry {
        source: HistorySource::Invoice,
        reference_id: invoice.id.to_string(),
        kind: format!("invoice_{}", status),
        amount_cents: invoice.amount_due.unwrap_or(0),
        currency: invoice
            .currency
            .map(|c| c.to_string())
            .unwrap_or_else(|| "usd".to_string()),
        description: invoice
            .number
            .clone()
            .map(|n| format!("Invoice {}", n))
            .unwrap_or_else(|| "Invoice".to_string()),
        occurred_at,
        invoice_url: invoice.hosted_invoice_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn entry(
        source: HistorySource,
        reference_id: &str,
        minutes_ago: i64,
    ) -> BillingHistoryEntry {
        BillingHistoryEntry {
            source,
            reference_id: reference_id.to_string(),
            kind: "test".to_string(),
            amount_cents: 100,
            currency: "usd".to_string(),
            description: String::new(),
            occurred_at: OffsetDateTime::now_utc() - Duration::minutes(minutes_ago),
            invoice_url: None,
        }
    }

    #[test]
    fn test_merge_sorts_newest_first() {
        let merged = merge_history(
            vec![
                entry(HistorySource::Invoice, "in_1", 60),
                entry(HistorySource::BillingEvent, "re_1", 5),
                entry(HistorySource::PlanChange, "ch_1", 30),
            ],
            10,
        );

        let refs: Vec<&str> = merged.iter().map(|e| e.reference_id.as_str()).collect();
        assert_eq!(refs, vec!["re_1", "ch_1", "in_1"]);
    }

    #[test]
    fn test_merge_dedups_within_source() {
        let merged = merge_history(
            vec![
                entry(HistorySource::Invoice, "in_1", 10),
                entry(HistorySource::Invoice, "in_1", 20),
            ],
            10,
        );
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_merge_keeps_same_reference_across_sources() {
        // An invoice and a billing event about that invoice are both shown
        let merged = merge_history(
            vec![
                entry(HistorySource::Invoice, "in_1", 10),
                entry(HistorySource::BillingEvent, "in_1", 5),
            ],
            10,
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_applies_limit() {
        let entries = (0..20)
            .map(|i| entry(HistorySource::Invoice, &format!("in_{}", i), i))
            .collect();
        let merged = merge_history(entries, 5);
        assert_eq!(merged.len(), 5);
        assert_eq!(merged[0].reference_id, "in_0");
    }
}
