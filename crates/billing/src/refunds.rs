//! Refunds and credit notes
//!
//! Refund requests are validated against the 30-day policy window before any
//! Stripe call. An audit row is created in pending state first, then either
//! completed or failed, so a crash mid-refund leaves evidence. Externally
//! initiated refunds (charge.refunded webhooks) are recorded idempotently.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{Charge, CreateRefund, Refund, RefundReasonFilter};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::context::EdgeCaseContext;
use crate::error::{BillingError, BillingResult};
use crate::events::{HistoryEntryBuilder, HistoryKind, HistoryLogger};

/// Refund policy window in days
pub const REFUND_WINDOW_DAYS: i64 = 30;

/// Verdict of a refund eligibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum RefundEligibility {
    Eligible,
    /// Charge is older than the policy window
    WindowExpired { days_old: i64 },
    /// Charge was never captured or paid
    NotPaid,
    /// Charge already refunded (fully)
    AlreadyRefunded,
    /// Charge has an open or lost dispute
    Disputed,
}

impl RefundEligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, RefundEligibility::Eligible)
    }

    pub fn reason(&self) -> String {
        match self {
            RefundEligibility::Eligible => "eligible".to_string(),
            RefundEligibility::WindowExpired { days_old } => format!(
                "charge is {} days old, refund window is {} days",
                days_old, REFUND_WINDOW_DAYS
            ),
            RefundEligibility::NotPaid => "charge was not paid".to_string(),
            RefundEligibility::AlreadyRefunded => "charge is already fully refunded".to_string(),
            RefundEligibility::Disputed => "charge is under dispute".to_string(),
        }
    }
}

/// Pure policy check over charge facts
pub fn check_eligibility(
    charge_created: OffsetDateTime,
    now: OffsetDateTime,
    paid: bool,
    fully_refunded: bool,
    disputed: bool,
) -> RefundEligibility {
    if !paid {
        return RefundEligibility::NotPaid;
    }
    if fully_refunded {
        return RefundEligibility::AlreadyRefunded;
    }
    if disputed {
        return RefundEligibility::Disputed;
    }

    let days_old = (now - charge_created).whole_days();
    if days_old > REFUND_WINDOW_DAYS {
        return RefundEligibility::WindowExpired { days_old };
    }

    RefundEligibility::Eligible
}

/// Result of a refund or credit operation
#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub stripe_refund_id: Option<String>,
    pub stripe_charge_id: String,
    pub amount_cents: i64,
    /// "refund" (money back to the payment method) or "credit" (credit note)
    pub refund_type: String,
}

/// Handles refunds and credit notes
pub struct RefundService {
    stripe: StripeClient,
    pool: PgPool,
    history: HistoryLogger,
}

impl RefundService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let history = HistoryLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            history,
        }
    }

    /// Check whether a charge can be refunded under the 30-day policy
    pub async fn check_charge_eligibility(
        &self,
        charge_id: &str,
    ) -> BillingResult<RefundEligibility> {
        let parsed = charge_id
            .parse::<stripe::ChargeId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid charge id: {}", e)))?;
        let charge = Charge::retrieve(self.stripe.inner(), &parsed, &[]).await?;

        let created = OffsetDateTime::from_unix_timestamp(charge.created)
            .map_err(|_| BillingError::Internal("invalid charge timestamp".to_string()))?;

        Ok(check_eligibility(
            created,
            OffsetDateTime::now_utc(),
            charge.paid,
            charge.refunded,
            charge.disputed,
        ))
    }

    /// Issue an actual refund to the payment method
    pub async fn issue_refund(
        &self,
        customer_id: &str,
        charge_id: &str,
        invoice_id: Option<&str>,
        amount_cents: i64,
        reason: &str,
    ) -> BillingResult<RefundResult> {
        let eligibility = self.check_charge_eligibility(charge_id).await?;
        if !eligibility.is_eligible() {
            return Err(BillingError::RefundNotEligible(eligibility.reason()));
        }

        // Pending audit row first so a crash mid-refund is visible
        let audit_id = self
            .create_audit_row(customer_id, charge_id, invoice_id, amount_cents, "refund", reason)
            .await?;

        let mut params = CreateRefund::new();
        params.charge = Some(
            charge_id
                .parse()
                .map_err(|e| BillingError::RefundFailed(format!("invalid charge id: {}", e)))?,
        );
        params.amount = Some(amount_cents);
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("customer_id".to_string(), customer_id.to_string());
        metadata.insert("reason".to_string(), reason.to_string());
        params.metadata = Some(metadata);

        match Refund::create(self.stripe.inner(), params).await {
            Ok(refund) => {
                self.complete_audit_row(audit_id, Some(refund.id.as_str()), "completed", None)
                    .await?;

                if let Err(e) = self
                    .history
                    .record(
                        HistoryEntryBuilder::new(
                            customer_id,
                            HistoryKind::RefundProcessed,
                            refund.id.to_string(),
                        )
                        .amount_cents(amount_cents)
                        .description(format!("Refund issued: {}", reason)),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log refund history row");
                }

                tracing::info!(
                    customer_id = %customer_id,
                    charge_id = %charge_id,
                    refund_id = %refund.id,
                    amount_cents = amount_cents,
                    "Refund issued"
                );

                Ok(RefundResult {
                    stripe_refund_id: Some(refund.id.to_string()),
                    stripe_charge_id: charge_id.to_string(),
                    amount_cents,
                    refund_type: "refund".to_string(),
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.complete_audit_row(audit_id, None, "failed", Some(&message))
                    .await?;

                tracing::error!(
                    customer_id = %customer_id,
                    charge_id = %charge_id,
                    error = %message,
                    "Refund failed"
                );

                Err(BillingError::RefundFailed(message))
            }
        }
    }

    /// Issue a credit note against an invoice instead of moving money back
    pub async fn issue_credit_note(
        &self,
        customer_id: &str,
        invoice_id: &str,
        amount_cents: i64,
        memo: &str,
    ) -> BillingResult<RefundResult> {
        let parsed = invoice_id
            .parse::<stripe::InvoiceId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid invoice id: {}", e)))?;

        let audit_id = self
            .create_audit_row(customer_id, "", Some(invoice_id), amount_cents, "credit", memo)
            .await?;

        let mut params = stripe::CreateCreditNote::new(parsed);
        params.amount = Some(amount_cents);
        params.memo = Some(memo);

        match stripe::CreditNote::create(self.stripe.inner(), params).await {
            Ok(note) => {
                self.complete_audit_row(audit_id, Some(note.id.as_str()), "completed", None)
                    .await?;

                if let Err(e) = self
                    .history
                    .record(
                        HistoryEntryBuilder::new(
                            customer_id,
                            HistoryKind::CreditIssued,
                            note.id.to_string(),
                        )
                        .amount_cents(amount_cents)
                        .description(format!("Credit note on invoice {}: {}", invoice_id, memo)),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log credit note history row");
                }

                tracing::info!(
                    customer_id = %customer_id,
                    invoice_id = %invoice_id,
                    credit_note_id = %note.id,
                    amount_cents = amount_cents,
                    "Credit note issued"
                );

                Ok(RefundResult {
                    stripe_refund_id: Some(note.id.to_string()),
                    stripe_charge_id: String::new(),
                    amount_cents,
                    refund_type: "credit".to_string(),
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.complete_audit_row(audit_id, None, "failed", Some(&message))
                    .await?;
                Err(BillingError::RefundFailed(message))
            }
        }
    }

    /// Record a refund initiated outside this service (charge.refunded webhook)
    pub async fn handle_charge_refunded(
        &self,
        ctx: &EdgeCaseContext,
        charge: &Charge,
    ) -> BillingResult<()> {
        let customer_id = match &ctx.customer_id {
            Some(id) => id.clone(),
            None => {
                tracing::warn!(charge_id = %charge.id, "Refunded charge has no customer");
                return Ok(());
            }
        };

        let amount_refunded = charge.amount_refunded;
        let is_full = amount_refunded >= charge.amount;

        sqlx::query(
            r#"
            INSERT INTO refund_audit (
                id, customer_id, stripe_charge_id, stripe_invoice_id, stripe_refund_id,
                amount_cents, refund_type, reason, status, source, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, NULL, $5, $6, 'initiated in Stripe', 'completed', 'stripe_webhook', NOW(), NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&customer_id)
        .bind(charge.id.to_string())
        .bind(&ctx.invoice_id)
        .bind(amount_refunded)
        .bind(if is_full { "full" } else { "partial" })
        .execute(&self.pool)
        .await?;

        if let Err(e) = self
            .history
            .record(
                HistoryEntryBuilder::new(
                    &customer_id,
                    HistoryKind::RefundProcessed,
                    charge.id.to_string(),
                )
                .amount_cents(amount_refunded)
                .description(if is_full {
                    "Charge fully refunded".to_string()
                } else {
                    format!("Charge partially refunded ({} cents)", amount_refunded)
                })
                .stripe_event(&ctx.event_id),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log external refund history row");
        }

        tracing::info!(
            customer_id = %customer_id,
            charge_id = %charge.id,
            amount_refunded_cents = amount_refunded,
            is_full_refund = is_full,
            "External refund recorded"
        );

        Ok(())
    }

    async fn create_audit_row(
        &self,
        customer_id: &str,
        charge_id: &str,
        invoice_id: Option<&str>,
        amount_cents: i64,
        refund_type: &str,
        reason: &str,
    ) -> BillingResult<Uuid> {
        let record: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO refund_audit (
                id, customer_id, stripe_charge_id, stripe_invoice_id,
                amount_cents, refund_type, reason, status, source, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 'api', NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(charge_id)
        .bind(invoice_id)
        .bind(amount_cents)
        .bind(refund_type)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        Ok(record.0)
    }

    async fn complete_audit_row(
        &self,
        audit_id: Uuid,
        stripe_refund_id: Option<&str>,
        status: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE refund_audit
            SET stripe_refund_id = $2, status = $3, error_message = $4, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(audit_id)
        .bind(stripe_refund_id)
        .bind(status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn days_ago(days: i64) -> OffsetDateTime {
        OffsetDateTime::now_utc() - Duration::days(days)
    }

    #[test]
    fn test_recent_paid_charge_is_eligible() {
        let verdict = check_eligibility(days_ago(5), OffsetDateTime::now_utc(), true, false, false);
        assert_eq!(verdict, RefundEligibility::Eligible);
        assert!(verdict.is_eligible());
    }

    #[test]
    fn test_window_boundary() {
        // Exactly 30 days old is still inside the window
        let verdict =
            check_eligibility(days_ago(30), OffsetDateTime::now_utc(), true, false, false);
        assert_eq!(verdict, RefundEligibility::Eligible);

        // 31 days is out
        let verdict =
            check_eligibility(days_ago(31), OffsetDateTime::now_utc(), true, false, false);
        assert_eq!(verdict, RefundEligibility::WindowExpired { days_old: 31 });
        assert!(!verdict.is_eligible());
    }

    #[test]
    fn test_unpaid_charge_rejected() {
        let verdict =
            check_eligibility(days_ago(1), OffsetDateTime::now_utc(), false, false, false);
        assert_eq!(verdict, RefundEligibility::NotPaid);
    }

    #[test]
    fn test_already_refunded_rejected() {
        let verdict = check_eligibility(days_ago(1), OffsetDateTime::now_utc(), true, true, false);
        assert_eq!(verdict, RefundEligibility::AlreadyRefunded);
    }

    #[test]
    fn test_disputed_charge_rejected() {
        let verdict = check_eligibility(days_ago(1), OffsetDateTime::now_utc(), true, false, true);
        assert_eq!(verdict, RefundEligibility::Disputed);
    }

    #[test]
    fn test_verdict_reason_names_window() {
        let verdict = RefundEligibility::WindowExpired { days_old: 45 };
        assert!(verdict.reason().contains("45"));
        assert!(verdict.reason().contains("30"));
    }
}
