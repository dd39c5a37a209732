//! Per-event webhook context
//!
//! Built fresh for every delivery before dispatch. Carries the ids a handler
//! needs without re-walking the event payload, plus a free-form metadata bag
//! that ends up on the audit row.

use std::collections::HashMap;

use stripe::{Event, EventObject, Expandable};
use time::OffsetDateTime;

/// Identifiers derived from a single Stripe webhook event
#[derive(Debug, Clone)]
pub struct EdgeCaseContext {
    pub event_id: String,
    pub event_type: String,
    /// Stripe-reported creation time of the event, used for temporal ordering
    pub event_created: OffsetDateTime,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    pub charge_id: Option<String>,
    pub dispute_id: Option<String>,
    /// Metadata copied from the event object, if any
    pub metadata: HashMap<String, String>,
}

fn expandable_id<T: stripe::Object>(e: &Expandable<T>) -> String
where
    T::Id: ToString,
{
    match e {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(obj) => obj.id().to_string(),
    }
}

impl EdgeCaseContext {
    /// Derive the context from a verified event
    pub fn from_event(event: &Event) -> Self {
        let mut ctx = Self {
            event_id: event.id.to_string(),
            event_type: event.type_.to_string(),
            event_created: OffsetDateTime::from_unix_timestamp(event.created)
                .unwrap_or_else(|_| OffsetDateTime::now_utc()),
            customer_id: None,
            subscription_id: None,
            invoice_id: None,
            charge_id: None,
            dispute_id: None,
            metadata: HashMap::new(),
        };

        match &event.data.object {
            EventObject::Invoice(invoice) => {
                ctx.invoice_id = Some(invoice.id.to_string());
                ctx.customer_id = invoice.customer.as_ref().map(expandable_id);
                ctx.subscription_id = invoice.subscription.as_ref().map(expandable_id);
                ctx.charge_id = invoice.charge.as_ref().map(expandable_id);
            }
            EventObject::Subscription(subscription) => {
                ctx.subscription_id = Some(subscription.id.to_string());
                ctx.customer_id = Some(expandable_id(&subscription.customer));
                ctx.metadata = subscription.metadata.clone();
            }
            EventObject::Charge(charge) => {
                ctx.charge_id = Some(charge.id.to_string());
                ctx.customer_id = charge.customer.as_ref().map(expandable_id);
                ctx.invoice_id = charge.invoice.as_ref().map(expandable_id);
                ctx.metadata = charge.metadata.clone();
            }
            EventObject::Dispute(dispute) => {
                ctx.dispute_id = Some(dispute.id.to_string());
                ctx.charge_id = Some(expandable_id(&dispute.charge));
            }
            EventObject::PaymentMethod(pm) => {
                ctx.customer_id = pm.customer.as_ref().map(expandable_id);
            }
            EventObject::SetupIntent(si) => {
                ctx.customer_id = si.customer.as_ref().map(expandable_id);
            }
            _ => {}
        }

        ctx
    }

    /// Serialize the derived ids for the audit row
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "customer_id": self.customer_id,
            "subscription_id": self.subscription_id,
            "invoice_id": self.invoice_id,
            "charge_id": self.charge_id,
            "dispute_id": self.dispute_id,
            "metadata": self.metadata,
        })
    }
}
