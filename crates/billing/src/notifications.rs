//! Customer notifications and admin alerts
//!
//! Both are plain insert-only tables read by the dashboard. Writes are best
//! effort: a failed notification must never fail the webhook that produced
//! it, so callers log and continue.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Severity of an admin alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Writes user_notifications and admin_alerts rows
#[derive(Clone)]
pub struct NotificationService {
    pool: PgPool,
}

impl NotificationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Customer-facing notification, shown in the app
    pub async fn notify_customer(
        &self,
        customer_id: &str,
        title: &str,
        body: &str,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO user_notifications (id, customer_id, title, body, read, created_at)
            VALUES ($1, $2, $3, $4, FALSE, NOW())
            "#,
        )
        .bind(id)
        .bind(customer_id)
        .bind(title)
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Operator-facing alert with severity, surfaced on the admin dashboard
    pub async fn alert_admin(
        &self,
        severity: AlertSeverity,
        source: &str,
        message: &str,
        context: serde_json::Value,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO admin_alerts (id, severity, source, message, context, acknowledged, created_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, NOW())
            "#,
        )
        .bind(id)
        .bind(severity.as_str())
        .bind(source)
        .bind(message)
        .bind(context)
        .execute(&self.pool)
        .await?;

        if severity == AlertSeverity::Critical {
            tracing::error!(alert_id = %id, source = %source, message = %message, "Critical admin alert raised");
        }

        Ok(id)
    }
}
