#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! QuoteKit Background Worker
//!
//! Handles scheduled jobs including:
//! - Follow-up queue processing: payment retries, dispute escalations (every minute)
//! - Dispute evidence deadline alerts (hourly)
//! - Stuck claim recovery: stale queue claims and interrupted replays (hourly)
//! - Processed webhook event cleanup (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

mod follow_up_processor;

use std::sync::Arc;
use std::time::Duration;

use quotekit_billing::{AlertSeverity, BillingService};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Evidence deadlines within this horizon raise an alert
const DISPUTE_DEADLINE_HORIZON_HOURS: i64 = 48;

/// Processed webhook events older than this are pruned
const EVENT_RETENTION_DAYS: i64 = 90;

/// Queue claims in 'running' longer than this belong to a crashed worker
const STALE_CLAIM_TIMEOUT_MINUTES: i64 = 30;

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting QuoteKit billing worker");

    let pool = create_db_pool().await?;
    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Process the follow-up queue (every minute)
    let queue_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = queue_billing.clone();
            Box::pin(async move {
                follow_up_processor::process_follow_up_queue(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Follow-up queue processing (every minute)");

    // Job 2: Dispute evidence deadline alerts (hourly)
    let deadline_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = deadline_billing.clone();
            Box::pin(async move {
                info!("Checking dispute evidence deadlines");

                let near = match billing
                    .disputes
                    .disputes_near_deadline(DISPUTE_DEADLINE_HORIZON_HOURS)
                    .await
                {
                    Ok(near) => near,
                    Err(e) => {
                        error!(error = %e, "Dispute deadline check failed");
                        return;
                    }
                };

                for (dispute_id, customer_id, due_by) in near {
                    if let Err(e) = billing
                        .notifications
                        .alert_admin(
                            AlertSeverity::Warning,
                            "dispute_deadline",
                            &format!(
                                "Dispute {} evidence is due at {} and still needs a response",
                                dispute_id, due_by
                            ),
                            serde_json::json!({
                                "dispute_id": dispute_id,
                                "customer_id": customer_id,
                                "evidence_due_by": due_by.to_string(),
                            }),
                        )
                        .await
                    {
                        error!(
                            dispute_id = %dispute_id,
                            error = %e,
                            "Failed to write dispute deadline alert"
                        );
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dispute deadline alerts (hourly)");

    // Job 3: Recover stuck claims (hourly, offset from the deadline job)
    let recovery_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let billing = recovery_billing.clone();
            Box::pin(async move {
                match billing.queue.requeue_stale(STALE_CLAIM_TIMEOUT_MINUTES).await {
                    Ok(requeued) if requeued > 0 => {
                        info!(requeued = requeued, "Requeued stale follow-up claims")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Stale follow-up recovery failed"),
                }

                match billing.coordinator.reset_stuck_replays().await {
                    Ok(reset) if reset > 0 => {
                        info!(reset = reset, "Reset interrupted event replays")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Stuck replay reset failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck claim recovery (hourly)");

    // Job 4: Prune processed webhook events (daily at 3:00 AM UTC)
    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                info!("Running webhook event cleanup");
                match billing.coordinator.prune_events(EVENT_RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Webhook event cleanup complete"),
                    Err(e) => error!(error = %e, "Webhook event cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event cleanup (daily at 3:00 AM UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("QuoteKit worker started successfully with 5 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
