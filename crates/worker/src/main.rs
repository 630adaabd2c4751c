//! Netpass Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription invariant sweep (hourly)
//! - Failed webhook event replay (every 15 minutes)
//! - Health check heartbeat (every 5 minutes)
//!
//! The reconciler's three writes are deliberately not one transaction, so
//! this worker is the out-of-band repair path: replay converges diverged
//! projections and the invariant sweep makes any remaining divergence loud.

use std::sync::Arc;

use anyhow::Context;
use netpass_billing::{BillingService, InvariantChecker, ViolationSeverity};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// How many errored events one replay pass will pick up.
const REPLAY_BATCH_SIZE: i64 = 100;

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    netpass_shared::create_pool(&database_url).await
}

/// Log an invariant sweep's findings at a severity-appropriate level.
fn log_sweep_results(summary: &netpass_billing::InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Invariant sweep complete - all checks passed"
        );
        return;
    }

    info!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Invariant sweep found violations"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => {
                error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    emails = ?violation.emails,
                    "{}",
                    violation.description
                );
            }
            ViolationSeverity::Medium | ViolationSeverity::Low => {
                warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    "{}",
                    violation.description
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Netpass Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Billing service is optional: the invariant sweep only needs the pool,
    // so a worker without gateway credentials still runs in reduced mode.
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Some(Arc::new(b)),
        Err(e) => {
            warn!(error = %e, "Billing service unavailable - replay job disabled");
            None
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Invariant sweep (hourly)
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let pool = sweep_pool.clone();
            Box::pin(async move {
                info!("Running subscription invariant sweep");
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) => log_sweep_results(&summary),
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant sweep (hourly)");

    // Job 2: Replay failed webhook events (every 15 minutes)
    if let Some(billing) = billing {
        scheduler
            .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
                let billing = billing.clone();
                Box::pin(async move {
                    let result = billing.webhooks.replay_failed_events(REPLAY_BATCH_SIZE).await;
                    if result.attempted > 0 {
                        info!(
                            attempted = result.attempted,
                            recovered = result.recovered,
                            still_failing = result.still_failing,
                            "Failed webhook event replay complete"
                        );
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Failed webhook event replay (every 15 minutes)");
    }

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
