//! Bookwell Background Worker
//!
//! Handles scheduled jobs including:
//! - Consultation bill scan (daily at 06:00 UTC)
//! - Monthly invoice consolidation (daily at 06:30 UTC)
//! - Stale checkout session expiry (hourly)
//! - Billing invariant checks (nightly at 02:00 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use bookwell_billing::{BillingService, InvariantChecker};
use bookwell_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Bookwell Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let scheduler = JobScheduler::new().await?;
    let mut jobs = 0;

    // Invariant checks are read-only and need no Stripe credentials
    let checker = InvariantChecker::new(pool.clone());
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running nightly billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Billing invariants hold")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Billing invariant checks (daily at 02:00 UTC)");

    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    match BillingService::from_env(pool.clone()) {
        Ok(billing) => {
            jobs += schedule_billing_jobs(&scheduler, Arc::new(billing)).await?;
        }
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running without billing jobs");
        }
    }

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Bookwell Worker started successfully with {} scheduled jobs", jobs);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

async fn schedule_billing_jobs(
    scheduler: &JobScheduler,
    billing: Arc<BillingService>,
) -> anyhow::Result<usize> {
    // Consultation bills due today: checkout session + bill email per booking
    let runner_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let billing = runner_billing.clone();
            Box::pin(async move {
                let today = OffsetDateTime::now_utc().date();
                info!(date = %today, "Running consultation bill scan");
                match billing.runner.run_due_bills(today).await {
                    Ok(report) => info!(report = ?report, "Consultation bill scan complete"),
                    Err(e) => error!(error = %e, "Consultation bill scan failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Consultation bill scan (daily at 06:00 UTC)");

    let consolidation_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 6 * * *", move |_uuid, _l| {
            let billing = consolidation_billing.clone();
            Box::pin(async move {
                let today = OffsetDateTime::now_utc().date();
                info!(date = %today, "Running monthly invoice consolidation");
                match billing.consolidation.run(today).await {
                    Ok(report) => info!(
                        groups = report.groups,
                        invoices_updated = report.invoices_updated,
                        bills_linked = report.bills_linked,
                        failures = report.failures,
                        emails_sent = report.emails.sent,
                        "Monthly consolidation complete"
                    ),
                    Err(e) => error!(error = %e, "Monthly consolidation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Monthly invoice consolidation (daily at 06:30 UTC)");

    let expiry_billing = billing;
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                match billing.checkout.expire_stale().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired = expired, "Expired stale checkout sessions"),
                    Err(e) => error!(error = %e, "Stale checkout session sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale checkout session expiry (hourly)");

    Ok(3)
}
