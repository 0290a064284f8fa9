//! Demo worker: wires the deduplication middleware into the reference queue,
//! pushes a few jobs and runs them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};

use dupguard_core::{Clock, SystemClock};
use dupguard_infra::config::DedupConfig;
use dupguard_infra::coordination::{CoordinationStore, InMemoryCoordinationStore};
use dupguard_infra::dedup::{DedupMiddleware, DedupOptions, ScheduleOutcome};
use dupguard_infra::jobs::{
    InMemoryJobStore, Job, JobClient, JobExecutor, JobExecutorConfig, JobResult, JobStore,
};

#[cfg(feature = "redis")]
fn redis_store() -> anyhow::Result<Option<Arc<dyn CoordinationStore>>> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        return Ok(None);
    };
    let store = dupguard_infra::coordination::RedisCoordinationStore::new(&url)
        .context("failed to open redis coordination store")?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "redis"))]
fn redis_store() -> anyhow::Result<Option<Arc<dyn CoordinationStore>>> {
    Ok(None)
}

fn coordination_store(clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    if let Some(store) = redis_store()? {
        info!("using redis coordination store");
        return Ok(store);
    }

    warn!("REDIS_URL not set or redis support disabled; using in-memory coordination store");
    Ok(Arc::new(InMemoryCoordinationStore::with_clock(clock)))
}

fn main() -> anyhow::Result<()> {
    dupguard_observability::init();

    let config = DedupConfig::from_env().context("invalid deduplication config")?;
    let clock = SystemClock::arc();
    let store = coordination_store(clock.clone())?;

    let mut middleware = DedupMiddleware::new(store, clock, config);
    middleware.register("SendWelcomeEmail", DedupOptions::until_executing())?;
    middleware.register(
        "SyncAccount",
        DedupOptions::until_executed()
            .with_ttl(Duration::from_secs(15 * 60))
            .reschedule_once(),
    )?;
    let middleware = Arc::new(middleware);

    let jobs = InMemoryJobStore::arc();
    let client = JobClient::new(jobs.clone(), middleware.clone());

    let mut executor = JobExecutor::new(jobs.clone(), middleware);
    executor.register_handler("SendWelcomeEmail", |job, _ctx| {
        info!(job_id = %job.id, args = %job.args, "sending welcome email");
        JobResult::Success
    });
    executor.register_handler("SyncAccount", |job, ctx| {
        info!(
            job_id = %job.id,
            args = %job.args,
            wal_sources = ctx.wal_locations().len(),
            "syncing account"
        );
        JobResult::Success
    });

    for _ in 0..2 {
        let outcome = client.push(Job::new("SendWelcomeEmail", json!({"user": 42})))?;
        if let ScheduleOutcome::Dropped { duplicate_of, .. } = &outcome {
            info!(duplicate_of = %duplicate_of, "welcome email already queued");
        }
    }
    for _ in 0..3 {
        client.push(Job::new("SyncAccount", json!({"account": 7})))?;
    }

    let handle = executor
        .spawn(JobExecutorConfig::default().with_name("dupguard-worker"))
        .context("failed to spawn executor")?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while jobs.pending_count()? > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }

    let stats = handle.shutdown();
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        rescheduled = stats.jobs_rescheduled,
        "worker finished"
    );

    Ok(())
}
