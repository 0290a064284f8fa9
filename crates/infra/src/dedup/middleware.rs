//! Registry of deduplication strategies per job type.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use dupguard_core::{Clock, JobId};

use super::options::DedupOptions;
use super::strategy::{ScheduleOutcome, Strategy};
use super::DedupRuntime;
use crate::config::{ConfigError, DedupConfig};
use crate::coordination::CoordinationStore;
use crate::jobs::{ExecutionContext, Job, JobError};

static PASS_THROUGH: Strategy = Strategy::None;

/// Schedule/perform middleware for a job system.
///
/// Register job types during setup, then share it (e.g. in an `Arc`) between
/// the producer client and the workers.
#[derive(Debug)]
pub struct DedupMiddleware {
    runtime: DedupRuntime,
    strategies: HashMap<String, Strategy>,
}

impl DedupMiddleware {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: DedupConfig,
    ) -> Self {
        Self {
            runtime: DedupRuntime::new(store, clock, config),
            strategies: HashMap::new(),
        }
    }

    pub fn runtime(&self) -> &DedupRuntime {
        &self.runtime
    }

    /// Resolve and remember the strategy of a job type.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        options: DedupOptions,
    ) -> Result<(), ConfigError> {
        let job_type = job_type.into();
        options.validate(&job_type)?;

        info!(
            job_type = %job_type,
            strategy = %options.strategy,
            idempotent = options.idempotent,
            including_scheduled = options.including_scheduled,
            reschedulable = options.reschedulable(),
            "registered deduplication strategy"
        );

        let strategy = Strategy::resolve(options, self.runtime.clone());
        self.strategies.insert(job_type, strategy);
        Ok(())
    }

    /// Strategy of a job type; unregistered types pass straight through.
    pub fn strategy_for(&self, job_type: &str) -> &Strategy {
        self.strategies.get(job_type).unwrap_or(&PASS_THROUGH)
    }

    pub fn schedule<N>(&self, job: Job, next: N) -> Result<ScheduleOutcome, JobError>
    where
        N: FnOnce(Job) -> Result<JobId, JobError>,
    {
        self.strategy_for(&job.job_type).schedule(job, next)
    }

    pub fn perform<N, R>(
        &self,
        job: &mut Job,
        ctx: &mut ExecutionContext,
        next: N,
        requeue: R,
    ) -> Result<(), JobError>
    where
        N: FnOnce(&mut Job, &ExecutionContext) -> Result<(), JobError>,
        R: FnOnce(Job) -> Result<(), JobError>,
    {
        let strategy = self.strategy_for(&job.job_type);
        strategy.perform(job, ctx, next, requeue)
    }
}
