//! Deduplication strategies.
//!
//! The strategy of a job type is resolved once, at registration, into the
//! closed [`Strategy`] enum. Both deduplicating strategies embed
//! [`DeduplicatesWhenScheduling`] for the schedule hook and only differ in
//! when the perform hook releases the key.

pub mod scheduling;
pub mod until_executed;
pub mod until_executing;

use dupguard_core::JobId;

pub use scheduling::DeduplicatesWhenScheduling;
pub use until_executed::UntilExecuted;
pub use until_executing::UntilExecuting;

use super::options::{DedupOptions, StrategyKind};
use super::DedupRuntime;
use crate::jobs::{ExecutionContext, Job, JobError};

/// What the schedule hook did with a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// Passed to the queue.
    Enqueued(JobId),
    /// Dropped in favour of the job that owns the key.
    Dropped { job: Box<Job>, duplicate_of: String },
}

impl ScheduleOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, ScheduleOutcome::Dropped { .. })
    }
}

#[derive(Debug, Clone)]
pub enum Strategy {
    None,
    UntilExecuting(UntilExecuting),
    UntilExecuted(UntilExecuted),
}

impl Strategy {
    pub fn resolve(options: DedupOptions, runtime: DedupRuntime) -> Self {
        match options.strategy {
            StrategyKind::None => Strategy::None,
            StrategyKind::UntilExecuting => {
                Strategy::UntilExecuting(UntilExecuting::new(options, runtime))
            }
            StrategyKind::UntilExecuted => {
                Strategy::UntilExecuted(UntilExecuted::new(options, runtime))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::None => StrategyKind::None,
            Strategy::UntilExecuting(_) => StrategyKind::UntilExecuting,
            Strategy::UntilExecuted(_) => StrategyKind::UntilExecuted,
        }
    }

    /// Schedule hook. `next` enqueues the job; it is not called for a
    /// dropped duplicate.
    pub fn schedule<N>(&self, job: Job, next: N) -> Result<ScheduleOutcome, JobError>
    where
        N: FnOnce(Job) -> Result<JobId, JobError>,
    {
        match self {
            Strategy::None => next(job).map(ScheduleOutcome::Enqueued),
            Strategy::UntilExecuting(s) => s.base().schedule(job, next),
            Strategy::UntilExecuted(s) => s.base().schedule(job, next),
        }
    }

    /// Perform hook. `next` executes the job; `requeue` enqueues a follow-up
    /// run (through the schedule hook) when the strategy asks for one.
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
        match self {
            Strategy::None => next(job, ctx),
            Strategy::UntilExecuting(s) => s.perform(job, ctx, next),
            Strategy::UntilExecuted(s) => s.perform(job, ctx, next, requeue),
        }
    }
}
