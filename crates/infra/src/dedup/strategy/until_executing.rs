//! Key released as soon as execution starts.
//!
//! A new duplicate can be queued while this job is still running; only two
//! queued instances are prevented.

use tracing::debug;

use super::scheduling::DeduplicatesWhenScheduling;
use crate::dedup::options::DedupOptions;
use crate::dedup::DedupRuntime;
use crate::jobs::{ExecutionContext, Job, JobError};

#[derive(Debug, Clone)]
pub struct UntilExecuting {
    base: DeduplicatesWhenScheduling,
}

impl UntilExecuting {
    pub fn new(options: DedupOptions, runtime: DedupRuntime) -> Self {
        Self {
            base: DeduplicatesWhenScheduling::new(options, runtime),
        }
    }

    pub fn base(&self) -> &DeduplicatesWhenScheduling {
        &self.base
    }

    pub fn perform<N>(&self, job: &mut Job, ctx: &mut ExecutionContext, next: N) -> Result<(), JobError>
    where
        N: FnOnce(&mut Job, &ExecutionContext) -> Result<(), JobError>,
    {
        let mut record = self.base.record(job);
        self.base.merge_wal_locations(&mut record, job, ctx);

        if record.delete() {
            debug!(job_id = %job.id, idempotency_key = %record.idempotency_key(), "released key before execution");
        }

        next(job, ctx)
    }
}
