//! Key held until execution finishes: strict single-flight per key.

use tracing::{info, warn};

use super::scheduling::DeduplicatesWhenScheduling;
use crate::dedup::options::DedupOptions;
use crate::dedup::record::DuplicateJobRecord;
use crate::dedup::DedupRuntime;
use crate::jobs::{ExecutionContext, Job, JobError};
use crate::lock::ExclusiveLock;

#[derive(Debug, Clone)]
pub struct UntilExecuted {
    base: DeduplicatesWhenScheduling,
    serialization_lock: bool,
}

impl UntilExecuted {
    pub fn new(options: DedupOptions, runtime: DedupRuntime) -> Self {
        let serialization_lock = runtime.config.serialization_lock;
        Self {
            base: DeduplicatesWhenScheduling::new(options, runtime),
            serialization_lock,
        }
    }

    pub fn base(&self) -> &DeduplicatesWhenScheduling {
        &self.base
    }

    /// Whether performs of this job type run under the serialization lock.
    pub fn uses_serialization_lock(&self) -> bool {
        self.serialization_lock && self.base.options().reschedulable()
    }

    /// Execute, then release the key; re-enqueue once through `requeue` if a
    /// duplicate was dropped meanwhile.
    ///
    /// The key is released even if `next` fails or panics. Rescheduling only
    /// follows a successful run.
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
        let mut record = self.base.record(job);

        if !self.uses_serialization_lock() {
            return self.perform_and_release(&mut record, job, ctx, next, requeue);
        }

        let runtime = self.base.runtime();
        let lock = ExclusiveLock::new(
            runtime.store.clone(),
            runtime.clock.clone(),
            format!("{}:perform:lock", record.storage_key()),
            runtime.config.lock_ttl,
            runtime.config.lock_retry.clone(),
        );
        lock.with_lock_or_proceed(|| self.perform_and_release(&mut record, job, ctx, next, requeue))
    }

    fn perform_and_release<N, R>(
        &self,
        record: &mut DuplicateJobRecord,
        job: &mut Job,
        ctx: &mut ExecutionContext,
        next: N,
        requeue: R,
    ) -> Result<(), JobError>
    where
        N: FnOnce(&mut Job, &ExecutionContext) -> Result<(), JobError>,
        R: FnOnce(Job) -> Result<(), JobError>,
    {
        self.base.merge_wal_locations(record, job, ctx);

        let guard = record.release_guard();
        let result = next(job, ctx);

        let reschedule = result.is_ok() && record.should_reschedule();
        // Release before rescheduling, or the reschedule is deduplicated away.
        guard.release();

        if reschedule {
            let copy = job.reschedule_copy(self.base.runtime().clock.now());
            let copy_id = copy.id;
            match requeue(copy) {
                Ok(()) => info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    rescheduled_job_id = %copy_id,
                    idempotency_key = %record.idempotency_key(),
                    "rescheduled after drop"
                ),
                Err(e) => warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error = %e,
                    "failed to reschedule after drop"
                ),
            }
        }

        result
    }
}
