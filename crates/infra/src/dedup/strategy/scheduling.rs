//! Schedule-time deduplication shared by `UntilExecuting` and `UntilExecuted`.

use std::time::Duration;

use tracing::{debug, info, warn};

use dupguard_core::JobId;

use super::ScheduleOutcome;
use crate::dedup::options::DedupOptions;
use crate::dedup::record::DuplicateJobRecord;
use crate::dedup::DedupRuntime;
use crate::jobs::{ExecutionContext, Job, JobError};

#[derive(Debug, Clone)]
pub struct DeduplicatesWhenScheduling {
    options: DedupOptions,
    runtime: DedupRuntime,
}

impl DeduplicatesWhenScheduling {
    pub fn new(options: DedupOptions, runtime: DedupRuntime) -> Self {
        Self { options, runtime }
    }

    pub fn options(&self) -> &DedupOptions {
        &self.options
    }

    pub fn runtime(&self) -> &DedupRuntime {
        &self.runtime
    }

    pub fn record(&self, job: &Job) -> DuplicateJobRecord {
        DuplicateJobRecord::new(job, &self.options, self.runtime.clone())
    }

    /// Delayed jobs are only deduplicated when the options allow it.
    pub fn deduplicatable(&self, job: &Job) -> bool {
        !job.is_scheduled() || self.options.including_scheduled
    }

    /// Lifetime of the claim: until the run time for jobs delayed into the
    /// future, the TTL otherwise.
    pub fn expiry(&self, record: &DuplicateJobRecord) -> Duration {
        let now = self.runtime.clock.now();
        match record.scheduled_at() {
            Some(at) if at > now => (at - now).to_std().unwrap_or(Duration::ZERO),
            _ => record.ttl(),
        }
    }

    pub fn schedule<N>(&self, mut job: Job, next: N) -> Result<ScheduleOutcome, JobError>
    where
        N: FnOnce(Job) -> Result<JobId, JobError>,
    {
        if !self.deduplicatable(&job) {
            return next(job).map(ScheduleOutcome::Enqueued);
        }

        let mut record = self.record(&job);
        let expiry = self.expiry(&record);

        if record.check(expiry) {
            if let Some(owner) = record.existing_owner_id().map(str::to_string) {
                job.duplicate_of = Some(owner.clone());

                if self.options.idempotent {
                    record.update_latest_wal_locations();
                    info!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        duplicate_of = %owner,
                        idempotency_key = %record.idempotency_key(),
                        strategy = %record.strategy(),
                        "dropped duplicate job"
                    );
                } else {
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        duplicate_of = %owner,
                        idempotency_key = %record.idempotency_key(),
                        strategy = %record.strategy(),
                        "dropped duplicate of a non-idempotent job type"
                    );
                }
                record.set_deduplicated_flag();

                return Ok(ScheduleOutcome::Dropped {
                    job: Box::new(job),
                    duplicate_of: owner,
                });
            }
        }

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            idempotency_key = %record.idempotency_key(),
            expiry_secs = expiry.as_secs(),
            "claimed deduplication key"
        );

        match next(job) {
            Ok(id) => Ok(ScheduleOutcome::Enqueued(id)),
            Err(e) => {
                // Never enqueued, so nothing would ever release the claim. An
                // entry left by an earlier push of this job still belongs to it.
                if record.claimed_now() {
                    record.delete();
                }
                Err(e)
            }
        }
    }

    /// Perform-time step common to both strategies: make the owner's latest
    /// WAL locations visible to the job and its execution context.
    pub fn merge_wal_locations(
        &self,
        record: &mut DuplicateJobRecord,
        job: &mut Job,
        ctx: &mut ExecutionContext,
    ) {
        let latest = record.fetch_latest_wal_locations();
        job.dedup_wal_locations.merge(latest);
        ctx.merge_wal_locations(&job.dedup_wal_locations);
    }
}
