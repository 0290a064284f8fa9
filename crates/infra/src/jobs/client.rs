//! Producer side of the reference queue.

use std::sync::Arc;

use tracing::debug;

use crate::dedup::{DedupMiddleware, ScheduleOutcome};

use super::store::JobStore;
use super::types::{Job, JobError};

/// Pushes jobs through the schedule hook into a store.
#[derive(Debug, Clone)]
pub struct JobClient<S: JobStore> {
    store: S,
    middleware: Arc<DedupMiddleware>,
}

impl<S: JobStore> JobClient<S> {
    pub fn new(store: S, middleware: Arc<DedupMiddleware>) -> Self {
        Self { store, middleware }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn middleware(&self) -> &Arc<DedupMiddleware> {
        &self.middleware
    }

    /// Enqueue `job` unless the schedule hook drops it as a duplicate.
    pub fn push(&self, job: Job) -> Result<ScheduleOutcome, JobError> {
        let outcome = self.middleware.schedule(job, |job| {
            debug!(job_id = %job.id, job_type = %job.job_type, "enqueueing job");
            Ok(self.store.enqueue(job)?)
        })?;
        Ok(outcome)
    }
}
