//! Job storage implementations.
//!
//! The production queue is external; `InMemoryJobStore` is the reference
//! queue the client and executor run against in tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use dupguard_core::JobId;

use super::types::{Job, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Enqueue a new job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Update a job.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest pending job that is ready at `now`.
    /// Returns None if no jobs are available.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Number of jobs still pending.
    fn pending_count(&self) -> Result<usize, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All jobs of a type, oldest first.
    pub fn list_by_type(&self, job_type: &str) -> Vec<Job> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.job_type == job_type)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        result
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();

        // Oldest ready pending job; id breaks ties between same-instant jobs.
        let next = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending) && j.is_ready(now))
            .min_by_key(|j| (j.scheduled_at.unwrap_or(j.created_at), j.id))
            .map(|j| j.id);

        if let Some(job_id) = next {
            if let Some(job) = jobs.get_mut(&job_id) {
                job.mark_running(now);
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    fn pending_count(&self) -> Result<usize, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending))
            .count())
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now)
    }

    fn pending_count(&self) -> Result<usize, JobStoreError> {
        (**self).pending_count()
    }
}
