//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dupguard_core::{JobId, WalLocations};

use super::store::JobStoreError;

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Failed; retrying is the queue's business
    Failed { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Job type, used for handler routing and as part of the idempotency key
    pub job_type: String,
    /// JSON arguments
    pub args: serde_json::Value,
    /// Optional caller-supplied deduplication scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Execution attempts so far
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the job should run (delayed jobs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// WAL positions the producer observed when enqueuing
    #[serde(default, skip_serializing_if = "WalLocations::is_empty")]
    pub wal_locations: WalLocations,
    /// Set on a dropped duplicate: id of the job that owns the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    /// WAL positions accumulated from duplicates dropped in favour of this job
    #[serde(default, skip_serializing_if = "WalLocations::is_empty")]
    pub dedup_wal_locations: WalLocations,
}

impl Job {
    /// Create a new job.
    pub fn new(job_type: impl Into<String>, args: serde_json::Value) -> Self {
        Self::new_at(job_type, args, Utc::now())
    }

    /// Create a new job with an explicit creation time.
    pub fn new_at(job_type: impl Into<String>, args: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            args,
            scope: None,
            status: JobStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            wal_locations: WalLocations::new(),
            duplicate_of: None,
            dedup_wal_locations: WalLocations::new(),
        }
    }

    /// Narrow deduplication to a caller-defined scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Attach the producer's WAL positions.
    pub fn with_wal_locations(mut self, locations: WalLocations) -> Self {
        self.wal_locations = locations;
        self
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled_at.is_some()
    }

    /// Check if the job is ready to execute at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Equivalent job to run again after the fact: same type, arguments and
    /// scope, fresh id, not delayed.
    pub fn reschedule_copy(&self, now: DateTime<Utc>) -> Self {
        let mut job = Self::new_at(self.job_type.clone(), self.args.clone(), now);
        job.scope = self.scope.clone();
        job
    }

    /// Mark job as running.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.updated_at = now;
    }

    /// Mark job as failed.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed { error };
        self.updated_at = now;
    }
}

/// Result returned by job handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed with an error
    Failure(String),
}

/// State handed to a handler for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    wal_locations: WalLocations,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions a replica must have replayed before its reads can be trusted.
    pub fn wal_locations(&self) -> &WalLocations {
        &self.wal_locations
    }

    pub fn merge_wal_locations(&mut self, locations: &WalLocations) {
        self.wal_locations.merge(locations);
    }
}

/// Errors surfaced by scheduling or performing a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error("no handler for job type: {0}")]
    NoHandler(String),
    #[error("job handler panicked")]
    Panicked,
    #[error(transparent)]
    Store(#[from] JobStoreError),
}
