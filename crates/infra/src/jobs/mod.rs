//! Reference job queue driving the deduplication hooks.
//!
//! ## Components
//!
//! - `Job`: payload and bookkeeping of one job instance
//! - `JobStore`: queue storage (in-memory here; production queues are external)
//! - `JobClient`: producer side, runs the schedule hook before enqueueing
//! - `JobExecutor`: consumer side, runs the perform hook around handlers

pub mod client;
pub mod executor;
pub mod store;
pub mod types;

pub use client::JobClient;
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{ExecutionContext, Job, JobError, JobResult, JobStatus};
