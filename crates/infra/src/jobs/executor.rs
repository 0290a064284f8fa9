//! Consumer side of the reference queue: runs the perform hook around
//! registered handlers.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use dupguard_core::Clock;

use crate::dedup::DedupMiddleware;

use super::client::JobClient;
use super::store::JobStore;
use super::types::{ExecutionContext, Job, JobError, JobResult};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job, &ExecutionContext) -> JobResult + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Name for logging and the worker thread
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the loop to finish its job.
    ///
    /// Returns the final statistics.
    pub fn shutdown(mut self) -> ExecutorStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Follow-up runs enqueued because a duplicate was dropped meanwhile
    pub jobs_rescheduled: u64,
    pub uptime_secs: u64,
}

/// What one execution did, beyond its result.
#[derive(Debug)]
struct Execution {
    result: Result<(), JobError>,
    rescheduled: bool,
}

/// Background job executor.
///
/// Claims ready jobs from the store and runs them through the perform hook,
/// with the matching handler as the innermost step. Follow-up runs requested
/// by the hook go back through the client, so they are deduplicated like any
/// other push.
pub struct JobExecutor<S: JobStore> {
    client: JobClient<S>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<String, JobHandler>,
}

impl<S: JobStore> std::fmt::Debug for JobExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("JobExecutor")
            .field("handlers", &patterns)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore + 'static> JobExecutor<S> {
    /// Create a new executor over `store`, sharing the client's middleware.
    pub fn new(store: S, middleware: Arc<DedupMiddleware>) -> Self {
        let clock = middleware.runtime().clock.clone();
        Self {
            client: JobClient::new(store, middleware),
            clock,
            handlers: HashMap::new(),
        }
    }

    pub fn client(&self) -> &JobClient<S> {
        &self.client
    }

    /// Register a handler for a job type pattern.
    ///
    /// Patterns are an exact job type, a `prefix.*` category or `*`.
    pub fn register_handler<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job, &ExecutionContext) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Box::new(handler));
    }

    fn get_handler(&self, job_type: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        // "billing.*" matches "billing.invoice"
        let category = self.handlers.iter().find(|(pattern, _)| {
            pattern
                .strip_suffix(".*")
                .is_some_and(|prefix| {
                    job_type
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('.'))
                })
        });
        if let Some((_, handler)) = category {
            return Some(handler);
        }

        self.handlers.get("*")
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> io::Result<JobExecutorHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                executor_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Execute a single claimed job (for testing or synchronous use).
    pub fn execute_one(&self, job: &mut Job) -> Result<(), JobError> {
        self.execute(job).result
    }

    fn execute(&self, job: &mut Job) -> Execution {
        let handler = self.get_handler(&job.job_type);
        if handler.is_none() {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler for job");
        }

        let mut ctx = ExecutionContext::new();
        ctx.merge_wal_locations(&job.wal_locations);

        let mut rescheduled = false;
        // Unwinding through the hook releases the deduplication key on the way.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.client.middleware().perform(
                job,
                &mut ctx,
                // Without a handler the hook still runs, so the key is released.
                |job, ctx| match handler {
                    Some(handler) => match handler(&*job, ctx) {
                        JobResult::Success => Ok(()),
                        JobResult::Failure(error) => Err(JobError::Failed(error)),
                    },
                    None => Err(JobError::NoHandler(job.job_type.clone())),
                },
                |copy| {
                    let outcome = self.client.push(copy)?;
                    rescheduled = !outcome.is_dropped();
                    Ok(())
                },
            )
        }));

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                error!(job_id = %job.id, job_type = %job.job_type, "job handler panicked");
                Err(JobError::Panicked)
            }
        };

        let finished = self.clock.now();
        match &result {
            Ok(()) => {
                job.mark_completed(finished);
                debug!(job_id = %job.id, "job completed successfully");
            }
            Err(e) => job.mark_failed(e.to_string(), finished),
        }

        let mut result = result;
        if let Err(e) = self.client.store().update(job) {
            error!(job_id = %job.id, error = %e, "failed to record job status");
            if result.is_ok() {
                result = Err(e.into());
            }
        }

        Execution {
            result,
            rescheduled,
        }
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        {
            let mut s = stats.lock().unwrap();
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match executor.client.store().claim_next(executor.clock.now()) {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "claimed job"
                );

                let execution = executor.execute(&mut job);

                {
                    let mut s = stats.lock().unwrap();
                    s.jobs_processed += 1;
                    match execution.result {
                        Ok(()) => s.jobs_succeeded += 1,
                        Err(_) => s.jobs_failed += 1,
                    }
                    if execution.rescheduled {
                        s.jobs_rescheduled += 1;
                    }
                }

                if let Err(e) = execution.result {
                    debug!(
                        executor = %config.name,
                        job_id = %job.id,
                        error = %e,
                        "job execution failed"
                    );
                }
            }
            Ok(None) => {
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                error!(executor = %config.name, error = ?e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
