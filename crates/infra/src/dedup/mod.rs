//! Duplicate-job deduplication.
//!
//! ## Design
//!
//! - A job's identity is its [`IdempotencyKey`] (type + canonical args + scope)
//! - The key is claimed in the coordination store when the job is scheduled;
//!   a failed claim means an equivalent job is already queued or running
//! - The strategy decides when the claim is released: when execution starts
//!   (`UntilExecuting`) or when it ends (`UntilExecuted`)
//! - Dropped duplicates hand their WAL locations to the owner so the owner's
//!   run does not read older state than the dropped job would have
//! - Every store failure fails open: a job is never lost because the
//!   coordination store is down
//!
//! ## Components
//!
//! - `IdempotencyKey`: job fingerprint
//! - `DuplicateJobRecord`: per-job deduplication state
//! - `Strategy`: schedule/perform hooks per strategy
//! - `DedupMiddleware`: strategy registry by job type

pub mod key;
pub mod middleware;
pub mod options;
pub mod record;
pub mod strategy;

use std::sync::Arc;

use dupguard_core::Clock;

use crate::config::DedupConfig;
use crate::coordination::CoordinationStore;

pub use key::IdempotencyKey;
pub use middleware::DedupMiddleware;
pub use options::{DedupOptions, IfDeduplicated, StrategyKind};
pub use record::DuplicateJobRecord;
pub use strategy::{ScheduleOutcome, Strategy};

/// Shared collaborators of every strategy and record.
#[derive(Debug, Clone)]
pub struct DedupRuntime {
    pub store: Arc<dyn CoordinationStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<DedupConfig>,
}

impl DedupRuntime {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        config: DedupConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config: Arc::new(config),
        }
    }
}
