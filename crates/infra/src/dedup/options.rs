//! Per-job-type deduplication options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Which deduplication strategy a job type uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// No deduplication
    None,
    /// Key released when execution starts
    #[default]
    UntilExecuting,
    /// Key released when execution finishes
    UntilExecuted,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::None => "none",
            StrategyKind::UntilExecuting => "until_executing",
            StrategyKind::UntilExecuted => "until_executed",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the owner after a duplicate was dropped while it held
/// the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfDeduplicated {
    /// Nothing; the dropped duplicate is gone.
    #[default]
    Drop,
    /// Run the job once more after the owner finishes (UntilExecuted only).
    RescheduleOnce,
}

/// Deduplication options of one job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupOptions {
    pub strategy: StrategyKind,
    /// Overrides the global default TTL for immediate jobs.
    pub ttl_secs: Option<u64>,
    /// Also deduplicate jobs scheduled for a future time.
    pub including_scheduled: bool,
    /// Whether dropping a duplicate is safe because the owner's run fully
    /// covers its effect.
    pub idempotent: bool,
    pub if_deduplicated: IfDeduplicated,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            ttl_secs: None,
            including_scheduled: false,
            idempotent: true,
            if_deduplicated: IfDeduplicated::default(),
        }
    }
}

impl DedupOptions {
    pub fn none() -> Self {
        Self {
            strategy: StrategyKind::None,
            ..Default::default()
        }
    }

    pub fn until_executing() -> Self {
        Self {
            strategy: StrategyKind::UntilExecuting,
            ..Default::default()
        }
    }

    pub fn until_executed() -> Self {
        Self {
            strategy: StrategyKind::UntilExecuted,
            ..Default::default()
        }
    }

    /// Stored as whole seconds; a sub-second remainder rounds up.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0));
        self
    }

    pub fn including_scheduled(mut self) -> Self {
        self.including_scheduled = true;
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn reschedule_once(mut self) -> Self {
        self.if_deduplicated = IfDeduplicated::RescheduleOnce;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    /// Whether a dropped duplicate should cause one more run of the owner.
    pub fn reschedulable(&self) -> bool {
        self.strategy == StrategyKind::UntilExecuted
            && self.if_deduplicated == IfDeduplicated::RescheduleOnce
    }

    /// Reject combinations that cannot be honoured.
    pub fn validate(&self, job_type: &str) -> Result<(), ConfigError> {
        if self.if_deduplicated == IfDeduplicated::RescheduleOnce
            && self.strategy != StrategyKind::UntilExecuted
        {
            return Err(ConfigError::InvalidOptions {
                job_type: job_type.to_string(),
                reason: format!(
                    "reschedule_once requires until_executed, got {}",
                    self.strategy
                ),
            });
        }
        if self.ttl_secs == Some(0) {
            return Err(ConfigError::InvalidOptions {
                job_type: job_type.to_string(),
                reason: "ttl_secs must be positive".to_string(),
            });
        }
        Ok(())
    }
}
