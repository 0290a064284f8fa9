//! Configuration loading and representation.
//!
//! Global settings come from the environment; per-job-type settings are
//! [`DedupOptions`](crate::dedup::DedupOptions) supplied at registration.

use std::str::FromStr;
use std::time::Duration;

use crate::lock::LockRetryPolicy;

/// Default lifetime of a deduplication entry for immediate jobs.
pub const DEFAULT_DUPLICATE_KEY_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "dupguard";

/// Default lifetime of short critical-section locks.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid deduplication options for {job_type}: {reason}")]
    InvalidOptions { job_type: String, reason: String },
}

/// Global deduplication settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupConfig {
    /// Prefix of every key written to the coordination store.
    pub namespace: String,
    /// TTL for immediate jobs without a per-type override.
    pub default_ttl: Duration,
    /// Take a serialization lock around reschedulable UntilExecuted performs.
    pub serialization_lock: bool,
    /// TTL of the WAL and serialization locks.
    pub lock_ttl: Duration,
    /// Acquisition retries for those locks.
    pub lock_retry: LockRetryPolicy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_ttl: DEFAULT_DUPLICATE_KEY_TTL,
            serialization_lock: false,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_retry: LockRetryPolicy::default(),
        }
    }
}

impl DedupConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_serialization_lock(mut self, enabled: bool) -> Self {
        self.serialization_lock = enabled;
        self
    }

    pub fn with_lock_retry(mut self, retry: LockRetryPolicy) -> Self {
        self.lock_retry = retry;
        self
    }

    /// Load from the process environment, falling back to defaults.
    ///
    /// - `DUPGUARD_NAMESPACE`
    /// - `DUPGUARD_DEFAULT_TTL_SECS`
    /// - `DUPGUARD_SERIALIZATION_LOCK` (`true`/`false`/`1`/`0`)
    /// - `DUPGUARD_LOCK_TTL_MS`
    /// - `DUPGUARD_LOCK_MAX_RETRIES`
    /// - `DUPGUARD_LOCK_RETRY_DELAY_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup (tests, layered config).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(namespace) = lookup("DUPGUARD_NAMESPACE").filter(|s| !s.is_empty()) {
            config.namespace = namespace;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "DUPGUARD_DEFAULT_TTL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::InvalidEnv {
                    name: "DUPGUARD_DEFAULT_TTL_SECS",
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("DUPGUARD_SERIALIZATION_LOCK") {
            config.serialization_lock = parse_bool("DUPGUARD_SERIALIZATION_LOCK", &raw)?;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "DUPGUARD_LOCK_TTL_MS")? {
            config.lock_ttl = Duration::from_millis(ms);
        }
        if let Some(retries) = parse::<u32, _>(&lookup, "DUPGUARD_LOCK_MAX_RETRIES")? {
            config.lock_retry.max_retries = retries;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "DUPGUARD_LOCK_RETRY_DELAY_MS")? {
            config.lock_retry.retry_delay = Duration::from_millis(ms);
            config.lock_retry.max_delay = config.lock_retry.max_delay.max(config.lock_retry.retry_delay);
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
