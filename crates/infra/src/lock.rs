//! Exclusive lock over the coordination store.
//!
//! Used for short critical sections (WAL propagation, the optional perform
//! serialization lock), never for the deduplication window itself. Callers
//! decide what to do when the lock cannot be taken; the deduplication layer
//! always fails open.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use dupguard_core::{Clock, LockToken};

use crate::coordination::CoordinationStore;

/// Backoff strategy between acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Retry policy for lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRetryPolicy {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Base delay between attempts
    pub retry_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub backoff: BackoffStrategy,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self::fixed(10, Duration::from_millis(100))
    }
}

impl LockRetryPolicy {
    /// Create a policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay: delay,
            max_delay: delay,
            backoff: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay: base_delay,
            max_delay,
            backoff: BackoffStrategy::Exponential,
        }
    }

    /// Delay to sleep before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.retry_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.retry_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.retry_delay.saturating_mul(retry),
        };

        match self.backoff {
            BackoffStrategy::Fixed => delay,
            _ => delay.min(self.max_delay),
        }
    }

    /// Upper bound on time spent sleeping while acquiring.
    pub fn max_total_wait(&self) -> Duration {
        (1..=self.max_retries)
            .map(|retry| self.delay_for_retry(retry))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// A named lock in the coordination store.
#[derive(Debug, Clone)]
pub struct ExclusiveLock {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    key: String,
    ttl: Duration,
    retry: LockRetryPolicy,
}

/// Held lock; released (compare-and-delete on the token) when dropped.
#[derive(Debug)]
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: LockToken,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let token = self.token.to_string();
        match self.store.delete_if_equals(&self.key, &token) {
            Ok(true) => debug!(lock_key = %self.key, "lock released"),
            Ok(false) => warn!(lock_key = %self.key, "lock expired before release"),
            Err(e) => warn!(lock_key = %self.key, error = %e, "failed to release lock"),
        }
    }
}

impl ExclusiveLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        ttl: Duration,
        retry: LockRetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            key: key.into(),
            ttl,
            retry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take the lock, retrying per the policy.
    ///
    /// Store errors count as a failed attempt. Returns `None` once retries are
    /// exhausted.
    pub fn acquire(&self) -> Option<LockGuard> {
        let token = LockToken::new();
        let value = token.to_string();

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                self.clock.sleep(self.retry.delay_for_retry(attempt));
            }

            match self.store.set_if_absent(&self.key, &value, self.ttl) {
                Ok(true) => {
                    debug!(lock_key = %self.key, attempt, "lock acquired");
                    return Some(LockGuard {
                        store: self.store.clone(),
                        key: self.key.clone(),
                        token,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(lock_key = %self.key, attempt, error = %e, "lock attempt failed");
                }
            }
        }

        None
    }

    /// Run `body` while holding the lock.
    ///
    /// Returns `None` without running `body` if the lock could not be taken.
    pub fn with_lock<T>(&self, body: impl FnOnce() -> T) -> Option<T> {
        let _guard = self.acquire()?;
        Some(body())
    }

    /// Run `body` holding the lock if possible, without it otherwise.
    pub fn with_lock_or_proceed<T>(&self, body: impl FnOnce() -> T) -> T {
        match self.acquire() {
            Some(_guard) => body(),
            None => {
                warn!(
                    lock_key = %self.key,
                    attempts = self.retry.max_retries + 1,
                    "lock not acquired, proceeding without it"
                );
                body()
            }
        }
    }
}
