//! Coordination store: the shared, TTL-capable key-value service used for
//! deduplication entries and short-lived locks.
//!
//! The deduplication layer only needs scalar key ownership:
//!
//! - `set_if_absent` claims a key atomically (single round trip)
//! - `get` / `ttl` inspect the current owner
//! - `delete_if_equals` releases a key only if the caller still owns it
//!
//! Implementations:
//!
//! - `InMemoryCoordinationStore`: process-local, for tests/dev
//! - `RedisCoordinationStore`: Redis-backed (feature `redis`)

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

pub use in_memory::InMemoryCoordinationStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCoordinationStore;

/// Coordination store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store connection error: {0}")]
    Connection(String),
    #[error("coordination store command error: {0}")]
    Command(String),
    #[error("coordination store serialization error: {0}")]
    Serialization(String),
}

/// Key-value contract consumed by the deduplication layer.
///
/// Every write carries a TTL; nothing written through this trait outlives
/// its TTL if the writer crashes.
pub trait CoordinationStore: Send + Sync + std::fmt::Debug {
    /// Create `key` with `value` unless it already exists.
    ///
    /// Returns `true` if this call created the entry.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Unconditionally write `key`.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read the current value of `key`.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remaining lifetime of `key`, `None` if it does not exist.
    fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Remove `key`. Returns `true` if it existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove `key` only if its value equals `expected`.
    ///
    /// Returns `true` if the entry was removed.
    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}

impl<T: CoordinationStore + ?Sized> CoordinationStore for Arc<T> {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        (**self).ttl(key)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).delete_if_equals(key, expected)
    }
}
