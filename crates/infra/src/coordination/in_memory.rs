//! In-memory coordination store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use dupguard_core::{Clock, SystemClock};

use super::{CoordinationStore, StoreError};

/// Writes between full sweeps of expired entries.
const SWEEP_INTERVAL: usize = 64;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Process-local store with TTL expiry evaluated against a [`Clock`].
///
/// Expired entries are dropped on access, and every [`SWEEP_INTERVAL`]
/// writes all of them are swept so keys nobody reads again do not pile up.
#[derive(Debug)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::arc())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[cfg(test)]
    fn stored_len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a Entry> {
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        entries.get(key)
    }

    fn insert(
        &self,
        entries: &mut HashMap<String, Entry>,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            entries.retain(|_, e| e.expires_at > now);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::expiry(now, ttl),
            },
        );
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        self.insert(&mut entries, key, value, ttl, now);
        Ok(true)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        self.insert(&mut entries, key, value, ttl, now);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live(&mut entries, key, now).map(|e| e.value.clone()))
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live(&mut entries, key, now)
            .map(|e| (e.expires_at - now).to_std().unwrap_or(Duration::ZERO)))
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        let existed = Self::live(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        let owned = Self::live(&mut entries, key, now).is_some_and(|e| e.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }
}
