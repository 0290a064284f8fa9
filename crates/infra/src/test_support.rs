//! Shared fixtures for unit and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::coordination::{CoordinationStore, InMemoryCoordinationStore, StoreError};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Coordination store whose every call fails with the same error.
#[derive(Debug)]
pub struct FailingStore {
    error: StoreError,
    calls: AtomicUsize,
}

impl FailingStore {
    pub fn new(error: StoreError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

impl CoordinationStore for FailingStore {
    fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, StoreError> {
        self.fail()
    }

    fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        self.fail()
    }

    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        self.fail()
    }

    fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        self.fail()
    }

    fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        self.fail()
    }

    fn delete_if_equals(&self, _key: &str, _expected: &str) -> Result<bool, StoreError> {
        self.fail()
    }
}

/// In-memory store that remembers the TTL of every `set_if_absent` call.
#[derive(Debug)]
pub struct RecordingStore {
    inner: Arc<InMemoryCoordinationStore>,
    claims: Mutex<Vec<(String, Duration)>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<InMemoryCoordinationStore>) -> Self {
        Self {
            inner,
            claims: Mutex::new(Vec::new()),
        }
    }

    /// `(key, ttl)` of every claim attempt, in call order.
    pub fn claims(&self) -> Vec<(String, Duration)> {
        self.claims.lock().unwrap().clone()
    }
}

impl CoordinationStore for RecordingStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.claims.lock().unwrap().push((key.to_string(), ttl));
        self.inner.set_if_absent(key, value, ttl)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.inner.ttl(key)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.inner.delete_if_equals(key, expected)
    }
}
