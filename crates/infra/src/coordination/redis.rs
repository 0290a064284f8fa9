//! Redis-backed coordination store.
//!
//! - **Claim**: `SET key value NX PX ttl` (single atomic round trip)
//! - **Release**: Lua compare-and-delete so a process never removes a key it
//!   does not own (e.g. after its own entry expired and someone else claimed it)
//! - **TTL**: `PTTL`, with Redis' `-2` (missing) mapped to `None`
//!
//! One connection is opened per call; callers are short critical sections
//! around job scheduling and execution, not hot loops.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::{CoordinationStore, StoreError};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisCoordinationStore {
    client: Arc<redis::Client>,
}

impl RedisCoordinationStore {
    /// Create a store from a connection URL (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

/// Redis rejects `PX 0`; anything shorter than a millisecond becomes one.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl CoordinationStore for RedisCoordinationStore {
    #[instrument(skip(self, value), err)]
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("SET NX failed: {}", e)))?;

        Ok(reply.is_some())
    }

    #[instrument(skip(self, value), err)]
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection()?;

        let _: String = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("SET failed: {}", e)))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;

        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("GET failed: {}", e)))
    }

    #[instrument(skip(self), err)]
    fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection()?;

        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("PTTL failed: {}", e)))?;

        // -2: missing, -1: no expiry (never written by this crate)
        Ok(match millis {
            -2 => None,
            -1 => Some(Duration::MAX),
            ms => Some(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    #[instrument(skip(self), err)]
    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;

        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("DEL failed: {}", e)))?;

        Ok(removed > 0)
    }

    #[instrument(skip(self, expected), err)]
    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;

        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke(&mut conn)
            .map_err(|e| StoreError::Command(format!("compare-and-delete failed: {}", e)))?;

        Ok(removed > 0)
    }
}
