//! Deduplication state of one job instance.
//!
//! A record is built in the schedule hook (to decide whether the job is a
//! duplicate) and again in the perform hook (to release the key). It is
//! never shared across threads; everything that must outlive it lives in the
//! coordination store under keys derived from `storage_key`:
//!
//! - `{storage_key}`: owner job id
//! - `{storage_key}:wal`: latest WAL locations seen for the owner (JSON)
//! - `{storage_key}:deduplicated`: a duplicate was dropped while the owner
//!   held the key
//! - `{storage_key}:wal:lock`: serializes read-merge-write of `:wal`

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use dupguard_core::{JobId, WalLocations};

use super::key::IdempotencyKey;
use super::options::{DedupOptions, StrategyKind};
use super::DedupRuntime;
use crate::jobs::Job;
use crate::lock::ExclusiveLock;

#[derive(Debug)]
pub struct DuplicateJobRecord {
    runtime: DedupRuntime,
    idempotency_key: IdempotencyKey,
    storage_key: String,
    job_id: JobId,
    existing_owner_id: Option<String>,
    strategy: StrategyKind,
    scheduled_at: Option<DateTime<Utc>>,
    reschedulable: bool,
    latest_wal_locations: WalLocations,
    ttl: Duration,
    is_duplicate: Option<bool>,
    owns_entry: bool,
    claimed_now: bool,
}

impl DuplicateJobRecord {
    pub fn new(job: &Job, options: &DedupOptions, runtime: DedupRuntime) -> Self {
        let idempotency_key =
            IdempotencyKey::derive(&job.job_type, &job.args, job.scope.as_deref());
        let storage_key = idempotency_key.storage_key(&runtime.config.namespace);
        let ttl = options.ttl().unwrap_or(runtime.config.default_ttl);

        let mut latest_wal_locations = job.wal_locations.clone();
        latest_wal_locations.merge(&job.dedup_wal_locations);

        Self {
            runtime,
            idempotency_key,
            storage_key,
            job_id: job.id,
            existing_owner_id: None,
            strategy: options.strategy,
            scheduled_at: job.scheduled_at,
            reschedulable: options.reschedulable(),
            latest_wal_locations,
            ttl,
            is_duplicate: None,
            owns_entry: false,
            claimed_now: false,
        }
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn existing_owner_id(&self) -> Option<&str> {
        self.existing_owner_id.as_deref()
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    pub fn reschedulable(&self) -> bool {
        self.reschedulable
    }

    pub fn latest_wal_locations(&self) -> &WalLocations {
        &self.latest_wal_locations
    }

    /// TTL for immediate jobs; the claim expiry may differ for delayed jobs.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `false` until [`check`](Self::check) has decided otherwise.
    pub fn is_duplicate(&self) -> bool {
        self.is_duplicate.unwrap_or(false)
    }

    /// Whether this record created the entry it would release.
    pub fn owns_entry(&self) -> bool {
        self.owns_entry
    }

    /// Whether [`check`](Self::check) created the entry, as opposed to finding
    /// one already written for this job id by an earlier push.
    pub fn claimed_now(&self) -> bool {
        self.claimed_now
    }

    fn wal_key(&self) -> String {
        format!("{}:wal", self.storage_key)
    }

    fn deduplicated_key(&self) -> String {
        format!("{}:deduplicated", self.storage_key)
    }

    /// Try to claim the key for this job, expiring after `expiry`.
    ///
    /// Decides `is_duplicate` once; later calls return the first decision.
    /// Store failures fail open (not a duplicate).
    pub fn check(&mut self, expiry: Duration) -> bool {
        if let Some(decided) = self.is_duplicate {
            return decided;
        }

        let own_id = self.job_id.to_string();
        let duplicate = match self.runtime.store.set_if_absent(&self.storage_key, &own_id, expiry) {
            Ok(true) => {
                self.owns_entry = true;
                self.claimed_now = true;
                self.ttl = expiry;
                self.store_wal_locations(expiry);
                false
            }
            Ok(false) => match self.runtime.store.get(&self.storage_key) {
                Ok(Some(owner)) if owner != own_id => {
                    self.existing_owner_id = Some(owner);
                    true
                }
                // Same job pushed again (e.g. a queue-level retry): still ours.
                Ok(Some(_)) => {
                    self.owns_entry = true;
                    false
                }
                // Owner released between the two calls.
                Ok(None) => false,
                Err(e) => {
                    warn!(
                        idempotency_key = %self.idempotency_key,
                        error = %e,
                        "coordination store unavailable, treating job as unique"
                    );
                    false
                }
            },
            Err(e) => {
                warn!(
                    idempotency_key = %self.idempotency_key,
                    error = %e,
                    "coordination store unavailable, treating job as unique"
                );
                false
            }
        };

        self.is_duplicate = Some(duplicate);
        duplicate
    }

    fn store_wal_locations(&self, ttl: Duration) {
        if self.latest_wal_locations.is_empty() {
            return;
        }
        self.write_wal_locations(&self.latest_wal_locations, ttl);
    }

    fn write_wal_locations(&self, locations: &WalLocations, ttl: Duration) {
        let payload = match serde_json::to_string(locations) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to encode wal locations");
                return;
            }
        };
        if let Err(e) = self.runtime.store.set(&self.wal_key(), &payload, ttl) {
            warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to store wal locations");
        }
    }

    fn read_wal_locations(&self) -> WalLocations {
        match self.runtime.store.get(&self.wal_key()) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(idempotency_key = %self.idempotency_key, error = %e, "ignoring malformed wal locations");
                WalLocations::new()
            }),
            Ok(None) => WalLocations::new(),
            Err(e) => {
                warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to read wal locations");
                WalLocations::new()
            }
        }
    }

    /// Merge this (dropped) job's WAL locations into the owner's.
    ///
    /// Runs under a short lock; proceeds without it if the lock is contended.
    /// Skipped if the owner's entry is already gone.
    pub fn update_latest_wal_locations(&mut self) {
        if self.latest_wal_locations.is_empty() {
            return;
        }

        let owner_ttl = match self.runtime.store.ttl(&self.storage_key) {
            Ok(Some(ttl)) if !ttl.is_zero() => ttl,
            Ok(_) => return,
            Err(e) => {
                warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to read owner ttl");
                return;
            }
        };

        let lock = ExclusiveLock::new(
            self.runtime.store.clone(),
            self.runtime.clock.clone(),
            format!("{}:lock", self.wal_key()),
            self.runtime.config.lock_ttl,
            self.runtime.config.lock_retry.clone(),
        );

        let merged = lock.with_lock_or_proceed(|| {
            let mut merged = self.read_wal_locations();
            if merged.merge(&self.latest_wal_locations) {
                self.write_wal_locations(&merged, owner_ttl);
            }
            merged
        });
        self.latest_wal_locations = merged;
    }

    /// Pull the owner's latest WAL locations from the store into this record.
    pub fn fetch_latest_wal_locations(&mut self) -> &WalLocations {
        let stored = self.read_wal_locations();
        self.latest_wal_locations.merge(&stored);
        &self.latest_wal_locations
    }

    /// Note on the owner's entry that a duplicate was dropped.
    pub fn set_deduplicated_flag(&self) {
        if !self.reschedulable {
            return;
        }

        let ttl = match self.runtime.store.ttl(&self.storage_key) {
            Ok(Some(ttl)) if !ttl.is_zero() => ttl,
            Ok(_) => return,
            Err(e) => {
                warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to read owner ttl");
                return;
            }
        };

        if let Err(e) = self.runtime.store.set_if_absent(&self.deduplicated_key(), "1", ttl) {
            warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to flag deduplication");
        }
    }

    /// A duplicate was dropped while this job held the key and the job type
    /// wants to make up for it.
    pub fn should_reschedule(&self) -> bool {
        if !self.reschedulable {
            return false;
        }

        match self.runtime.store.get(&self.deduplicated_key()) {
            Ok(flag) => flag.is_some(),
            Err(e) => {
                warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to read deduplication flag");
                false
            }
        }
    }

    /// Release the entry if this job still owns it, with its companion keys.
    ///
    /// Returns `true` if an entry was removed.
    pub fn delete(&self) -> bool {
        let own_id = self.job_id.to_string();
        match self.runtime.store.delete_if_equals(&self.storage_key, &own_id) {
            Ok(true) => {
                for key in [self.wal_key(), self.deduplicated_key()] {
                    if let Err(e) = self.runtime.store.delete(&key) {
                        warn!(idempotency_key = %self.idempotency_key, error = %e, "failed to delete companion key");
                    }
                }
                debug!(idempotency_key = %self.idempotency_key, job_id = %self.job_id, "released deduplication key");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(
                    idempotency_key = %self.idempotency_key,
                    job_id = %self.job_id,
                    error = %e,
                    "failed to release deduplication key, it expires with its ttl"
                );
                false
            }
        }
    }

    /// Guard that releases the entry when dropped unless released earlier.
    pub fn release_guard(&self) -> ReleaseGuard<'_> {
        ReleaseGuard {
            record: self,
            armed: true,
        }
    }
}

/// Releases a record's entry on drop, including during unwinding.
#[derive(Debug)]
pub struct ReleaseGuard<'a> {
    record: &'a DuplicateJobRecord,
    armed: bool,
}

impl ReleaseGuard<'_> {
    /// Release now.
    pub fn release(mut self) -> bool {
        self.armed = false;
        self.record.delete()
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.record.delete();
        }
    }
}
