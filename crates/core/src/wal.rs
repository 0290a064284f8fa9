//! Write-ahead-log positions per data source.
//!
//! A job produced while reading from a lagging replica records where each
//! data source's primary was at that moment. Consumers wait until a replica
//! has replayed past these positions before trusting a read.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Parsed WAL position (PostgreSQL LSN, `HI/LO` in hex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalPosition(u64);

impl WalPosition {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let (hi, lo) = raw
            .split_once('/')
            .ok_or_else(|| CoreError::invalid_wal_location(raw))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| CoreError::invalid_wal_location(raw))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| CoreError::invalid_wal_location(raw))?;
        Ok(Self((u64::from(hi) << 32) | u64::from(lo)))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Map of data source name to the latest known WAL position.
///
/// Merging is monotonic: a source is never removed and its position never
/// moves backwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalLocations(BTreeMap<String, String>);

impl WalLocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for producers and tests.
    pub fn with(mut self, source: impl Into<String>, location: impl Into<String>) -> Self {
        self.record(source, location);
        self
    }

    /// Record one position, keeping whichever of old/new is further ahead.
    ///
    /// Returns `true` if the stored position changed.
    pub fn record(&mut self, source: impl Into<String>, location: impl Into<String>) -> bool {
        let source = source.into();
        let location = location.into();

        match self.0.get(&source) {
            None => {
                self.0.insert(source, location);
                true
            }
            Some(current) => {
                let advance = match (WalPosition::parse(current), WalPosition::parse(&location)) {
                    (Ok(current), Ok(incoming)) => incoming > current,
                    // A position we can read always beats one we cannot.
                    (Err(_), Ok(_)) => true,
                    (_, Err(_)) => false,
                };
                if advance {
                    self.0.insert(source, location);
                }
                advance
            }
        }
    }

    /// Union with `other`, per-source maximum.
    ///
    /// Returns `true` if anything changed.
    pub fn merge(&mut self, other: &WalLocations) -> bool {
        let mut changed = false;
        for (source, location) in &other.0 {
            changed |= self.record(source.clone(), location.clone());
        }
        changed
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.0.get(source).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WalLocations {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut locations = Self::new();
        for (source, location) in iter {
            locations.record(source, location);
        }
        locations
    }
}
