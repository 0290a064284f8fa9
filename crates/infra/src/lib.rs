//! Infrastructure layer: coordination stores, locks, deduplication
//! middleware and the reference job queue.

pub mod config;
pub mod coordination;
pub mod dedup;
pub mod jobs;
pub mod lock;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_support;
