//! `dupguard-core`: building blocks shared by the deduplication layer.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the time source abstraction and WAL position bookkeeping.

pub mod clock;
pub mod error;
pub mod id;
pub mod wal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, LockToken};
pub use wal::{WalLocations, WalPosition};
