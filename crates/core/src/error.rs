//! Core error model.

use thiserror::Error;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Deterministic failures of pure values (parsing). Store and transport
/// failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A WAL position could not be parsed.
    #[error("invalid wal location: {0}")]
    InvalidWalLocation(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_wal_location(msg: impl Into<String>) -> Self {
        Self::InvalidWalLocation(msg.into())
    }
}
