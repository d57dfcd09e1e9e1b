//! Unified error types for the vending supervisor.
//!
//! Every caller-invoked operation funnels into [`Error`].  Collaborator
//! failures arrive as [`DriverError`] or [`StorageError`] and are wrapped
//! with the name of the operation that hit them, keeping their kind.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Top-level supervisor error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A CRUD lookup referenced an id that does not exist.
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    /// A request was rejected before reaching any collaborator.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A driver (machine, connectivity, payment node, exposure) failed.
    #[error("{op}: {source}")]
    Driver {
        op: &'static str,
        #[source]
        source: DriverError,
    },

    /// The persistence store failed.
    #[error("{op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: StorageError,
    },

    /// A mandatory surface could not be brought up during startup.
    #[error("startup failed on {surface}: {reason}")]
    Startup { surface: &'static str, reason: String },

    #[error("supervisor already running")]
    AlreadyRunning,
}

impl Error {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { what, id: id.into() }
    }

    pub fn driver(op: &'static str, source: DriverError) -> Self {
        Self::Driver { op, source }
    }

    pub fn storage(op: &'static str, source: StorageError) -> Self {
        Self::Storage { op, source }
    }
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("driver unavailable: {0}")]
    Unavailable(String),
    #[error("driver timed out after {0:?}")]
    Timeout(Duration),
    #[error("driver rejected request: {0}")]
    Rejected(String),
    #[error("driver I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,
    #[error("stored value corrupted: {0}")]
    Corrupted(String),
    #[error("storage I/O error: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field is out of its accepted range.  Never clamped.
    #[error("validation failed: {0}")]
    ValidationFailed(&'static str),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config I/O error: {0}")]
    Io(String),
}
