//! Error types for the store.
//!
//! [`StoreError`] is returned by every store operation. Startup failures are
//! [`StoreError::Initialization`]; everything that can go wrong while a caller
//! runs a statement is an execution-class error (see
//! [`StoreError::is_execution`]) that leaves the pool and statement caches
//! usable for the next call.

use std::fmt;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::sqlite::statements::StatementKind;

/// Startup phase in which an [`StoreError::Initialization`] occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStage {
    /// Validating configuration.
    Config,
    /// Creating or attaching the shared in-memory dataset.
    Dataset,
    /// Building the connection pool.
    Pool,
    /// Creating tables.
    Schema,
    /// Compiling and validating the statement set.
    Statements,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Dataset => "dataset",
            Self::Pool => "pool",
            Self::Schema => "schema",
            Self::Statements => "statements",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be opened. Fatal to startup.
    #[error("initialization failed ({stage}): {message}")]
    Initialization {
        /// Phase that failed.
        stage: InitStage,
        /// Underlying failure.
        message: String,
    },

    /// A statement invocation failed against the backend.
    #[error("{statement} failed: {source}")]
    Execution {
        /// Statement that was running.
        statement: StatementKind,
        /// `SQLite` error.
        source: rusqlite::Error,
    },

    /// The busy-wait bound was exceeded while waiting for a lock.
    #[error("{statement} timed out waiting for a lock: {source}")]
    ContentionTimeout {
        /// Statement that was running.
        statement: StatementKind,
        /// `SQLite` error (`SQLITE_BUSY` or `SQLITE_LOCKED`).
        source: rusqlite::Error,
    },

    /// Connection checkout failed or timed out.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl StoreError {
    /// Classify a failed invocation of `statement`.
    ///
    /// Lock errors become [`StoreError::ContentionTimeout`], everything else
    /// [`StoreError::Execution`].
    pub fn execution(statement: StatementKind, source: rusqlite::Error) -> Self {
        match source.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::ContentionTimeout { statement, source }
            }
            _ => Self::Execution { statement, source },
        }
    }

    /// Build an [`StoreError::Initialization`] from any displayable error.
    pub(crate) fn init(stage: InitStage, err: impl fmt::Display) -> Self {
        Self::Initialization {
            stage,
            message: err.to_string(),
        }
    }

    /// Whether this error came from running a statement (recoverable).
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            Self::Execution { .. } | Self::ContentionTimeout { .. } | Self::Pool(_)
        )
    }

    /// Whether this error is a lock-wait timeout.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::ContentionTimeout { .. })
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Extension for tagging raw `rusqlite` results with the statement they ran.
pub(crate) trait StatementResultExt<T> {
    fn during(self, statement: StatementKind) -> Result<T>;
}

impl<T> StatementResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn during(self, statement: StatementKind) -> Result<T> {
        self.map_err(|e| StoreError::execution(statement, e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
