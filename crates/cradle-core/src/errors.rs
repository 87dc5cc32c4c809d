//! Error types for the Cradle core library.

use pyo3::exceptions::{PyIOError, PyLookupError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::PyErr;

/// Top-level error enum for the Cradle core library.
#[derive(Debug, thiserror::Error)]
pub enum CradleError {
    /// Malformed query string. Reported to the caller as a rejected request.
    #[error("Invalid query syntax: {0}")]
    Syntax(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The referenced entries exist but the user lacks the required level.
    /// Carries the ids of the offending entities.
    #[error("Access denied to entities {0:?}")]
    AccessDenied(Vec<i64>),

    /// A write that would break a storage invariant (duplicate vector
    /// offset, self-alias, type mismatch). The write is rejected.
    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CradleError {
    /// Whether a background job failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CradleError::Timeout(_) | CradleError::Sqlite(_) | CradleError::Database(_)
        )
    }
}

impl From<CradleError> for PyErr {
    fn from(err: CradleError) -> PyErr {
        match &err {
            CradleError::Syntax(_) => PyValueError::new_err(err.to_string()),
            // Missing and forbidden are indistinguishable to the caller.
            CradleError::NotFound(_) | CradleError::AccessDenied(_) => {
                PyLookupError::new_err("not found")
            }
            CradleError::Consistency(_) => {
                tracing::error!("{err}");
                PyRuntimeError::new_err(err.to_string())
            }
            CradleError::Timeout(_) => PyTimeoutError::new_err(err.to_string()),
            CradleError::Database(_) | CradleError::Sqlite(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
            CradleError::Json(_) | CradleError::Regex(_) => PyValueError::new_err(err.to_string()),
            CradleError::Io(_) => PyIOError::new_err(err.to_string()),
        }
    }
}

pub type CradleResult<T> = Result<T, CradleError>;
