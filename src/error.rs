//! Error taxonomy for the execution engine
//!
//! User-code failures are never errors here: a non-zero exit or a timeout is a
//! successful [`ExecutionResult`](crate::executor::ExecutionResult). Errors are either
//! caller mistakes (validation, not found) or infrastructure faults.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Invalid file path: {0:?}")]
    InvalidPath(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The interpreter binary for a language could not be found on the host
    #[error("Interpreter not found: {program}")]
    InterpreterMissing { program: String },

    /// The working directory could not be prepared
    #[error("Failed to prepare working directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend failure: {0}")]
    Storage(#[source] StorageError),

    #[error("Corrupt session metadata for {session_id}: {source}")]
    Metadata {
        session_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Coarse error classes exposed to callers so they can pick an external status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionNotFound,
    UnsupportedLanguage,
    FileNotFound,
    InvalidRequest,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Error::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            Error::FileNotFound(_) => ErrorKind::FileNotFound,
            Error::InvalidSessionId(_) | Error::InvalidPath(_) | Error::InvalidRequest(_) => {
                ErrorKind::InvalidRequest
            }
            Error::InterpreterMissing { .. }
            | Error::Workspace(_)
            | Error::Launch { .. }
            | Error::Storage(_)
            | Error::Metadata { .. } => ErrorKind::Internal,
        }
    }

    /// Infrastructure faults are logged with higher severity than caller mistakes
    pub fn is_infrastructure(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidSessionId(id) => Error::InvalidSessionId(id),
            StorageError::InvalidPath(path) => Error::InvalidPath(path),
            other => Error::Storage(other),
        }
    }
}
