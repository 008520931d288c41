//! Error types for tasksync
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, invalid input, contract misuse)
//! - 3: Not found (unknown task or working-set index)
//! - 4: Operation failed (storage, sync, transport)

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Exit codes for the tsk CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const NOT_FOUND: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Coarse classification of an [`Error`].
///
/// Callers branch on this to tell "doesn't exist" apart from "couldn't check".
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Storage,
    NotFound,
    ContractViolation,
    Sync,
    Validation,
}

/// Main error type for tasksync operations
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: &'static str },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // Contract violations
    #[error("Replica is borrowed by a mutable task and cannot be used")]
    AlreadyMutable,

    #[error("Task already exists: {0}")]
    TaskExists(Uuid),

    #[error("Invalid uuid: {0}")]
    InvalidUuid(String),

    #[error("{0} must be a non-zero timestamp")]
    ZeroTimestamp(&'static str),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    // Not found
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("No task at working-set index {0}")]
    IndexNotFound(usize),

    // Storage failures
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    // Sync failures
    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server does not know sync key {0}; this replica has diverged")]
    UnknownSyncKey(Uuid),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::InvalidConfig(_)
            | Error::InvalidTag { .. }
            | Error::TomlParse(_)
            | Error::TomlSerialize(_) => ErrorKind::Validation,

            Error::AlreadyMutable
            | Error::TaskExists(_)
            | Error::InvalidUuid(_)
            | Error::ZeroTimestamp(_)
            | Error::ContractViolation(_) => ErrorKind::ContractViolation,

            Error::TaskNotFound(_) | Error::IndexNotFound(_) => ErrorKind::NotFound,

            Error::Io(_) | Error::Json(_) | Error::Storage(_) | Error::LockFailed(_) => {
                ErrorKind::Storage
            }

            Error::Sync(_) | Error::Http(_) | Error::UnknownSyncKey(_) => ErrorKind::Sync,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::ContractViolation => exit_codes::USER_ERROR,
            ErrorKind::NotFound => exit_codes::NOT_FOUND,
            ErrorKind::Storage | ErrorKind::Sync => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured context for JSON output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::TaskExists(uuid) | Error::TaskNotFound(uuid) => {
                Some(serde_json::json!({ "uuid": uuid }))
            }
            Error::UnknownSyncKey(uuid) => Some(serde_json::json!({ "sync_key": uuid })),
            Error::IndexNotFound(index) => Some(serde_json::json!({ "index": index })),
            Error::InvalidTag { tag, .. } => Some(serde_json::json!({ "tag": tag })),
            Error::LockFailed(path) => Some(serde_json::json!({ "path": path })),
            _ => None,
        }
    }
}

/// Result type alias for tasksync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub kind: ErrorKind,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            kind: err.kind(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
