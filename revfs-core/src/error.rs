//! Error types for revfs
//!
//! Every concrete failure maps onto one of a small set of [`ErrorKind`]s so
//! callers can branch on the category without matching every variant.

use std::path::PathBuf;

use crate::object::{ObjectId, Revnum};

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Coarse error categories exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Path, node or revision absent
    NotFound,
    /// Creation conflict
    AlreadyExists,
    /// Directory structure violation
    NoSuchParent,
    /// Commit conflict with a newer revision
    OutOfDate,
    /// Operation on a finished transaction or a busy store
    InvalidState,
    /// Storage medium failure or corruption
    IoError,
    /// Validation failure while writing content or committing
    CommitPrecondition,
}

/// Errors that can occur during filesystem operations
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Path not found: '{0}'")]
    NotFound(String),

    #[error("No such revision: {0}")]
    NoSuchRevision(Revnum),

    #[error("Node-revision not found: {0}")]
    NoSuchNode(ObjectId),

    #[error("Path already exists: '{0}'")]
    AlreadyExists(String),

    #[error("Parent of '{0}' is missing or not a directory")]
    NoSuchParent(String),

    #[error("'{0}' is not a file")]
    NotAFile(String),

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Operation not permitted on the root directory")]
    RootPath,

    #[error("Transaction is out of date: {0}")]
    OutOfDate(String),

    #[error("Transaction {txn} is {state}")]
    InvalidState { txn: String, state: &'static str },

    #[error("Commit precondition failed: {0}")]
    CommitPrecondition(String),

    #[error("Hook '{hook}' rejected the operation: {message}")]
    HookRejected { hook: String, message: String },

    #[error("No store at {0:?}")]
    NoStore(PathBuf),

    #[error("Store at {0:?} already exists")]
    StoreExists(PathBuf),

    #[error("Store at {0:?} is open in this process")]
    StoreInUse(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

impl FsError {
    /// The category this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound(_)
            | FsError::NoSuchRevision(_)
            | FsError::NoSuchNode(_)
            | FsError::NotAFile(_)
            | FsError::NotADirectory(_)
            | FsError::InvalidPath { .. }
            | FsError::NoStore(_) => ErrorKind::NotFound,
            FsError::AlreadyExists(_) | FsError::StoreExists(_) => ErrorKind::AlreadyExists,
            FsError::NoSuchParent(_) | FsError::RootPath => ErrorKind::NoSuchParent,
            FsError::OutOfDate(_) => ErrorKind::OutOfDate,
            FsError::InvalidState { .. } | FsError::StoreInUse(_) => ErrorKind::InvalidState,
            FsError::CommitPrecondition(_) | FsError::HookRejected { .. } => {
                ErrorKind::CommitPrecondition
            }
            FsError::Io(_)
            | FsError::Database(_)
            | FsError::Serialization(_)
            | FsError::Corrupt(_) => ErrorKind::IoError,
        }
    }

    /// Shorthand for `self.kind() == kind`
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}
