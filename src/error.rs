//! Error types for the Tandem library
//!
//! This module defines all error types that can occur during Tandem operations.
//! The variants follow the failure taxonomy of a dual-store file: a missing file,
//! an unreachable repository, write-protected stores, conflicting use, identity
//! mismatches and internal-consistency faults each get their own variant so that
//! callers can pick a degraded local-only path where one exists.
//!
//! An aborted merge is not an error. It is reported through
//! [`CheckinOutcome::Aborted`](crate::types::CheckinOutcome) and
//! [`MergeOutcome::Aborted`](crate::types::MergeOutcome).

use crate::types::Version;
use thiserror::Error;

/// Type alias for Results in the Tandem library
pub type Result<T> = std::result::Result<T, TandemError>;

/// Main error type for all Tandem operations
#[derive(Debug, Error)]
pub enum TandemError {
    /// I/O errors during store operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Neither store holds the file
    #[error("Not found: {0}")]
    NotFound(String),

    /// The repository is required but unreachable
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The local store or the repository does not permit writes
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// A conflicting open handle, busy operation or active checkout blocks the operation
    #[error("File in use: {0}")]
    InUse(String),

    /// The acting repository user is not the user who owns the checkout
    #[error("File {operation} not permitted - checkout user '{checkout_user}' differs from repository user '{repository_user}'")]
    IdentityMismatch {
        /// Operation that was attempted
        operation: String,
        /// User recorded on the checkout
        checkout_user: String,
        /// User the repository is authenticated as
        repository_user: String,
    },

    /// An invariant that the locking model guarantees was violated
    #[error("Internal consistency fault: {0}")]
    InternalConsistency(String),

    /// The operation is not supported for this file or execution context
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The file is not checked out
    #[error("Not checked out: {0}")]
    NotCheckedOut(String),

    /// The file has no repository item
    #[error("Not versioned: {0}")]
    NotVersioned(String),

    /// Checkin requested for content identical to the checkout baseline
    #[error("No changes: {0}")]
    NoChanges(String),

    /// Merge requested while the repository has not advanced past the checkout
    #[error("Not updated: {0}")]
    NotUpdated(String),

    /// An open domain object holds unsaved edits
    #[error("Unsaved changes: {0}")]
    UnsavedChanges(String),

    /// Crash-recovery data must be recovered or discarded first
    #[error("Recovery data exists: {0}")]
    RecoveryDataExists(String),

    /// Target name is already taken
    #[error("Duplicate file: {0}")]
    DuplicateFile(String),

    /// Invalid file name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Invalid argument for the requested operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The repository tip moved away from the expected version
    #[error("Version conflict - expected: {expected}, actual: {actual}")]
    VersionConflict {
        /// Version the caller committed against
        expected: Version,
        /// Current repository version
        actual: Version,
    },

    /// A domain object was used after its file generation was replaced
    #[error("Stale domain object: {0}")]
    StaleObject(String),

    /// The operation was cancelled through its task monitor
    #[error("Operation cancelled")]
    Cancelled,

    /// Stored content failed its integrity check
    #[error("Corruption detected: {0}")]
    CorruptionDetected(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for TandemError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TandemError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for TandemError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TandemError::Bincode(err.to_string())
    }
}

impl TandemError {
    /// Create a not-found error with a custom message
    pub fn not_found(msg: impl Into<String>) -> Self {
        TandemError::NotFound(msg.into())
    }

    /// Create the standard not-connected error
    pub fn not_connected() -> Self {
        TandemError::NotConnected("Not connected to repository server".to_string())
    }

    /// Create a read-only error with a custom message
    pub fn read_only(msg: impl Into<String>) -> Self {
        TandemError::ReadOnly(msg.into())
    }

    /// Create an in-use error with a custom message
    pub fn in_use(msg: impl Into<String>) -> Self {
        TandemError::InUse(msg.into())
    }

    /// Create an internal-consistency fault with a custom message
    pub fn consistency(msg: impl Into<String>) -> Self {
        TandemError::InternalConsistency(msg.into())
    }

    /// Create an unsupported-operation error with a custom message
    pub fn unsupported(msg: impl Into<String>) -> Self {
        TandemError::Unsupported(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        TandemError::Internal(msg.into())
    }

    /// Check if retrying the operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TandemError::NotConnected(_)
                | TandemError::InUse(_)
                | TandemError::VersionConflict { .. }
                | TandemError::Cancelled
        )
    }

    /// Check if this error reports a violated invariant that must never be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TandemError::InternalConsistency(_) | TandemError::CorruptionDetected(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            TandemError::NotConnected(_) => {
                "The repository is not reachable. Reconnect, or force a local-only undo-checkout.".to_string()
            }
            TandemError::InUse(msg) => {
                format!("{}. Close the file or wait for the running operation to finish.", msg)
            }
            TandemError::NoChanges(_) => {
                "Nothing to check in: the file has not been modified since checkout.".to_string()
            }
            TandemError::UnsavedChanges(_) => {
                "Save the open file before checking in or merging.".to_string()
            }
            TandemError::StaleObject(path) => {
                format!("{} was replaced by a newer generation. Reopen it to continue editing.", path)
            }
            _ => self.to_string(),
        }
    }
}
