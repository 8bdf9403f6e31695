//! Core data types used throughout the Tandem library
//!
//! This module contains fundamental data structures that are shared across
//! the stores, the content adapters and the file state machine.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Identity**: `FileId`, `CheckoutId`, `Version` - stable identities and version numbers
//! - **Items**: `LocalItem`, `RepositoryItem`, `VersionInfo` - snapshots of stored items
//! - **Checkouts**: `CheckoutType`, `CheckoutStatus`, `LocalCheckout` - the repository
//!   record and its mirror on the local item
//! - **State**: `FileState` - the state derived from the (local, repository) pair
//! - **Operations**: `CheckinOptions`, `CheckinOutcome`, `MergeOutcome`, `TaskMonitor`
//! - **Configuration**: `ProjectConfig`
//!
//! ## Examples
//!
//! ```rust
//! use tandem::types::FileState;
//!
//! // A local copy that is not checked out while a repository item exists
//! assert_eq!(FileState::derive(true, true, false), Some(FileState::Hijacked));
//! assert_eq!(FileState::derive(false, false, false), None);
//! ```

use crate::error::{Result, TandemError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Repository version number. The first version of an item is 1.
pub type Version = u32;

/// Identifier of a checkout record, unique per repository item
pub type CheckoutId = u64;

/// Stable identity token of a file
///
/// The same `FileId` is carried by the local and the repository item once
/// they share history. Copies always receive a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    /// Generate a new random file id
    pub fn generate() -> Self {
        FileId(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing id string
    pub fn new(id: impl Into<String>) -> Self {
        FileId(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get first 8 characters of the id for display
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage representation of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    /// Structured binary item. Supports quick checkin, merge and version copies.
    Database,
    /// Opaque byte stream
    DataFile,
}

/// Kind of checkout lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutType {
    /// Shared checkout, other normal checkouts may coexist
    Normal,
    /// No other checkout may coexist
    Exclusive,
    /// Exclusive checkout held by a transient project
    Transient,
}

impl CheckoutType {
    /// Whether this checkout excludes all others
    pub fn is_exclusive(self) -> bool {
        !matches!(self, CheckoutType::Normal)
    }
}

/// Repository-side checkout record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutStatus {
    /// Checkout identifier
    pub checkout_id: CheckoutId,
    /// Checkout type
    pub checkout_type: CheckoutType,
    /// User owning the checkout
    pub user: String,
    /// Repository version the checkout is based on
    pub checkout_version: Version,
    /// Project that requested the checkout
    pub project_path: String,
    /// When the checkout was taken
    pub checkout_time: DateTime<Utc>,
}

/// Checkout metadata embedded in a local item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCheckout {
    /// Repository checkout record this mirrors
    pub checkout_id: CheckoutId,
    /// Whether the checkout was requested exclusive
    pub exclusive: bool,
    /// Repository version the local content is based on
    pub checkout_version: Version,
    /// Local item version at the time the baseline was established
    pub local_version: Version,
}

/// Attributes of an item about to be created in a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    /// Identity of the new item
    pub file_id: FileId,
    /// Content type used to select a content adapter
    pub content_type: String,
    /// Storage representation
    pub kind: ItemKind,
}

impl NewItem {
    /// New item with a freshly generated identity
    pub fn fresh(content_type: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            file_id: FileId::generate(),
            content_type: content_type.into(),
            kind,
        }
    }
}

/// Snapshot of a local item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalItem {
    /// Parent folder path
    pub parent_path: String,
    /// Item name
    pub name: String,
    /// Identity token
    pub file_id: FileId,
    /// Content type
    pub content_type: String,
    /// Storage representation
    pub kind: ItemKind,
    /// Local version, incremented on every save
    pub current_version: Version,
    /// Embedded checkout metadata
    pub checkout: Option<LocalCheckout>,
    /// Read-only flag (private files only)
    pub read_only: bool,
    /// Whether crash-recovery data is present
    pub has_recovery: bool,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
    /// Content length in bytes
    pub length: u64,
}

impl LocalItem {
    /// Whether the item is marked checked out
    pub fn is_checked_out(&self) -> bool {
        self.checkout.is_some()
    }

    /// Whether the item content differs from its checkout baseline
    pub fn modified_since_checkout(&self) -> bool {
        self.checkout
            .map(|co| co.local_version != self.current_version)
            .unwrap_or(false)
    }
}

/// Snapshot of a repository item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryItem {
    /// Parent folder path
    pub parent_path: String,
    /// Item name
    pub name: String,
    /// Identity token
    pub file_id: FileId,
    /// Content type
    pub content_type: String,
    /// Storage representation
    pub kind: ItemKind,
    /// Latest version
    pub current_version: Version,
    /// Creation time of the latest version
    pub last_modified: DateTime<Utc>,
    /// Length of the latest version in bytes
    pub length: u64,
}

/// One entry of a repository item's linear history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Version number
    pub version: Version,
    /// User that created the version
    pub user: String,
    /// Checkin comment
    pub comment: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the uncompressed content
    pub digest: String,
    /// Uncompressed length in bytes
    pub length: u64,
}

/// State derived from the (local, repository) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    /// Local item only
    Private,
    /// Repository item only
    Versioned,
    /// Local item checked out against the repository item
    CheckedOut,
    /// Local item that is not checked out shadows a repository item
    Hijacked,
}

impl FileState {
    /// Derive the file state from item presence and the local checkout flag
    ///
    /// Returns `None` when neither item is present. A checked-out local item
    /// whose repository item is not visible (repository offline) is still
    /// reported as checked out.
    pub fn derive(local_present: bool, repository_present: bool, checked_out: bool) -> Option<Self> {
        match (local_present, repository_present, checked_out) {
            (false, false, _) => None,
            (false, true, _) => Some(FileState::Versioned),
            (true, _, true) => Some(FileState::CheckedOut),
            (true, false, false) => Some(FileState::Private),
            (true, true, false) => Some(FileState::Hijacked),
        }
    }

    /// Whether the file takes part in version control
    pub fn is_versioned(self) -> bool {
        matches!(self, FileState::Versioned | FileState::CheckedOut)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileState::Private => "private",
            FileState::Versioned => "versioned",
            FileState::CheckedOut => "checked-out",
            FileState::Hijacked => "hijacked",
        };
        f.write_str(label)
    }
}

/// Options for checkin operations
#[derive(Debug, Clone, Default)]
pub struct CheckinOptions {
    /// Checkin comment
    pub comment: Option<String>,
    /// Keep the file checked out against the new version
    pub keep_checked_out: bool,
    /// Write a keep file holding the pre-checkin local content
    pub create_keep_file: bool,
}

/// Result of a checkin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// A new repository version was committed
    Committed {
        /// The new repository version
        version: Version,
        /// Whether the content was appended without a merge
        fast_path: bool,
    },
    /// The merge strategy stopped the checkin; nothing was changed
    Aborted,
}

/// Result of merging newer repository versions into a checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Unmodified checkout relinked to the latest version
    Rebased {
        /// New checkout version
        version: Version,
    },
    /// Local edits merged on top of the latest version
    Merged {
        /// New checkout version
        version: Version,
    },
    /// The merge strategy stopped the merge; nothing was changed
    Aborted,
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// File being processed
    pub current_item: Option<String>,
    /// Steps completed so far
    pub processed: usize,
    /// Total steps (if known)
    pub total: Option<usize>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Cooperative cancellation and progress reporting for long operations
///
/// Operations call [`TaskMonitor::check_cancelled`] between steps. Clones
/// share the same cancellation flag.
#[derive(Clone, Default)]
pub struct TaskMonitor {
    cancelled: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
}

impl TaskMonitor {
    /// Monitor that is never cancelled and reports nowhere
    pub fn none() -> Self {
        Self::default()
    }

    /// Monitor reporting progress to a callback
    pub fn with_progress(callback: ProgressCallback) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Some(callback),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`TandemError::Cancelled`] if cancellation was requested
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TandemError::Cancelled);
        }
        Ok(())
    }

    /// Report a step of an operation
    pub fn report(&self, operation: &str, current_item: Option<&str>, processed: usize, total: Option<usize>) {
        if let Some(callback) = &self.progress {
            callback(ProgressInfo {
                operation: operation.to_string(),
                current_item: current_item.map(str::to_string),
                processed,
                total,
            });
        }
    }
}

impl fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskMonitor")
            .field("cancelled", &self.is_cancelled())
            .field("progress_callback", &self.progress.is_some())
            .finish()
    }
}

/// Configuration of a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name, recorded on checkouts
    pub name: String,
    /// Transient projects only take exclusive transient checkouts and cannot merge
    pub transient: bool,
    /// Headless projects reject operations that need an interactive merge
    pub headless: bool,
    /// Always take the merge path on checkin
    pub always_merge: bool,
    /// Acting user recorded on checkouts and versions
    pub user: String,
    /// Tandem version that created this config
    pub version: String,
}

impl ProjectConfig {
    /// Configuration with defaults for the given project name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transient: false,
            headless: false,
            always_merge: false,
            user: crate::utils::default_user(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Project path recorded on repository checkouts
    pub fn project_path(&self) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        if self.transient {
            format!("{}::{} (transient)", host, self.name)
        } else {
            format!("{}::{}", host, self.name)
        }
    }
}
