//! Backend store capabilities
//!
//! A file lives in up to two stores: the private [`LocalStore`] that holds
//! working copies and the shared [`RepositoryStore`] that holds linear
//! version histories plus a checkout table. Both are addressed by a
//! normalized parent folder path and a name.
//!
//! Implementations must be safe to call from several threads. The file state
//! machine serializes mutations per file, but different files of the same
//! project are operated on concurrently.

use crate::error::Result;
use crate::types::{
    CheckoutId, CheckoutStatus, CheckoutType, FileId, LocalItem, NewItem, RepositoryItem,
    Version, VersionInfo,
};
use std::fmt::Debug;

/// Private store of working copies
pub trait LocalStore: Send + Sync + Debug {
    /// Whether the store rejects writes
    fn is_read_only(&self) -> bool;

    /// Load the item at `parent`/`name`, if any
    fn get_item(&self, parent: &str, name: &str) -> Result<Option<LocalItem>>;

    /// Whether an item exists at `parent`/`name`
    fn exists(&self, parent: &str, name: &str) -> Result<bool>;

    /// Create a new item with local version 1
    ///
    /// Fails with `DuplicateFile` if the name is taken.
    fn create_item(&self, parent: &str, name: &str, item: &NewItem, content: &[u8]) -> Result<LocalItem>;

    /// Read the item content
    fn read_content(&self, parent: &str, name: &str) -> Result<Vec<u8>>;

    /// Replace the item content and increment its local version
    fn write_content(&self, parent: &str, name: &str, content: &[u8]) -> Result<LocalItem>;

    /// Delete the item together with its recovery data
    fn delete_item(&self, parent: &str, name: &str) -> Result<()>;

    /// Move or rename the item
    fn move_item(&self, parent: &str, name: &str, new_parent: &str, new_name: &str) -> Result<LocalItem>;

    /// Move the item at `src_name` over the item at `dest_name` in the same folder
    ///
    /// The destination takes the source's content and metadata.
    fn replace_item(&self, parent: &str, src_name: &str, dest_name: &str) -> Result<LocalItem>;

    /// Record checkout metadata; the current local version becomes the baseline
    fn set_checkout(
        &self,
        parent: &str,
        name: &str,
        checkout_id: CheckoutId,
        exclusive: bool,
        checkout_version: Version,
    ) -> Result<LocalItem>;

    /// Drop checkout metadata, keeping the content
    fn clear_checkout(&self, parent: &str, name: &str) -> Result<LocalItem>;

    /// Assign a new identity token
    fn reset_file_id(&self, parent: &str, name: &str, file_id: &FileId) -> Result<LocalItem>;

    /// Set the read-only flag
    fn set_read_only(&self, parent: &str, name: &str, read_only: bool) -> Result<LocalItem>;

    /// Store or discard crash-recovery data for the item
    fn write_recovery(&self, parent: &str, name: &str, snapshot: Option<&[u8]>) -> Result<()>;

    /// Read crash-recovery data, if present
    fn read_recovery(&self, parent: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// All items in the store
    fn list_items(&self) -> Result<Vec<LocalItem>>;

    /// Store auxiliary user data tied to a file identity
    fn write_user_data(&self, file_id: &FileId, data: &[u8]) -> Result<()>;

    /// Whether user data exists for a file identity
    fn has_user_data(&self, file_id: &FileId) -> Result<bool>;

    /// Remove user data for a file identity; missing data is not an error
    fn remove_user_data(&self, file_id: &FileId) -> Result<()>;
}

/// Shared store of version histories
///
/// Every method except the property queries fails with `NotConnected`
/// while the store is offline.
pub trait RepositoryStore: Send + Sync + Debug {
    /// Whether the repository is reachable
    fn is_online(&self) -> bool;

    /// Whether several checkouts of one item may coexist
    fn is_shared(&self) -> bool;

    /// Whether the repository rejects writes
    fn is_read_only(&self) -> bool;

    /// Whether the repository is backed by local storage rather than a server
    ///
    /// Local repositories do not authenticate users.
    fn is_local(&self) -> bool;

    /// Authenticated user, `None` when no session exists
    fn user(&self) -> Option<String>;

    /// Load the item at `parent`/`name`, if any
    fn get_item(&self, parent: &str, name: &str) -> Result<Option<RepositoryItem>>;

    /// Whether an item exists at `parent`/`name`
    fn exists(&self, parent: &str, name: &str) -> Result<bool>;

    /// Create a new item whose version 1 holds `content`
    fn create_item(
        &self,
        parent: &str,
        name: &str,
        item: &NewItem,
        content: &[u8],
        comment: Option<&str>,
        user: &str,
    ) -> Result<RepositoryItem>;

    /// Read the content of a version
    fn read_version(&self, parent: &str, name: &str, version: Version) -> Result<Vec<u8>>;

    /// Version history, oldest first
    fn versions(&self, parent: &str, name: &str) -> Result<Vec<VersionInfo>>;

    /// Request a checkout of the latest version
    ///
    /// Returns `None` when a conflicting checkout blocks the request.
    fn checkout(
        &self,
        parent: &str,
        name: &str,
        checkout_type: CheckoutType,
        user: &str,
        project_path: &str,
    ) -> Result<Option<CheckoutStatus>>;

    /// Look up a checkout record
    fn get_checkout(&self, parent: &str, name: &str, checkout_id: CheckoutId) -> Result<Option<CheckoutStatus>>;

    /// All checkout records of the item
    fn checkouts(&self, parent: &str, name: &str) -> Result<Vec<CheckoutStatus>>;

    /// Remove a checkout record; unknown ids are ignored
    fn terminate_checkout(&self, parent: &str, name: &str, checkout_id: CheckoutId) -> Result<()>;

    /// Advance the baseline version of a checkout record
    fn update_checkout_version(
        &self,
        parent: &str,
        name: &str,
        checkout_id: CheckoutId,
        version: Version,
    ) -> Result<()>;

    /// Append a new version on behalf of a checkout
    ///
    /// Fails with `NotCheckedOut` if the checkout is no longer live and with
    /// `VersionConflict` if the latest version is not `expected_tip`.
    fn commit_version(
        &self,
        parent: &str,
        name: &str,
        checkout_id: CheckoutId,
        expected_tip: Version,
        content: &[u8],
        comment: Option<&str>,
        user: &str,
    ) -> Result<Version>;

    /// Delete the oldest or the latest version
    fn delete_version(&self, parent: &str, name: &str, version: Version) -> Result<()>;

    /// Delete the whole history; fails with `InUse` while checkouts exist
    fn delete_item(&self, parent: &str, name: &str) -> Result<()>;

    /// Move or rename the item; fails with `InUse` while checkouts exist
    fn move_item(&self, parent: &str, name: &str, new_parent: &str, new_name: &str) -> Result<RepositoryItem>;

    /// All items in the repository
    fn list_items(&self) -> Result<Vec<RepositoryItem>>;
}
