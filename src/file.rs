//! The versioned file state machine
//!
//! A [`VersionedFile`] pairs the optional local item and the optional
//! repository item stored under one path and exposes every operation that
//! moves the file between the [`FileState`]s:
//!
//! ```text
//!            add_to_repository           checkout
//!  Private ─────────────────────▶ Versioned ───────▶ CheckedOut
//!     ▲                              ▲    ◀──────────    │
//!     │ convert_to_private           │  checkin /        │ merge
//!     │                              │  undo_checkout    ▼
//!  Hijacked ◀── stale local copy ────┘              CheckedOut
//! ```
//!
//! ## Concurrency
//!
//! Every state mutation happens under the per-file mutex. Checkin, merge and
//! recovery snapshots additionally take the `busy` flag, which lets them run
//! the merge strategy without holding the mutex. Results computed outside
//! the mutex are re-validated under it before they are committed.
//!
//! Listener notifications are queued while the mutex is held and delivered
//! after it has been released.

use crate::content::{ChangeSet, ContentAdapter, MergeResult};
use crate::domain::DomainObjectHandle;
use crate::error::{Result, TandemError};
use crate::listener::FileEvent;
use crate::naming::{
    keep_name, merge_temp_name, target_name, validate_name, versioned_copy_name, KEEP_SUFFIX,
};
use crate::project::ProjectContext;
use crate::types::{
    CheckinOptions, CheckinOutcome, CheckoutId, CheckoutStatus, CheckoutType, FileId, FileState,
    ItemKind, LocalCheckout, LocalItem, MergeOutcome, NewItem, RepositoryItem, TaskMonitor, Version,
    VersionInfo,
};
use crate::utils::{atomic_write, join_path, normalize_parent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Attempts at merging before a racing repository wins
const MAX_MERGE_ATTEMPTS: usize = 3;

/// State guarded by the per-file mutex
#[derive(Debug)]
struct FileInner {
    parent_path: String,
    name: String,
    file_id: Option<FileId>,
    local: Option<LocalItem>,
    repository: Option<RepositoryItem>,
    open_object: Option<DomainObjectHandle>,
}

impl FileInner {
    fn path(&self) -> String {
        join_path(&self.parent_path, &self.name)
    }

    fn state(&self) -> Option<FileState> {
        FileState::derive(
            self.local.is_some(),
            self.repository.is_some(),
            self.local.as_ref().is_some_and(LocalItem::is_checked_out),
        )
    }

    fn local_checkout(&self) -> Option<LocalCheckout> {
        self.local.as_ref().and_then(|l| l.checkout)
    }

    fn has_unsaved_changes(&self) -> bool {
        self.open_object.as_ref().is_some_and(DomainObjectHandle::is_changed)
    }
}

/// Clears the busy flag when dropped
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool, path: &str) -> Result<Self> {
        Self::try_acquire(flag).ok_or_else(|| {
            TandemError::in_use(format!("{} is busy with another operation", path))
        })
    }

    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Everything a checkin or merge needs about the checkout it commits for
#[derive(Debug, Clone)]
struct CommitPlan {
    parent: String,
    name: String,
    local: LocalItem,
    checkout: LocalCheckout,
    user: String,
}

impl CommitPlan {
    fn path(&self) -> String {
        join_path(&self.parent, &self.name)
    }
}

/// One file of a project, paired across the local store and the repository
pub struct VersionedFile {
    ctx: Weak<ProjectContext>,
    self_ref: Weak<VersionedFile>,
    inner: Mutex<FileInner>,
    busy: AtomicBool,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for VersionedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("VersionedFile");
        match self.inner.try_lock() {
            Some(inner) => {
                debug
                    .field("path", &inner.path())
                    .field("state", &inner.state())
                    .field("open", &inner.open_object.is_some());
            }
            None => {
                debug.field("path", &"<locked>");
            }
        }
        debug
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl VersionedFile {
    /// Load the file at `parent`/`name` from both stores
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotFound`] if neither store holds the file
    pub(crate) fn load(ctx: &Arc<ProjectContext>, parent: String, name: String) -> Result<Arc<Self>> {
        let file = Arc::new_cyclic(|self_ref| VersionedFile {
            ctx: Arc::downgrade(ctx),
            self_ref: self_ref.clone(),
            inner: Mutex::new(FileInner {
                parent_path: parent,
                name,
                file_id: None,
                local: None,
                repository: None,
                open_object: None,
            }),
            busy: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
        });
        {
            let mut inner = file.inner.lock();
            file.refresh_locked(ctx, &mut inner)?;
        }
        Ok(file)
    }

    fn ctx(&self) -> Result<Arc<ProjectContext>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| TandemError::internal("project has been closed"))
    }

    fn notify(ctx: &ProjectContext, events: &[FileEvent]) {
        for event in events {
            event.dispatch(ctx.listener.as_ref());
        }
    }

    fn check_not_in_use(&self, inner: &FileInner) -> Result<()> {
        if self.busy.load(Ordering::SeqCst) {
            return Err(TandemError::in_use(format!("{} is busy with another operation", inner.path())));
        }
        if inner.open_object.is_some() {
            return Err(TandemError::in_use(format!("{} is open", inner.path())));
        }
        Ok(())
    }

    /// Detach the open domain object and start a new generation
    fn invalidate_open_object(&self, inner: &mut FileInner, events: &mut Vec<FileEvent>) {
        if let Some(object) = inner.open_object.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            object.detach();
            let path = inner.path();
            debug!("Detached open domain object of {}", path);
            events.push(FileEvent::ObjectClosed { path: path.clone() });
            events.push(FileEvent::ObjectReplaced { path });
        }
    }

    fn checkout_type(ctx: &ProjectContext, exclusive: bool) -> CheckoutType {
        if ctx.config.transient {
            CheckoutType::Transient
        } else if exclusive || !ctx.repository.is_shared() {
            CheckoutType::Exclusive
        } else {
            CheckoutType::Normal
        }
    }

    /// User recorded on checkouts and new versions
    fn acting_user(ctx: &ProjectContext) -> Result<String> {
        if ctx.repository.is_local() {
            Ok(ctx.config.user.clone())
        } else {
            ctx.repository.user().ok_or_else(TandemError::not_connected)
        }
    }

    /// Fail unless the acting user owns the checkout (authenticated repositories only)
    fn verify_identity(ctx: &ProjectContext, operation: &str, checkout_user: &str) -> Result<()> {
        if ctx.repository.is_local() {
            return Ok(());
        }
        let repository_user = ctx.repository.user().ok_or_else(TandemError::not_connected)?;
        if repository_user != checkout_user {
            return Err(TandemError::IdentityMismatch {
                operation: operation.to_string(),
                checkout_user: checkout_user.to_string(),
                repository_user,
            });
        }
        Ok(())
    }

    /// Look up the live checkout record and verify its owner; returns the acting user
    fn verify_checkout_owner(
        ctx: &ProjectContext,
        parent: &str,
        name: &str,
        checkout: &LocalCheckout,
        operation: &str,
    ) -> Result<String> {
        let status = ctx
            .repository
            .get_checkout(parent, name, checkout.checkout_id)?
            .ok_or_else(|| {
                TandemError::NotCheckedOut(format!(
                    "checkout {} of {} no longer exists",
                    checkout.checkout_id,
                    join_path(parent, name)
                ))
            })?;
        Self::verify_identity(ctx, operation, &status.user)?;
        Self::acting_user(ctx)
    }

    /// Whether `name` is taken in either store; probe failures count as taken
    fn name_taken(ctx: &ProjectContext, parent: &str, name: &str) -> bool {
        let local = ctx.local.exists(parent, name).unwrap_or(true);
        let remote = ctx.repository.is_online() && ctx.repository.exists(parent, name).unwrap_or(true);
        local || remote
    }

    fn checked_out_local(inner: &FileInner) -> Result<(LocalItem, LocalCheckout)> {
        let local = inner
            .local
            .clone()
            .ok_or_else(|| TandemError::NotCheckedOut(inner.path()))?;
        let checkout = local
            .checkout
            .ok_or_else(|| TandemError::NotCheckedOut(inner.path()))?;
        Ok((local, checkout))
    }

    fn check_clean(inner: &FileInner, local: &LocalItem) -> Result<()> {
        if inner.has_unsaved_changes() {
            return Err(TandemError::UnsavedChanges(inner.path()));
        }
        if local.has_recovery {
            return Err(TandemError::RecoveryDataExists(inner.path()));
        }
        Ok(())
    }

    fn reload_repository_item(ctx: &ProjectContext, inner: &mut FileInner) {
        match ctx.repository.get_item(&inner.parent_path, &inner.name) {
            Ok(item) => inner.repository = item,
            Err(e) => debug!("Keeping previous repository snapshot of {}: {}", inner.path(), e),
        }
    }

    // ------------------------------------------------------------------
    // State & refresh
    // ------------------------------------------------------------------

    /// Re-read both stores and repair a stale checkout
    ///
    /// Returns whether the file identity was just established.
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotFound`] if neither store holds the file any more
    #[instrument(skip(self))]
    pub fn refresh(&self) -> Result<bool> {
        let ctx = self.ctx()?;
        let (path, file_id_set) = {
            let mut inner = self.inner.lock();
            let file_id_set = self.refresh_locked(&ctx, &mut inner)?;
            (inner.path(), file_id_set)
        };
        if file_id_set {
            Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set }]);
        }
        Ok(file_id_set)
    }

    fn refresh_locked(&self, ctx: &ProjectContext, inner: &mut FileInner) -> Result<bool> {
        let previous_id = inner.file_id.clone();
        inner.local = ctx.local.get_item(&inner.parent_path, &inner.name)?;
        if ctx.repository.is_online() {
            Self::reload_repository_item(ctx, inner);
        }
        if inner.local.is_none() && inner.repository.is_none() {
            inner.file_id = None;
            return Err(TandemError::not_found(inner.path()));
        }

        if let Some(checkout) = inner.local_checkout() {
            if !ctx.local.is_read_only() && ctx.repository.is_online() {
                let live = match &inner.repository {
                    Some(_) => match ctx
                        .repository
                        .get_checkout(&inner.parent_path, &inner.name, checkout.checkout_id)
                    {
                        Ok(status) => status.is_some(),
                        Err(e) => {
                            warn!(
                                "Cannot validate checkout {} of {}; keeping local checkout: {}",
                                checkout.checkout_id,
                                inner.path(),
                                e
                            );
                            true
                        }
                    },
                    None => false,
                };
                if !live {
                    warn!(
                        "Checkout {} of {} no longer exists in the repository; clearing local checkout",
                        checkout.checkout_id,
                        inner.path()
                    );
                    inner.local = Some(ctx.local.clear_checkout(&inner.parent_path, &inner.name)?);
                }
            }
        }

        inner.file_id = inner
            .local
            .as_ref()
            .map(|l| l.file_id.clone())
            .or_else(|| inner.repository.as_ref().map(|r| r.file_id.clone()));
        trace!("Refreshed {}: {:?}", inner.path(), inner.state());
        Ok(previous_id.is_none() && inner.file_id.is_some())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// File path
    pub fn path(&self) -> String {
        self.inner.lock().path()
    }

    /// File name
    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    /// Parent folder path
    pub fn parent_path(&self) -> String {
        self.inner.lock().parent_path.clone()
    }

    /// Identity token
    pub fn file_id(&self) -> Option<FileId> {
        self.inner.lock().file_id.clone()
    }

    /// Snapshot of the local item
    pub fn local_item(&self) -> Option<LocalItem> {
        self.inner.lock().local.clone()
    }

    /// Snapshot of the repository item
    pub fn repository_item(&self) -> Option<RepositoryItem> {
        self.inner.lock().repository.clone()
    }

    /// Derived state
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotFound`] if the file was deleted
    pub fn state(&self) -> Result<FileState> {
        let inner = self.inner.lock();
        inner.state().ok_or_else(|| TandemError::not_found(inner.path()))
    }

    /// Whether the local item is checked out
    pub fn is_checked_out(&self) -> bool {
        self.inner.lock().local_checkout().is_some()
    }

    /// Whether the checkout excludes all others
    ///
    /// Every checkout of a non-shared repository is exclusive.
    pub fn is_checked_out_exclusive(&self) -> bool {
        let Ok(ctx) = self.ctx() else { return false };
        self.inner
            .lock()
            .local_checkout()
            .is_some_and(|co| co.exclusive || !ctx.repository.is_shared())
    }

    /// Whether a local copy shadows the repository item
    pub fn is_hijacked(&self) -> bool {
        self.inner.lock().state() == Some(FileState::Hijacked)
    }

    /// Whether the file takes part in version control
    pub fn is_versioned(&self) -> bool {
        self.inner.lock().state().is_some_and(FileState::is_versioned)
    }

    /// Whether the checked-out content differs from its baseline
    pub fn modified_since_checkout(&self) -> bool {
        self.inner
            .lock()
            .local
            .as_ref()
            .is_some_and(LocalItem::modified_since_checkout)
    }

    /// Whether the local item is marked read-only
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().local.as_ref().is_some_and(|l| l.read_only)
    }

    /// Version of the content the user sees
    ///
    /// Checkout version when checked out, else the local version, else the
    /// repository tip.
    pub fn version(&self) -> Version {
        let inner = self.inner.lock();
        if let Some(checkout) = inner.local_checkout() {
            return checkout.checkout_version;
        }
        if let Some(local) = &inner.local {
            return local.current_version;
        }
        inner.repository.as_ref().map(|r| r.current_version).unwrap_or(0)
    }

    /// Latest repository version; 0 for hijacked and private files
    pub fn latest_version(&self) -> Version {
        let inner = self.inner.lock();
        if inner.state() == Some(FileState::Hijacked) {
            return 0;
        }
        inner.repository.as_ref().map(|r| r.current_version).unwrap_or(0)
    }

    /// Whether [`VersionedFile::checkout`] can succeed
    pub fn can_checkout(&self) -> bool {
        let Ok(ctx) = self.ctx() else { return false };
        let inner = self.inner.lock();
        let Some(repo_item) = &inner.repository else { return false };
        inner.local.is_none()
            && ctx.repository.is_online()
            && !ctx.repository.is_read_only()
            && !ctx.local.is_read_only()
            && ctx.adapter(&repo_item.content_type).is_ok_and(|a| !a.is_link())
    }

    /// Whether [`VersionedFile::checkin`] can succeed
    pub fn can_checkin(&self) -> bool {
        let Ok(ctx) = self.ctx() else { return false };
        let inner = self.inner.lock();
        !self.busy.load(Ordering::SeqCst)
            && ctx.repository.is_online()
            && !ctx.repository.is_read_only()
            && inner.repository.is_some()
            && inner
                .local
                .as_ref()
                .is_some_and(|l| l.is_checked_out() && l.modified_since_checkout())
    }

    /// Whether [`VersionedFile::merge`] can succeed
    pub fn can_merge(&self) -> bool {
        let Ok(ctx) = self.ctx() else { return false };
        let inner = self.inner.lock();
        let (Some(checkout), Some(repo_item)) = (inner.local_checkout(), &inner.repository) else {
            return false;
        };
        !self.busy.load(Ordering::SeqCst)
            && !ctx.config.transient
            && ctx.repository.is_online()
            && repo_item.kind == ItemKind::Database
            && repo_item.current_version > checkout.checkout_version
    }

    /// Whether [`VersionedFile::add_to_repository`] can succeed
    pub fn can_add_to_repository(&self) -> bool {
        let Ok(ctx) = self.ctx() else { return false };
        let inner = self.inner.lock();
        self.add_preconditions(&ctx, &inner).is_ok()
    }

    /// Whether crash-recovery data can be recovered
    pub fn can_recover(&self) -> bool {
        let inner = self.inner.lock();
        inner.open_object.is_none() && inner.local.as_ref().is_some_and(|l| l.has_recovery)
    }

    /// Whether a checkin, merge or recovery snapshot is running
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Whether the open domain object holds unsaved edits
    pub fn is_changed(&self) -> bool {
        self.inner.lock().has_unsaved_changes()
    }

    /// Content type of the file
    pub fn content_type(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .local
            .as_ref()
            .map(|l| l.content_type.clone())
            .or_else(|| inner.repository.as_ref().map(|r| r.content_type.clone()))
    }

    /// Last modification time of the visible content
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock();
        inner
            .local
            .as_ref()
            .map(|l| l.last_modified)
            .or_else(|| inner.repository.as_ref().map(|r| r.last_modified))
    }

    /// Length of the visible content
    pub fn length(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .local
            .as_ref()
            .map(|l| l.length)
            .or_else(|| inner.repository.as_ref().map(|r| r.length))
            .unwrap_or(0)
    }

    /// Repository version history, oldest first
    pub fn version_history(&self) -> Result<Vec<VersionInfo>> {
        let ctx = self.ctx()?;
        let inner = self.inner.lock();
        if !inner.state().is_some_and(FileState::is_versioned) || inner.repository.is_none() {
            return Err(TandemError::NotVersioned(inner.path()));
        }
        if !ctx.repository.is_online() {
            return Err(TandemError::not_connected());
        }
        ctx.repository.versions(&inner.parent_path, &inner.name)
    }

    /// Repository record of this file's checkout
    pub fn checkout_status(&self) -> Result<Option<CheckoutStatus>> {
        let ctx = self.ctx()?;
        let inner = self.inner.lock();
        let Some(checkout) = inner.local_checkout() else {
            return Ok(None);
        };
        if !ctx.repository.is_online() {
            return Err(TandemError::not_connected());
        }
        ctx.repository
            .get_checkout(&inner.parent_path, &inner.name, checkout.checkout_id)
    }

    /// All checkouts of the repository item
    pub fn checkouts(&self) -> Result<Vec<CheckoutStatus>> {
        let ctx = self.ctx()?;
        let inner = self.inner.lock();
        if inner.repository.is_none() {
            return Err(TandemError::NotVersioned(inner.path()));
        }
        if !ctx.repository.is_online() {
            return Err(TandemError::not_connected());
        }
        ctx.repository.checkouts(&inner.parent_path, &inner.name)
    }

    /// Changes others checked in since this file's checkout version
    pub fn changes_by_others_since_checkout(&self) -> Result<ChangeSet> {
        let ctx = self.ctx()?;
        let (parent, name, checkout, content_type) = {
            let inner = self.inner.lock();
            let (local, checkout) = Self::checked_out_local(&inner)?;
            (inner.parent_path.clone(), inner.name.clone(), checkout, local.content_type)
        };
        if !ctx.repository.is_online() {
            return Err(TandemError::not_connected());
        }
        let tip = ctx
            .repository
            .get_item(&parent, &name)?
            .ok_or_else(|| TandemError::NotVersioned(join_path(&parent, &name)))?
            .current_version;
        let adapter = ctx.adapter(&content_type)?;
        let base = ctx.repository.read_version(&parent, &name, checkout.checkout_version)?;
        let latest = ctx.repository.read_version(&parent, &name, tip)?;
        adapter.compute_change_set(&base, &latest, checkout.checkout_version, tip)
    }

    /// Mark a private file read-only or writable
    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        let ctx = self.ctx()?;
        let path = {
            let mut inner = self.inner.lock();
            if inner.state() != Some(FileState::Private) {
                return Err(TandemError::unsupported(format!(
                    "{} is not a private file",
                    inner.path()
                )));
            }
            inner.local = Some(ctx.local.set_read_only(&inner.parent_path, &inner.name, read_only)?);
            inner.path()
        };
        Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set: false }]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkout
    // ------------------------------------------------------------------

    /// Check the file out of the repository
    ///
    /// Returns `false` when the repository declines the checkout or the file
    /// is a link.
    ///
    /// # Errors
    ///
    /// - [`TandemError::ReadOnly`] if either store is write-protected
    /// - [`TandemError::InternalConsistency`] if a local item already exists
    /// - [`TandemError::NotConnected`] if the repository is offline
    /// - [`TandemError::NotVersioned`] if there is no repository item
    #[instrument(skip(self, monitor), fields(path = %self.path()))]
    pub fn checkout(&self, exclusive: bool, monitor: &TaskMonitor) -> Result<bool> {
        let ctx = self.ctx()?;
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            self.checkout_locked(&ctx, &mut inner, exclusive, monitor, &mut events)
        };
        Self::notify(&ctx, &events);
        result
    }

    fn checkout_locked(
        &self,
        ctx: &ProjectContext,
        inner: &mut FileInner,
        exclusive: bool,
        monitor: &TaskMonitor,
        events: &mut Vec<FileEvent>,
    ) -> Result<bool> {
        let repo = &ctx.repository;
        if ctx.local.is_read_only() {
            return Err(TandemError::read_only("local store is read-only"));
        }
        if repo.is_read_only() {
            return Err(TandemError::read_only("repository is read-only"));
        }
        if inner.local.is_some() {
            return Err(TandemError::consistency(format!(
                "{} already has a local item; checkout would overwrite it",
                inner.path()
            )));
        }
        if !repo.is_online() {
            return Err(TandemError::not_connected());
        }
        let repo_item = inner
            .repository
            .clone()
            .ok_or_else(|| TandemError::NotVersioned(inner.path()))?;
        if ctx.adapter(&repo_item.content_type)?.is_link() {
            debug!("{} is a link file; not checking out", inner.path());
            return Ok(false);
        }
        monitor.check_cancelled()?;

        let checkout_type = Self::checkout_type(ctx, exclusive);
        let user = Self::acting_user(ctx)?;
        let Some(status) = repo.checkout(
            &inner.parent_path,
            &inner.name,
            checkout_type,
            &user,
            &ctx.config.project_path(),
        )?
        else {
            info!("Repository declined {:?} checkout of {}", checkout_type, inner.path());
            return Ok(false);
        };

        match Self::materialize(ctx, inner, &repo_item, &status) {
            Ok(local) => {
                let file_id_set = inner.file_id.is_none();
                inner.file_id = Some(local.file_id.clone());
                inner.local = Some(local);
                Self::reload_repository_item(ctx, inner);
                info!(
                    "Checked out {} at version {} ({:?})",
                    inner.path(),
                    status.checkout_version,
                    checkout_type
                );
                events.push(FileEvent::StatusChanged {
                    path: inner.path(),
                    file_id_set,
                });
                Ok(true)
            }
            Err(e) => {
                if let Err(rollback) = repo.terminate_checkout(&inner.parent_path, &inner.name, status.checkout_id) {
                    error!(
                        "Failed to terminate checkout {} of {} after failed checkout: {}",
                        status.checkout_id,
                        inner.path(),
                        rollback
                    );
                }
                Err(e)
            }
        }
    }

    /// Copy the checked-out version into a new local item tagged with the checkout
    fn materialize(
        ctx: &ProjectContext,
        inner: &FileInner,
        repo_item: &RepositoryItem,
        status: &CheckoutStatus,
    ) -> Result<LocalItem> {
        let (parent, name) = (&inner.parent_path, &inner.name);
        let content = ctx.repository.read_version(parent, name, status.checkout_version)?;
        let new_item = NewItem {
            file_id: inner.file_id.clone().unwrap_or_else(|| repo_item.file_id.clone()),
            content_type: repo_item.content_type.clone(),
            kind: repo_item.kind,
        };
        ctx.local.create_item(parent, name, &new_item, &content)?;
        let tagged = ctx.local.set_checkout(
            parent,
            name,
            status.checkout_id,
            status.checkout_type.is_exclusive(),
            status.checkout_version,
        );
        if tagged.is_err() {
            if let Err(e) = ctx.local.delete_item(parent, name) {
                error!("Failed to remove partially checked-out {}: {}", inner.path(), e);
            }
        }
        tagged
    }

    // ------------------------------------------------------------------
    // Checkin
    // ------------------------------------------------------------------

    /// Check local changes into the repository
    ///
    /// Takes the quick path when the item is a database and the repository
    /// has not advanced past the checkout version; otherwise the content
    /// adapter merges the local changes onto the latest version.
    ///
    /// # Errors
    ///
    /// Preconditions are checked in this order: [`TandemError::NotConnected`],
    /// [`TandemError::ReadOnly`], [`TandemError::NotCheckedOut`],
    /// [`TandemError::UnsavedChanges`], [`TandemError::RecoveryDataExists`],
    /// [`TandemError::NoChanges`], [`TandemError::IdentityMismatch`],
    /// [`TandemError::InUse`].
    #[instrument(skip(self, options, monitor), fields(path = %self.path()))]
    pub fn checkin(&self, options: &CheckinOptions, monitor: &TaskMonitor) -> Result<CheckinOutcome> {
        let ctx = self.ctx()?;
        let start = Instant::now();
        let mut events = Vec::new();
        let result = self.checkin_steps(&ctx, options, monitor, &mut events);
        events.push(FileEvent::StatusChanged {
            path: self.path(),
            file_id_set: false,
        });
        Self::notify(&ctx, &events);
        if let Ok(outcome) = &result {
            info!("Checkin finished in {:?}: {:?}", start.elapsed(), outcome);
        }
        result
    }

    fn checkin_steps(
        &self,
        ctx: &ProjectContext,
        options: &CheckinOptions,
        monitor: &TaskMonitor,
        events: &mut Vec<FileEvent>,
    ) -> Result<CheckinOutcome> {
        let (plan, _busy) = {
            let inner = self.inner.lock();
            if !ctx.repository.is_online() {
                return Err(TandemError::not_connected());
            }
            if ctx.repository.is_read_only() {
                return Err(TandemError::read_only("repository is read-only"));
            }
            let (local, checkout) = Self::checked_out_local(&inner)?;
            Self::check_clean(&inner, &local)?;
            if !local.modified_since_checkout() {
                return Err(TandemError::NoChanges(inner.path()));
            }
            let user = Self::verify_checkout_owner(ctx, &inner.parent_path, &inner.name, &checkout, "checkin")?;
            let busy = BusyGuard::acquire(&self.busy, &inner.path())?;
            let plan = CommitPlan {
                parent: inner.parent_path.clone(),
                name: inner.name.clone(),
                local,
                checkout,
                user,
            };
            (plan, busy)
        };
        monitor.check_cancelled()?;

        let adapter = ctx.adapter(&plan.local.content_type)?;
        let source_bytes = ctx.local.read_content(&plan.parent, &plan.name)?;

        let quick = if plan.local.kind == ItemKind::Database && !ctx.config.always_merge {
            self.quick_checkin(ctx, &plan, options)?
        } else {
            None
        };

        let (version, merged, fast_path) = match quick {
            Some(version) => (version, None, true),
            None => {
                debug!("Checking in {} through merge", plan.path());
                match self.merge_checkin(ctx, &plan, adapter.as_ref(), &source_bytes, options, monitor)? {
                    Some((version, content)) => (version, Some(content), false),
                    None => {
                        info!("Checkin of {} aborted by merge", plan.path());
                        return Ok(CheckinOutcome::Aborted);
                    }
                }
            }
        };

        self.finish_checkin(ctx, &plan, version, merged, options, events)?;
        if options.create_keep_file {
            self.create_keep_file(ctx, &plan.parent, &plan.name, &plan.local, &source_bytes);
        }
        Ok(CheckinOutcome::Committed { version, fast_path })
    }

    /// Append the local content directly; `None` when the repository moved on
    fn quick_checkin(&self, ctx: &ProjectContext, plan: &CommitPlan, options: &CheckinOptions) -> Result<Option<Version>> {
        let _inner = self.inner.lock();
        let repo = &ctx.repository;
        let tip = repo
            .get_item(&plan.parent, &plan.name)?
            .ok_or_else(|| TandemError::consistency(format!("{} vanished from the repository", plan.path())))?
            .current_version;
        if tip != plan.checkout.checkout_version {
            debug!(
                "Repository at version {} past checkout version {}",
                tip, plan.checkout.checkout_version
            );
            return Ok(None);
        }
        if repo
            .get_checkout(&plan.parent, &plan.name, plan.checkout.checkout_id)?
            .is_none()
        {
            return Err(TandemError::NotCheckedOut(format!(
                "checkout {} of {} was terminated",
                plan.checkout.checkout_id,
                plan.path()
            )));
        }

        let content = ctx.local.read_content(&plan.parent, &plan.name)?;
        match repo.commit_version(
            &plan.parent,
            &plan.name,
            plan.checkout.checkout_id,
            tip,
            &content,
            options.comment.as_deref(),
            &plan.user,
        ) {
            Ok(version) => Ok(Some(version)),
            Err(TandemError::VersionConflict { expected, actual }) => {
                debug!("Lost quick checkin race (expected {}, found {})", expected, actual);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Merge local changes onto the latest version and commit the result
    ///
    /// Returns `None` when the merge strategy aborted.
    fn merge_checkin(
        &self,
        ctx: &ProjectContext,
        plan: &CommitPlan,
        adapter: &dyn ContentAdapter,
        source_bytes: &[u8],
        options: &CheckinOptions,
        monitor: &TaskMonitor,
    ) -> Result<Option<(Version, Vec<u8>)>> {
        if ctx.config.headless && adapter.is_interactive() {
            return Err(TandemError::unsupported(format!(
                "checkin of {} needs an interactive merge",
                plan.path()
            )));
        }
        let repo = &ctx.repository;
        let base = plan.checkout.checkout_version;
        let original_bytes = repo.read_version(&plan.parent, &plan.name, base)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            monitor.check_cancelled()?;
            let tip = repo
                .get_item(&plan.parent, &plan.name)?
                .ok_or_else(|| TandemError::consistency(format!("{} vanished from the repository", plan.path())))?
                .current_version;
            let latest_bytes = repo.read_version(&plan.parent, &plan.name, tip)?;
            let changes = adapter.compute_change_set(&original_bytes, &latest_bytes, base, tip)?;

            let mut target = adapter.open_mutable(
                latest_bytes.clone(),
                &format!("{}@{}", plan.name, tip + 1),
                Some(tip + 1),
            )?;
            let source = adapter.open_immutable(source_bytes.to_vec(), &format!("{} (local)", plan.name), None)?;
            let original = adapter.open_immutable(original_bytes.clone(), &format!("{}@{}", plan.name, base), Some(base))?;
            let mut latest = adapter.open_immutable(latest_bytes, &format!("{}@{}", plan.name, tip), Some(tip))?;
            latest.changes = Some(changes);

            monitor.report("Merging", Some(&plan.name), 1, Some(2));
            if adapter.merge(&mut target, &source, &original, &latest, monitor)? == MergeResult::Aborted {
                return Ok(None);
            }
            monitor.check_cancelled()?;
            monitor.report("Committing", Some(&plan.name), 2, Some(2));

            let committed = {
                let _inner = self.inner.lock();
                repo.commit_version(
                    &plan.parent,
                    &plan.name,
                    plan.checkout.checkout_id,
                    tip,
                    &target.content,
                    options.comment.as_deref(),
                    &plan.user,
                )
            };
            match committed {
                Ok(version) => return Ok(Some((version, target.content))),
                Err(TandemError::VersionConflict { actual, .. }) if attempt < MAX_MERGE_ATTEMPTS => {
                    debug!("Repository advanced to {} while merging {}; merging again", actual, plan.path());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Relink or release the local item after a commit
    fn finish_checkin(
        &self,
        ctx: &ProjectContext,
        plan: &CommitPlan,
        version: Version,
        merged: Option<Vec<u8>>,
        options: &CheckinOptions,
        events: &mut Vec<FileEvent>,
    ) -> Result<()> {
        let failure = {
            let mut inner = self.inner.lock();
            self.invalidate_open_object(&mut inner, events);
            let updated = if options.keep_checked_out {
                Self::relink_checkout(ctx, plan, version, merged.as_deref()).map(|local| inner.local = Some(local))
            } else {
                Self::release_checkout(ctx, plan).map(|()| inner.local = None)
            };
            Self::reload_repository_item(ctx, &mut inner);
            updated.err()
        };

        if let Some(err) = failure {
            error!("Failed to update {} after checking in version {}: {}", plan.path(), version, err);
            if let Err(undo) = self.undo_checkout(false, true, true) {
                error!("Undo checkout of {} after failed checkin update also failed: {}", plan.path(), undo);
            }
            return Err(err);
        }
        Ok(())
    }

    fn release_checkout(ctx: &ProjectContext, plan: &CommitPlan) -> Result<()> {
        ctx.repository
            .terminate_checkout(&plan.parent, &plan.name, plan.checkout.checkout_id)?;
        ctx.local.delete_item(&plan.parent, &plan.name)
    }

    fn relink_checkout(ctx: &ProjectContext, plan: &CommitPlan, version: Version, merged: Option<&[u8]>) -> Result<LocalItem> {
        if let Some(content) = merged {
            ctx.local.write_content(&plan.parent, &plan.name, content)?;
        }
        ctx.repository
            .update_checkout_version(&plan.parent, &plan.name, plan.checkout.checkout_id, version)?;
        ctx.local.set_checkout(
            &plan.parent,
            &plan.name,
            plan.checkout.checkout_id,
            plan.checkout.exclusive,
            version,
        )
    }

    // ------------------------------------------------------------------
    // Merge into a stale checkout
    // ------------------------------------------------------------------

    /// Bring newer repository versions into the checkout without checking in
    ///
    /// An unmodified checkout is relinked to the latest version. Otherwise
    /// the latest version is copied into a temporary item, the local changes
    /// are merged into it and it replaces the local item.
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotUpdated`] if the repository has no newer version
    /// - [`TandemError::Unsupported`] for data files, transient projects and
    ///   interactive merges in headless mode
    /// - [`TandemError::InternalConsistency`] if the checkout moved while
    ///   merging
    /// - [`TandemError::NotCheckedOut`] if the checkout was terminated while
    ///   merging
    #[instrument(skip(self, monitor), fields(path = %self.path()))]
    pub fn merge(&self, monitor: &TaskMonitor) -> Result<MergeOutcome> {
        let ctx = self.ctx()?;
        let start = Instant::now();
        let mut events = Vec::new();
        let result = self.merge_steps(&ctx, monitor, &mut events);
        events.push(FileEvent::StatusChanged {
            path: self.path(),
            file_id_set: false,
        });
        Self::notify(&ctx, &events);
        if let Ok(outcome) = &result {
            info!("Merge finished in {:?}: {:?}", start.elapsed(), outcome);
        }
        result
    }

    fn merge_steps(&self, ctx: &ProjectContext, monitor: &TaskMonitor, events: &mut Vec<FileEvent>) -> Result<MergeOutcome> {
        let (plan, tip, _busy) = {
            let inner = self.inner.lock();
            if ctx.local.is_read_only() {
                return Err(TandemError::read_only("local store is read-only"));
            }
            if ctx.config.transient {
                return Err(TandemError::unsupported("merge is not available in transient projects"));
            }
            if !ctx.repository.is_online() {
                return Err(TandemError::not_connected());
            }
            let (local, checkout) = Self::checked_out_local(&inner)?;
            let repo_item = ctx
                .repository
                .get_item(&inner.parent_path, &inner.name)?
                .ok_or_else(|| TandemError::consistency(format!("{} vanished from the repository", inner.path())))?;
            if repo_item.kind != ItemKind::Database {
                return Err(TandemError::unsupported(format!("{} is not a database item", inner.path())));
            }
            if repo_item.current_version <= checkout.checkout_version {
                return Err(TandemError::NotUpdated(inner.path()));
            }
            Self::check_clean(&inner, &local)?;
            let user = Self::verify_checkout_owner(ctx, &inner.parent_path, &inner.name, &checkout, "merge")?;
            let busy = BusyGuard::acquire(&self.busy, &inner.path())?;
            let plan = CommitPlan {
                parent: inner.parent_path.clone(),
                name: inner.name.clone(),
                local,
                checkout,
                user,
            };
            (plan, repo_item.current_version, busy)
        };

        if !plan.local.modified_since_checkout() {
            return self.quick_merge(ctx, &plan, tip, events);
        }

        let adapter = ctx.adapter(&plan.local.content_type)?;
        if ctx.config.headless && adapter.is_interactive() {
            return Err(TandemError::unsupported(format!(
                "merge of {} needs an interactive merge",
                plan.path()
            )));
        }

        let temp = merge_temp_name(&plan.name, |n| ctx.local.exists(&plan.parent, n).unwrap_or(true));
        let result = self.merge_via_temp(ctx, &plan, adapter.as_ref(), tip, &temp, monitor, events);
        if ctx.local.exists(&plan.parent, &temp).unwrap_or(false) {
            if let Err(e) = ctx.local.delete_item(&plan.parent, &temp) {
                error!("Failed to remove temporary merge item {}: {}", join_path(&plan.parent, &temp), e);
            }
        }
        result
    }

    /// Relink an unmodified checkout to the latest version
    fn quick_merge(&self, ctx: &ProjectContext, plan: &CommitPlan, tip: Version, events: &mut Vec<FileEvent>) -> Result<MergeOutcome> {
        let mut inner = self.inner.lock();
        let repo = &ctx.repository;
        let content = repo.read_version(&plan.parent, &plan.name, tip)?;
        repo.update_checkout_version(&plan.parent, &plan.name, plan.checkout.checkout_id, tip)?;

        let relinked = ctx
            .local
            .write_content(&plan.parent, &plan.name, &content)
            .and_then(|_| {
                ctx.local.set_checkout(
                    &plan.parent,
                    &plan.name,
                    plan.checkout.checkout_id,
                    plan.checkout.exclusive,
                    tip,
                )
            });
        let local = match relinked {
            Ok(local) => local,
            Err(e) => {
                if let Err(revert) = repo.update_checkout_version(
                    &plan.parent,
                    &plan.name,
                    plan.checkout.checkout_id,
                    plan.checkout.checkout_version,
                ) {
                    error!("Failed to restore checkout version of {}: {}", plan.path(), revert);
                }
                return Err(e);
            }
        };
        inner.local = Some(local);
        Self::reload_repository_item(ctx, &mut inner);
        self.invalidate_open_object(&mut inner, events);
        info!("Relinked unmodified checkout of {} to version {}", plan.path(), tip);
        Ok(MergeOutcome::Rebased { version: tip })
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_via_temp(
        &self,
        ctx: &ProjectContext,
        plan: &CommitPlan,
        adapter: &dyn ContentAdapter,
        tip: Version,
        temp: &str,
        monitor: &TaskMonitor,
        events: &mut Vec<FileEvent>,
    ) -> Result<MergeOutcome> {
        let repo = &ctx.repository;
        let (parent, name) = (plan.parent.as_str(), plan.name.as_str());
        let base = plan.checkout.checkout_version;
        monitor.check_cancelled()?;

        let latest_bytes = repo.read_version(parent, name, tip)?;
        let new_item = NewItem {
            file_id: plan.local.file_id.clone(),
            content_type: plan.local.content_type.clone(),
            kind: plan.local.kind,
        };
        ctx.local.create_item(parent, temp, &new_item, &latest_bytes)?;
        ctx.local
            .set_checkout(parent, temp, plan.checkout.checkout_id, plan.checkout.exclusive, tip)?;

        let original_bytes = repo.read_version(parent, name, base)?;
        let source_bytes = ctx.local.read_content(parent, name)?;
        let changes = adapter.compute_change_set(&original_bytes, &latest_bytes, base, tip)?;

        let mut target = adapter.open_mutable(latest_bytes.clone(), temp, Some(tip))?;
        let source = adapter.open_immutable(source_bytes.clone(), &format!("{} (local)", name), None)?;
        let original = adapter.open_immutable(original_bytes, &format!("{}@{}", name, base), Some(base))?;
        let mut latest = adapter.open_immutable(latest_bytes, &format!("{}@{}", name, tip), Some(tip))?;
        latest.changes = Some(changes);

        monitor.report("Merging", Some(name), 1, Some(2));
        if adapter.merge(&mut target, &source, &original, &latest, monitor)? == MergeResult::Aborted {
            info!("Merge of {} aborted; local item unchanged", plan.path());
            return Ok(MergeOutcome::Aborted);
        }
        monitor.check_cancelled()?;
        monitor.report("Promoting", Some(name), 2, Some(2));

        {
            let mut inner = self.inner.lock();
            let current = ctx
                .local
                .get_item(parent, name)?
                .and_then(|l| l.checkout)
                .map(|co| (co.checkout_id, co.checkout_version));
            if current != Some((plan.checkout.checkout_id, base)) {
                return Err(TandemError::consistency(format!(
                    "checkout of {} changed while merging",
                    plan.path()
                )));
            }
            // Newer check-ins by others leave the merge valid at `tip`
            match repo.get_checkout(parent, name, plan.checkout.checkout_id)? {
                Some(status) if status.checkout_version == base => {}
                Some(status) => {
                    return Err(TandemError::consistency(format!(
                        "checkout {} of {} moved from version {} to {} while merging",
                        plan.checkout.checkout_id,
                        plan.path(),
                        base,
                        status.checkout_version
                    )));
                }
                None => {
                    return Err(TandemError::NotCheckedOut(format!(
                        "checkout {} of {} was terminated while merging",
                        plan.checkout.checkout_id,
                        plan.path()
                    )));
                }
            }

            ctx.local.write_content(parent, temp, &target.content)?;
            repo.update_checkout_version(parent, name, plan.checkout.checkout_id, tip)?;
            match ctx.local.replace_item(parent, temp, name) {
                Ok(local) => inner.local = Some(local),
                Err(e) => {
                    if let Err(revert) =
                        repo.update_checkout_version(parent, name, plan.checkout.checkout_id, base)
                    {
                        error!("Failed to restore checkout version of {}: {}", plan.path(), revert);
                    }
                    return Err(e);
                }
            }
            Self::reload_repository_item(ctx, &mut inner);
            self.invalidate_open_object(&mut inner, events);
        }

        self.create_keep_file(ctx, parent, name, &plan.local, &source_bytes);
        Ok(MergeOutcome::Merged { version: tip })
    }

    // ------------------------------------------------------------------
    // Undo checkout
    // ------------------------------------------------------------------

    /// Release the checkout
    ///
    /// With `keep`, the local copy survives as a private keep file;
    /// otherwise it is deleted. `force` allows a local-only cleanup while the
    /// repository is offline and skips the ownership check. `in_use_ok`
    /// detaches an open domain object instead of failing.
    #[instrument(skip(self), fields(path = %self.path()))]
    pub fn undo_checkout(&self, keep: bool, force: bool, in_use_ok: bool) -> Result<()> {
        let ctx = self.ctx()?;
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            self.undo_checkout_locked(&ctx, &mut inner, keep, force, in_use_ok, &mut events)
        };
        Self::notify(&ctx, &events);
        result
    }

    fn undo_checkout_locked(
        &self,
        ctx: &ProjectContext,
        inner: &mut FileInner,
        keep: bool,
        force: bool,
        in_use_ok: bool,
        events: &mut Vec<FileEvent>,
    ) -> Result<()> {
        if ctx.local.is_read_only() {
            return Err(TandemError::read_only("local store is read-only"));
        }
        if !in_use_ok {
            self.check_not_in_use(inner)?;
        }
        let online = ctx.repository.is_online();
        if !online && !force {
            return Err(TandemError::not_connected());
        }
        let (_, checkout) = Self::checked_out_local(inner)?;

        if online && inner.repository.is_some() {
            if let Some(status) =
                ctx.repository
                    .get_checkout(&inner.parent_path, &inner.name, checkout.checkout_id)?
            {
                if !force {
                    Self::verify_identity(ctx, "undo checkout", &status.user)?;
                }
                ctx.repository
                    .terminate_checkout(&inner.parent_path, &inner.name, checkout.checkout_id)?;
            }
        } else {
            warn!("Repository offline; releasing checkout of {} locally only", inner.path());
        }

        self.invalidate_open_object(inner, events);
        let path = inner.path();
        if keep {
            ctx.local.clear_checkout(&inner.parent_path, &inner.name)?;
            let keep = keep_name(&inner.name, |n| Self::name_taken(ctx, &inner.parent_path, n));
            ctx.local
                .move_item(&inner.parent_path, &inner.name, &inner.parent_path, &keep)?;
            let keep_path = join_path(&inner.parent_path, &keep);
            ctx.forget(&keep_path);
            info!("Undid checkout of {}; local copy kept as {}", path, keep_path);
            events.push(FileEvent::StatusChanged {
                path: keep_path,
                file_id_set: true,
            });
        } else {
            ctx.local.delete_item(&inner.parent_path, &inner.name)?;
            info!("Undid checkout of {}", path);
        }
        inner.local = None;
        if inner.repository.is_none() {
            inner.file_id = None;
        }
        events.push(FileEvent::StatusChanged {
            path,
            file_id_set: false,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identity operations
    // ------------------------------------------------------------------

    /// Rename the file within its folder
    #[instrument(skip(self), fields(path = %self.path()))]
    pub fn rename(&self, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let parent = self.parent_path();
        self.relocate(parent, new_name.to_string(), false)
    }

    /// Move the file to another folder
    #[instrument(skip(self), fields(path = %self.path()))]
    pub fn move_to(&self, new_parent: &str) -> Result<()> {
        let new_parent = normalize_parent(new_parent)?;
        let name = self.name();
        self.relocate(new_parent, name, true)
    }

    fn relocate(&self, new_parent: String, new_name: String, is_move: bool) -> Result<()> {
        let ctx = self.ctx()?;
        let mut events = Vec::new();
        let (old_path, new_path, revealed) = {
            let mut inner = self.inner.lock();
            let old_path = inner.path();
            if ctx.local.is_read_only() {
                return Err(TandemError::read_only("local store is read-only"));
            }
            self.check_not_in_use(&inner)?;
            if is_move && new_parent == inner.parent_path {
                return Err(TandemError::InvalidArgument(format!(
                    "{} is already in {}",
                    old_path, new_parent
                )));
            }
            if !is_move && new_name == inner.name {
                return Ok(());
            }
            let new_path = join_path(&new_parent, &new_name);
            if Self::name_taken(&ctx, &new_parent, &new_name) {
                return Err(TandemError::DuplicateFile(new_path));
            }

            let state = inner
                .state()
                .ok_or_else(|| TandemError::not_found(old_path.clone()))?;
            match state {
                FileState::CheckedOut => {
                    return Err(TandemError::in_use(format!("{} is checked out", old_path)));
                }
                FileState::Hijacked => {
                    ctx.local
                        .move_item(&inner.parent_path, &inner.name, &new_parent, &new_name)?;
                    inner.local = None;
                    inner.file_id = inner.repository.as_ref().map(|r| r.file_id.clone());
                    events.push(FileEvent::StatusChanged {
                        path: old_path.clone(),
                        file_id_set: false,
                    });
                    events.push(FileEvent::StatusChanged {
                        path: new_path.clone(),
                        file_id_set: true,
                    });
                    (old_path, new_path, true)
                }
                FileState::Private => {
                    let local = ctx
                        .local
                        .move_item(&inner.parent_path, &inner.name, &new_parent, &new_name)?;
                    inner.local = Some(local);
                    inner.parent_path = new_parent;
                    inner.name = new_name;
                    (old_path, new_path, false)
                }
                FileState::Versioned => {
                    if !ctx.repository.is_online() {
                        return Err(TandemError::not_connected());
                    }
                    if ctx.repository.is_read_only() {
                        return Err(TandemError::read_only("repository is read-only"));
                    }
                    let item = ctx
                        .repository
                        .move_item(&inner.parent_path, &inner.name, &new_parent, &new_name)?;
                    inner.repository = Some(item);
                    inner.parent_path = new_parent;
                    inner.name = new_name;
                    (old_path, new_path, false)
                }
            }
        };

        if revealed {
            info!("Moved hijacked copy of {} to {}", old_path, new_path);
            ctx.forget(&new_path);
        } else {
            info!("Relocated {} to {}", old_path, new_path);
            if let Some(me) = self.self_ref.upgrade() {
                ctx.rekey(&old_path, &new_path, me);
            }
            events.push(if is_move {
                FileEvent::Moved { old_path, new_path }
            } else {
                FileEvent::Renamed { old_path, new_path }
            });
        }
        Self::notify(&ctx, &events);
        Ok(())
    }

    /// Copy the visible content into a new private file in `dest_parent`
    ///
    /// Returns the path of the copy. Copies never share identity with the source.
    #[instrument(skip(self, monitor), fields(path = %self.path()))]
    pub fn copy_to(&self, dest_parent: &str, monitor: &TaskMonitor) -> Result<String> {
        let ctx = self.ctx()?;
        let dest = normalize_parent(dest_parent)?;
        let (name, content, content_type, kind) = {
            let inner = self.inner.lock();
            match (&inner.local, &inner.repository) {
                (Some(local), _) => (
                    inner.name.clone(),
                    ctx.local.read_content(&inner.parent_path, &inner.name)?,
                    local.content_type.clone(),
                    local.kind,
                ),
                (None, Some(repo_item)) => {
                    if !ctx.repository.is_online() {
                        return Err(TandemError::not_connected());
                    }
                    (
                        inner.name.clone(),
                        ctx.repository.read_version(&inner.parent_path, &inner.name, repo_item.current_version)?,
                        repo_item.content_type.clone(),
                        repo_item.kind,
                    )
                }
                (None, None) => return Err(TandemError::not_found(inner.path())),
            }
        };
        monitor.check_cancelled()?;
        self.create_copy(&ctx, &dest, &name, &content, content_type, kind)
    }

    /// Copy one repository version into a new private file `name_v<version>`
    #[instrument(skip(self, monitor), fields(path = %self.path()))]
    pub fn copy_version_to(&self, version: Version, dest_parent: &str, monitor: &TaskMonitor) -> Result<String> {
        let ctx = self.ctx()?;
        let dest = normalize_parent(dest_parent)?;
        let (base_name, content, content_type, kind) = {
            let inner = self.inner.lock();
            let repo_item = inner
                .repository
                .clone()
                .ok_or_else(|| TandemError::NotVersioned(inner.path()))?;
            if repo_item.kind != ItemKind::Database {
                return Err(TandemError::unsupported(format!(
                    "{} is not a database item",
                    inner.path()
                )));
            }
            if !ctx.repository.is_online() {
                return Err(TandemError::not_connected());
            }
            let content = ctx.repository.read_version(&inner.parent_path, &inner.name, version)?;
            (
                versioned_copy_name(&inner.name, version),
                content,
                repo_item.content_type,
                repo_item.kind,
            )
        };
        monitor.check_cancelled()?;
        self.create_copy(&ctx, &dest, &base_name, &content, content_type, kind)
    }

    fn create_copy(
        &self,
        ctx: &ProjectContext,
        dest: &str,
        base_name: &str,
        content: &[u8],
        content_type: String,
        kind: ItemKind,
    ) -> Result<String> {
        let name = target_name(base_name, |n| Self::name_taken(ctx, dest, n));
        ctx.local
            .create_item(dest, &name, &NewItem::fresh(content_type, kind), content)?;
        let path = join_path(dest, &name);
        ctx.forget(&path);
        info!("Copied {} to {}", self.path(), path);
        Self::notify(ctx, &[FileEvent::StatusChanged {
            path: path.clone(),
            file_id_set: true,
        }]);
        Ok(path)
    }

    /// Delete the file
    ///
    /// A hijacked file loses only its local copy, revealing the repository
    /// file. A file with only a repository item loses its whole history.
    ///
    /// # Errors
    ///
    /// - [`TandemError::InUse`] if the file is checked out, open or busy
    #[instrument(skip(self), fields(path = %self.path()))]
    pub fn delete(&self) -> Result<()> {
        let ctx = self.ctx()?;
        let (path, gone) = {
            let mut inner = self.inner.lock();
            if ctx.local.is_read_only() {
                return Err(TandemError::read_only("local store is read-only"));
            }
            self.check_not_in_use(&inner)?;
            let state = inner
                .state()
                .ok_or_else(|| TandemError::not_found(inner.path()))?;

            let deleted_id = match state {
                FileState::CheckedOut => {
                    return Err(TandemError::in_use(format!("{} is checked out", inner.path())));
                }
                FileState::Hijacked | FileState::Private => {
                    let local = inner
                        .local
                        .clone()
                        .ok_or_else(|| TandemError::consistency("local item missing"))?;
                    ctx.local.delete_item(&inner.parent_path, &inner.name)?;
                    inner.local = None;
                    local.file_id
                }
                FileState::Versioned => {
                    if !ctx.repository.is_online() {
                        return Err(TandemError::not_connected());
                    }
                    if ctx.repository.is_read_only() {
                        return Err(TandemError::read_only("repository is read-only"));
                    }
                    let repo_item = inner
                        .repository
                        .clone()
                        .ok_or_else(|| TandemError::consistency("repository item missing"))?;
                    ctx.repository.delete_item(&inner.parent_path, &inner.name)?;
                    inner.repository = None;
                    repo_item.file_id
                }
            };

            let surviving = inner.repository.as_ref().map(|r| r.file_id.clone());
            if surviving.as_ref() != Some(&deleted_id) {
                if let Err(e) = ctx.local.remove_user_data(&deleted_id) {
                    warn!("Failed to remove user data of {}: {}", inner.path(), e);
                }
            }
            inner.file_id = surviving;
            info!("Deleted {} ({})", inner.path(), state);
            (inner.path(), inner.local.is_none() && inner.repository.is_none())
        };

        if gone {
            ctx.forget(&path);
        }
        Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set: false }]);
        Ok(())
    }

    /// Delete the oldest or latest repository version
    ///
    /// # Errors
    ///
    /// - [`TandemError::InUse`] if this file's checkout is based on `version`
    #[instrument(skip(self), fields(path = %self.path()))]
    pub fn delete_version(&self, version: Version) -> Result<()> {
        let ctx = self.ctx()?;
        let path = {
            let mut inner = self.inner.lock();
            if inner.repository.is_none() || inner.state() == Some(FileState::Hijacked) {
                return Err(TandemError::NotVersioned(inner.path()));
            }
            if !ctx.repository.is_online() {
                return Err(TandemError::not_connected());
            }
            if ctx.repository.is_read_only() {
                return Err(TandemError::read_only("repository is read-only"));
            }
            if inner
                .local_checkout()
                .is_some_and(|co| co.checkout_version == version)
            {
                return Err(TandemError::in_use(format!(
                    "version {} of {} is checked out",
                    version,
                    inner.path()
                )));
            }
            ctx.repository
                .delete_version(&inner.parent_path, &inner.name, version)?;
            Self::reload_repository_item(&ctx, &mut inner);
            inner.path()
        };
        Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set: false }]);
        Ok(())
    }

    fn add_preconditions(&self, ctx: &ProjectContext, inner: &FileInner) -> Result<(LocalItem, Arc<dyn ContentAdapter>)> {
        if !ctx.repository.is_online() {
            return Err(TandemError::not_connected());
        }
        if ctx.repository.is_read_only() {
            return Err(TandemError::read_only("repository is read-only"));
        }
        if ctx.local.is_read_only() {
            return Err(TandemError::read_only("local store is read-only"));
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(TandemError::in_use(format!("{} is busy with another operation", inner.path())));
        }
        let local = inner
            .local
            .clone()
            .ok_or_else(|| TandemError::not_found(inner.path()))?;
        if inner.repository.is_some() || local.is_checked_out() {
            return Err(TandemError::unsupported(format!("{} is already versioned", inner.path())));
        }
        let adapter = ctx.adapter(&local.content_type)?;
        if adapter.is_private_type() {
            return Err(TandemError::unsupported(format!(
                "content type '{}' cannot be versioned",
                local.content_type
            )));
        }
        Ok((local, adapter))
    }

    /// Create the repository item from a private file
    ///
    /// With `keep_checked_out` the file stays checked out against version 1;
    /// otherwise the local copy is removed unless it is open, which leaves a
    /// hijacked file. Link files are never kept checked out.
    #[instrument(skip(self, comment, monitor), fields(path = %self.path()))]
    pub fn add_to_repository(&self, comment: Option<&str>, keep_checked_out: bool, monitor: &TaskMonitor) -> Result<()> {
        let ctx = self.ctx()?;
        let mut events = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            self.add_locked(&ctx, &mut inner, comment, keep_checked_out, monitor, &mut events)
        };
        Self::notify(&ctx, &events);
        result
    }

    fn add_locked(
        &self,
        ctx: &ProjectContext,
        inner: &mut FileInner,
        comment: Option<&str>,
        keep_checked_out: bool,
        monitor: &TaskMonitor,
        events: &mut Vec<FileEvent>,
    ) -> Result<()> {
        let (local, adapter) = self.add_preconditions(ctx, inner)?;
        if inner.has_unsaved_changes() {
            return Err(TandemError::UnsavedChanges(inner.path()));
        }
        let repo = &ctx.repository;
        if repo.exists(&inner.parent_path, &inner.name)? {
            return Err(TandemError::DuplicateFile(inner.path()));
        }
        monitor.check_cancelled()?;

        let user = Self::acting_user(ctx)?;
        let content = ctx.local.read_content(&inner.parent_path, &inner.name)?;
        let new_item = NewItem {
            file_id: local.file_id.clone(),
            content_type: local.content_type.clone(),
            kind: local.kind,
        };
        let item = repo.create_item(&inner.parent_path, &inner.name, &new_item, &content, comment, &user)?;
        inner.repository = Some(item);

        if keep_checked_out && !adapter.is_link() {
            let checkout_type = Self::checkout_type(ctx, false);
            let status = repo
                .checkout(&inner.parent_path, &inner.name, checkout_type, &user, &ctx.config.project_path())?
                .ok_or_else(|| {
                    TandemError::consistency(format!("new repository item {} declined checkout", inner.path()))
                })?;
            match ctx.local.set_checkout(
                &inner.parent_path,
                &inner.name,
                status.checkout_id,
                checkout_type.is_exclusive(),
                status.checkout_version,
            ) {
                Ok(local) => inner.local = Some(local),
                Err(e) => {
                    if let Err(rollback) = repo.terminate_checkout(&inner.parent_path, &inner.name, status.checkout_id) {
                        error!("Failed to terminate checkout of {}: {}", inner.path(), rollback);
                    }
                    return Err(e);
                }
            }
            self.invalidate_open_object(inner, events);
        } else if inner.open_object.is_some() {
            self.invalidate_open_object(inner, events);
            debug!("{} is open; local copy stays as a hijacked file", inner.path());
        } else {
            ctx.local.delete_item(&inner.parent_path, &inner.name)?;
            inner.local = None;
        }

        info!("Added {} to the repository", inner.path());
        events.push(FileEvent::StatusChanged {
            path: inner.path(),
            file_id_set: false,
        });
        Ok(())
    }

    /// Give a private file a new identity
    pub fn reset_file_id(&self) -> Result<FileId> {
        let ctx = self.ctx()?;
        let (path, file_id) = {
            let mut inner = self.inner.lock();
            if inner.repository.is_some() {
                return Err(TandemError::unsupported(format!(
                    "{} has a repository item",
                    inner.path()
                )));
            }
            let local = inner
                .local
                .clone()
                .ok_or_else(|| TandemError::not_found(inner.path()))?;
            if local.is_checked_out() {
                return Err(TandemError::in_use(format!("{} is checked out", inner.path())));
            }
            let file_id = FileId::generate();
            inner.local = Some(ctx.local.reset_file_id(&inner.parent_path, &inner.name, &file_id)?);
            if let Err(e) = ctx.local.remove_user_data(&local.file_id) {
                warn!("Failed to remove user data of {}: {}", inner.path(), e);
            }
            inner.file_id = Some(file_id.clone());
            (inner.path(), file_id)
        };
        Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set: true }]);
        Ok(file_id)
    }

    /// Terminate any checkout of the repository item
    #[instrument(skip(self), fields(path = %self.path()))]
    pub fn terminate_checkout(&self, checkout_id: CheckoutId) -> Result<()> {
        let ctx = self.ctx()?;
        let path = {
            let mut inner = self.inner.lock();
            if inner.repository.is_none() {
                return Err(TandemError::NotVersioned(inner.path()));
            }
            if !ctx.repository.is_online() {
                return Err(TandemError::not_connected());
            }
            ctx.repository
                .terminate_checkout(&inner.parent_path, &inner.name, checkout_id)?;
            self.refresh_locked(&ctx, &mut inner)?;
            inner.path()
        };
        Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set: false }]);
        Ok(())
    }

    /// Turn a versioned file of a local repository into a private file
    ///
    /// A checked-out file keeps its local content; otherwise the latest
    /// version is copied. The repository history is deleted either way.
    #[instrument(skip(self, monitor), fields(path = %self.path()))]
    pub fn convert_to_private(&self, monitor: &TaskMonitor) -> Result<()> {
        let ctx = self.ctx()?;
        let path = {
            let mut inner = self.inner.lock();
            let repo = &ctx.repository;
            if !repo.is_local() {
                return Err(TandemError::unsupported(
                    "only files of a local repository can be converted to private files",
                ));
            }
            if !repo.is_online() {
                return Err(TandemError::not_connected());
            }
            if ctx.local.is_read_only() {
                return Err(TandemError::read_only("local store is read-only"));
            }
            self.check_not_in_use(&inner)?;
            monitor.check_cancelled()?;

            match inner.state() {
                Some(FileState::CheckedOut) => {
                    let (_, checkout) = Self::checked_out_local(&inner)?;
                    repo.terminate_checkout(&inner.parent_path, &inner.name, checkout.checkout_id)?;
                    let local = ctx.local.clear_checkout(&inner.parent_path, &inner.name)?;
                    inner.local = Some(local);
                    repo.delete_item(&inner.parent_path, &inner.name)?;
                    inner.repository = None;
                }
                Some(FileState::Versioned) => {
                    let repo_item = inner
                        .repository
                        .clone()
                        .ok_or_else(|| TandemError::consistency("repository item missing"))?;
                    let content = repo.read_version(&inner.parent_path, &inner.name, repo_item.current_version)?;
                    let temp = target_name(&inner.name, |n| Self::name_taken(&ctx, &inner.parent_path, n));
                    let new_item = NewItem {
                        file_id: repo_item.file_id.clone(),
                        content_type: repo_item.content_type.clone(),
                        kind: repo_item.kind,
                    };
                    ctx.local.create_item(&inner.parent_path, &temp, &new_item, &content)?;
                    if let Err(e) = repo.delete_item(&inner.parent_path, &inner.name) {
                        if let Err(cleanup) = ctx.local.delete_item(&inner.parent_path, &temp) {
                            error!("Failed to remove private copy {}: {}", temp, cleanup);
                        }
                        return Err(e);
                    }
                    inner.repository = None;
                    let local = ctx
                        .local
                        .move_item(&inner.parent_path, &temp, &inner.parent_path, &inner.name)?;
                    inner.local = Some(local);
                }
                _ => return Err(TandemError::NotVersioned(inner.path())),
            }
            info!("Converted {} to a private file", inner.path());
            inner.path()
        };
        Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set: false }]);
        Ok(())
    }

    /// Write the visible content to `dest` on the filesystem
    ///
    /// Returns the number of bytes written.
    #[instrument(skip(self), fields(path = %self.path()))]
    pub fn export(&self, dest: &Path) -> Result<u64> {
        let ctx = self.ctx()?;
        let content = {
            let inner = self.inner.lock();
            match (&inner.local, &inner.repository) {
                (Some(_), _) => ctx.local.read_content(&inner.parent_path, &inner.name)?,
                (None, Some(repo_item)) => {
                    if !ctx.repository.is_online() {
                        return Err(TandemError::not_connected());
                    }
                    ctx.repository
                        .read_version(&inner.parent_path, &inner.name, repo_item.current_version)?
                }
                (None, None) => return Err(TandemError::not_found(inner.path())),
            }
        };
        atomic_write(dest, &content)?;
        Ok(content.len() as u64)
    }

    // ------------------------------------------------------------------
    // Domain objects and recovery
    // ------------------------------------------------------------------

    /// Open the file for editing
    ///
    /// Returns the already open object if there is one. With `ok_to_recover`
    /// pending crash-recovery data becomes the initial (unsaved) content;
    /// otherwise it is discarded. Files with only a repository item open
    /// read-only at the latest version.
    pub fn open_for_update(&self, ok_to_recover: bool) -> Result<DomainObjectHandle> {
        let ctx = self.ctx()?;
        let mut inner = self.inner.lock();
        if let Some(object) = &inner.open_object {
            object.add_consumer();
            return Ok(object.clone());
        }
        let path = inner.path();

        let Some(local) = inner.local.clone() else {
            let repo_item = inner
                .repository
                .clone()
                .ok_or_else(|| TandemError::not_found(path.clone()))?;
            if !ctx.repository.is_online() {
                return Err(TandemError::not_connected());
            }
            let content = ctx
                .repository
                .read_version(&inner.parent_path, &inner.name, repo_item.current_version)?;
            return Ok(DomainObjectHandle::new(
                &inner.name,
                &path,
                self.generation.clone(),
                content,
                repo_item.current_version,
                true,
                false,
            ));
        };

        let mut recovered = false;
        let content = match ctx.local.read_recovery(&inner.parent_path, &inner.name)? {
            Some(snapshot) if ok_to_recover => {
                info!("Recovered unsaved changes of {}", path);
                recovered = true;
                snapshot
            }
            Some(_) => {
                info!("Discarding recovery data of {}", path);
                ctx.local.write_recovery(&inner.parent_path, &inner.name, None)?;
                inner.local = ctx.local.get_item(&inner.parent_path, &inner.name)?;
                ctx.local.read_content(&inner.parent_path, &inner.name)?
            }
            None => ctx.local.read_content(&inner.parent_path, &inner.name)?,
        };
        let object = DomainObjectHandle::new(
            &inner.name,
            &path,
            self.generation.clone(),
            content,
            local.checkout.map(|co| co.checkout_version).unwrap_or(local.current_version),
            local.read_only,
            recovered,
        );
        inner.open_object = Some(object.clone());
        debug!("Opened {} for update", path);
        Ok(object)
    }

    /// Open an immutable view of the visible content or of a repository version
    pub fn open_read_only(&self, version: Option<Version>) -> Result<DomainObjectHandle> {
        let ctx = self.ctx()?;
        let inner = self.inner.lock();
        let path = inner.path();
        let (content, shown) = match (version, &inner.local, &inner.repository) {
            (None, Some(local), _) => (
                ctx.local.read_content(&inner.parent_path, &inner.name)?,
                local.current_version,
            ),
            (None, None, Some(repo_item)) => (
                ctx.repository
                    .read_version(&inner.parent_path, &inner.name, repo_item.current_version)?,
                repo_item.current_version,
            ),
            (Some(v), _, Some(_)) => (ctx.repository.read_version(&inner.parent_path, &inner.name, v)?, v),
            (Some(_), _, None) => return Err(TandemError::NotVersioned(path)),
            (None, None, None) => return Err(TandemError::not_found(path)),
        };
        Ok(DomainObjectHandle::new(
            &inner.name,
            &path,
            self.generation.clone(),
            content,
            shown,
            true,
            false,
        ))
    }

    /// Save the open domain object into the local item
    pub fn save(&self, object: &DomainObjectHandle) -> Result<()> {
        let ctx = self.ctx()?;
        let path = {
            let mut inner = self.inner.lock();
            let is_open = inner
                .open_object
                .as_ref()
                .is_some_and(|open| open.same_object(object));
            if !is_open {
                object.ensure_current()?;
                return Err(TandemError::InvalidArgument(format!(
                    "domain object is not the open object of {}",
                    inner.path()
                )));
            }
            object.ensure_current()?;
            if object.is_read_only() {
                return Err(TandemError::read_only(format!("{} was opened read-only", inner.path())));
            }
            if inner.local.is_none() {
                return Err(TandemError::consistency(format!("{} has no local item", inner.path())));
            }
            let local = ctx
                .local
                .write_content(&inner.parent_path, &inner.name, &object.content())?;
            ctx.local.write_recovery(&inner.parent_path, &inner.name, None)?;
            object.mark_saved();
            inner.local = Some(ctx.local.get_item(&inner.parent_path, &inner.name)?.unwrap_or(local));
            debug!("Saved {}", inner.path());
            inner.path()
        };
        Self::notify(&ctx, &[FileEvent::StatusChanged { path, file_id_set: false }]);
        Ok(())
    }

    /// Release one consumer of a domain object
    ///
    /// The last release closes the object and discards unsaved edits and
    /// their recovery data.
    pub fn release(&self, object: &DomainObjectHandle) -> Result<()> {
        let ctx = self.ctx()?;
        let closed = {
            let mut inner = self.inner.lock();
            let is_open = inner
                .open_object
                .as_ref()
                .is_some_and(|open| open.same_object(object));
            if object.remove_consumer() > 0 || !is_open {
                None
            } else {
                inner.open_object = None;
                if object.is_changed() {
                    debug!("Discarding unsaved changes of {}", inner.path());
                }
                if inner.local.as_ref().is_some_and(|l| l.has_recovery) {
                    ctx.local.write_recovery(&inner.parent_path, &inner.name, None)?;
                    inner.local = ctx.local.get_item(&inner.parent_path, &inner.name)?;
                }
                Some(inner.path())
            }
        };
        if let Some(path) = closed {
            Self::notify(&ctx, &[FileEvent::ObjectClosed { path }]);
        }
        Ok(())
    }

    /// Open domain object, if any
    pub fn open_object(&self) -> Option<DomainObjectHandle> {
        self.inner.lock().open_object.clone()
    }

    /// Store unsaved edits of the open object as crash-recovery data
    ///
    /// Returns whether a snapshot was written. Skips files that are busy or
    /// have nothing to snapshot.
    pub fn take_recovery_snapshot(&self) -> Result<bool> {
        let Some(_busy) = BusyGuard::try_acquire(&self.busy) else {
            trace!("Skipping recovery snapshot of busy {}", self.path());
            return Ok(false);
        };
        let ctx = self.ctx()?;
        let mut inner = self.inner.lock();
        let Some(object) = inner.open_object.clone() else {
            return Ok(false);
        };
        if !object.is_changed() || object.is_stale() || inner.local.is_none() {
            return Ok(false);
        }
        ctx.local
            .write_recovery(&inner.parent_path, &inner.name, Some(&object.content()))?;
        inner.local = ctx.local.get_item(&inner.parent_path, &inner.name)?;
        debug!("Wrote recovery snapshot of {}", inner.path());
        Ok(true)
    }

    /// Write `content` as a fresh private keep file next to the file
    ///
    /// A previous `<name>.keep` file is replaced. Failures are logged only.
    fn create_keep_file(&self, ctx: &ProjectContext, parent: &str, name: &str, local: &LocalItem, content: &[u8]) {
        let previous = format!("{}{}", name, KEEP_SUFFIX);
        if ctx.local.exists(parent, &previous).unwrap_or(false) {
            if let Err(e) = ctx.local.delete_item(parent, &previous) {
                warn!("Failed to remove previous keep file {}: {}", join_path(parent, &previous), e);
            }
        }
        let keep = keep_name(name, |n| Self::name_taken(ctx, parent, n));
        let new_item = NewItem::fresh(local.content_type.clone(), local.kind);
        match ctx.local.create_item(parent, &keep, &new_item, content) {
            Ok(_) => {
                let path = join_path(parent, &keep);
                ctx.forget(&path);
                info!("Wrote keep file {}", path);
            }
            Err(e) => error!("Failed to write keep file for {}: {}", join_path(parent, name), e),
        }
    }
}
