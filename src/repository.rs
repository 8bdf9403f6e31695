//! Filesystem-backed repository store
//!
//! The repository keeps a linear version history plus a checkout table for
//! every shared item. Version content is LZ4-compressed and verified against
//! its SHA-256 digest on every read.
//!
//! ## Layout
//!
//! ```text
//! repo_root/
//! ├── repository.json            # Repository options and metadata
//! ├── repository.lock            # Mutation lock
//! └── <folder>/...
//!     └── <name>.repo/
//!         ├── history.json       # Identity and version history
//!         ├── checkouts.bin      # Checkout table (bincode)
//!         └── versions/
//!             └── <n>.lz4        # Content of version n
//! ```
//!
//! ## Connectivity
//!
//! A repository can be taken offline with [`FsRepository::set_online`], which
//! makes every data operation fail with [`TandemError::NotConnected`]. This is
//! how a server repository behaves when its connection drops.
//!
//! ## Thread Safety
//!
//! All mutations hold an exclusive file lock on `repository.lock` in the
//! repository root, so separate handles, projects and processes opened on
//! the same root serialize against each other. Reads of immutable version
//! files happen without it.

use crate::error::{Result, TandemError};
use crate::store::RepositoryStore;
use crate::types::{
    CheckoutId, CheckoutStatus, CheckoutType, FileId, ItemKind, NewItem, RepositoryItem, Version,
    VersionInfo,
};
use crate::utils::{atomic_write, folder_dir, hash_data, remove_dir_if_empty};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

const REPO_EXT: &str = ".repo";
const HISTORY_FILE: &str = "history.json";
const CHECKOUTS_FILE: &str = "checkouts.bin";
const VERSIONS_DIR: &str = "versions";
const REPOSITORY_FILE: &str = "repository.json";
const LOCK_FILE: &str = "repository.lock";

/// Behavior switches of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryOptions {
    /// Allow several normal checkouts of one item
    pub shared: bool,
    /// Reject all writes
    pub read_only: bool,
    /// Behave like a server repository that authenticates its user
    pub authenticated: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            shared: true,
            read_only: false,
            authenticated: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepositoryMetadata {
    format_version: u32,
    tandem_version: String,
    created_at: DateTime<Utc>,
    options: RepositoryOptions,
}

/// Persisted identity and history of one item
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemRecord {
    file_id: FileId,
    content_type: String,
    kind: ItemKind,
    versions: Vec<VersionInfo>,
    next_checkout_id: CheckoutId,
}

impl ItemRecord {
    fn tip(&self) -> Result<&VersionInfo> {
        self.versions
            .last()
            .ok_or_else(|| TandemError::consistency("repository item without versions"))
    }
}

/// Exclusive hold on `repository.lock`
///
/// Closing the handle on drop releases the lock.
struct RepositoryLock {
    _file: File,
}

/// Repository keeping version histories on the filesystem
pub struct FsRepository {
    root: PathBuf,
    options: RwLock<RepositoryOptions>,
    online: AtomicBool,
    user: RwLock<Option<String>>,
}

impl std::fmt::Debug for FsRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsRepository")
            .field("root", &self.root)
            .field("options", &*self.options.read())
            .field("online", &self.online.load(Ordering::SeqCst))
            .field("user", &*self.user.read())
            .finish()
    }
}

impl FsRepository {
    /// Initialize a new repository at `root`
    ///
    /// # Errors
    ///
    /// - [`TandemError::InvalidArgument`] if a repository already exists at `root`
    /// - [`TandemError::Io`] if the folder cannot be created
    pub fn init(root: PathBuf, options: RepositoryOptions, user: impl Into<String>) -> Result<Self> {
        if root.join(REPOSITORY_FILE).exists() {
            return Err(TandemError::InvalidArgument(format!(
                "repository already exists at {:?}",
                root
            )));
        }
        fs::create_dir_all(&root)?;

        let metadata = RepositoryMetadata {
            format_version: 1,
            tandem_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            options,
        };
        atomic_write(&root.join(REPOSITORY_FILE), serde_json::to_string_pretty(&metadata)?.as_bytes())?;

        info!("Initialized repository at {:?} (shared: {})", root, options.shared);
        Ok(Self::new_unchecked(root, options, user.into()))
    }

    /// Open an existing repository
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotFound`] if no repository exists at `root`
    pub fn open(root: PathBuf, user: impl Into<String>) -> Result<Self> {
        let meta_path = root.join(REPOSITORY_FILE);
        if !meta_path.exists() {
            return Err(TandemError::not_found(format!("no repository at {:?}", root)));
        }
        let metadata: RepositoryMetadata = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
        debug!("Opened repository at {:?} (format {})", root, metadata.format_version);
        Ok(Self::new_unchecked(root, metadata.options, user.into()))
    }

    /// Initialize new repository or open existing repository
    pub fn init_or_open(root: PathBuf, options: RepositoryOptions, user: impl Into<String>) -> Result<Self> {
        if root.join(REPOSITORY_FILE).exists() {
            Self::open(root, user)
        } else {
            Self::init(root, options, user)
        }
    }

    fn new_unchecked(root: PathBuf, options: RepositoryOptions, user: String) -> Self {
        Self {
            root,
            options: RwLock::new(options),
            online: AtomicBool::new(true),
            user: RwLock::new(Some(user)),
        }
    }

    /// Block until this handle holds the repository-wide mutation lock
    fn lock(&self) -> Result<RepositoryLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        trace!("Acquired repository lock on {:?}", self.root);
        Ok(RepositoryLock { _file: file })
    }

    /// Root folder of the repository
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Simulate connecting to or disconnecting from the repository
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        info!("Repository {:?} is now {}", self.root, if online { "online" } else { "offline" });
    }

    /// Change the authenticated user; `None` drops the session
    pub fn set_user(&self, user: Option<String>) {
        *self.user.write() = user;
    }

    /// Toggle write protection
    pub fn set_read_only(&self, read_only: bool) {
        self.options.write().read_only = read_only;
    }

    fn item_dir(&self, parent: &str, name: &str) -> PathBuf {
        folder_dir(&self.root, parent).join(format!("{}{}", name, REPO_EXT))
    }

    fn version_path(dir: &Path, version: Version) -> PathBuf {
        dir.join(VERSIONS_DIR).join(format!("{}.lz4", version))
    }

    fn check_online(&self) -> Result<()> {
        if !self.is_online() {
            return Err(TandemError::not_connected());
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_online()?;
        if self.is_read_only() {
            return Err(TandemError::read_only("repository is read-only"));
        }
        Ok(())
    }

    fn load_record(&self, dir: &Path) -> Result<Option<ItemRecord>> {
        match fs::read_to_string(dir.join(HISTORY_FILE)) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn require_record(&self, parent: &str, name: &str) -> Result<(PathBuf, ItemRecord)> {
        let dir = self.item_dir(parent, name);
        let record = self
            .load_record(&dir)?
            .ok_or_else(|| TandemError::not_found(format!("repository item {}/{}", parent, name)))?;
        Ok((dir, record))
    }

    fn store_record(&self, dir: &Path, record: &ItemRecord) -> Result<()> {
        atomic_write(&dir.join(HISTORY_FILE), serde_json::to_string_pretty(record)?.as_bytes())
    }

    fn load_checkouts(&self, dir: &Path) -> Result<Vec<CheckoutStatus>> {
        match fs::read(dir.join(CHECKOUTS_FILE)) {
            Ok(bytes) => {
                let (checkouts, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
                Ok(checkouts)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store_checkouts(&self, dir: &Path, checkouts: &[CheckoutStatus]) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(checkouts, bincode::config::standard())?;
        atomic_write(&dir.join(CHECKOUTS_FILE), &bytes)
    }

    fn write_version(&self, dir: &Path, version: Version, content: &[u8], comment: Option<&str>, user: &str) -> Result<VersionInfo> {
        let compressed = lz4_flex::compress_prepend_size(content);
        atomic_write(&Self::version_path(dir, version), &compressed)?;
        trace!(
            "Stored version {} ({} -> {} bytes)",
            version,
            content.len(),
            compressed.len()
        );
        Ok(VersionInfo {
            version,
            user: user.to_string(),
            comment: comment.map(str::to_string),
            created_at: Utc::now(),
            digest: hash_data(content),
            length: content.len() as u64,
        })
    }

    fn to_item(parent: &str, name: &str, record: &ItemRecord) -> Result<RepositoryItem> {
        let tip = record.tip()?;
        Ok(RepositoryItem {
            parent_path: parent.to_string(),
            name: name.to_string(),
            file_id: record.file_id.clone(),
            content_type: record.content_type.clone(),
            kind: record.kind,
            current_version: tip.version,
            last_modified: tip.created_at,
            length: tip.length,
        })
    }
}

impl RepositoryStore for FsRepository {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn is_shared(&self) -> bool {
        self.options.read().shared
    }

    fn is_read_only(&self) -> bool {
        self.options.read().read_only
    }

    fn is_local(&self) -> bool {
        !self.options.read().authenticated
    }

    fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    fn get_item(&self, parent: &str, name: &str) -> Result<Option<RepositoryItem>> {
        self.check_online()?;
        let dir = self.item_dir(parent, name);
        match self.load_record(&dir)? {
            Some(record) => Ok(Some(Self::to_item(parent, name, &record)?)),
            None => Ok(None),
        }
    }

    fn exists(&self, parent: &str, name: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.item_dir(parent, name).join(HISTORY_FILE).exists())
    }

    fn create_item(
        &self,
        parent: &str,
        name: &str,
        item: &NewItem,
        content: &[u8],
        comment: Option<&str>,
        user: &str,
    ) -> Result<RepositoryItem> {
        self.check_writable()?;
        let _guard = self.lock()?;
        let dir = self.item_dir(parent, name);
        if dir.exists() {
            return Err(TandemError::DuplicateFile(format!("{}/{}", parent, name)));
        }

        let info = self.write_version(&dir, 1, content, comment, user)?;
        let record = ItemRecord {
            file_id: item.file_id.clone(),
            content_type: item.content_type.clone(),
            kind: item.kind,
            versions: vec![info],
            next_checkout_id: 1,
        };
        self.store_record(&dir, &record)?;

        info!("Created repository item {}/{} (version 1)", parent, name);
        Self::to_item(parent, name, &record)
    }

    fn read_version(&self, parent: &str, name: &str, version: Version) -> Result<Vec<u8>> {
        self.check_online()?;
        let (dir, record) = self.require_record(parent, name)?;
        let info = record
            .versions
            .iter()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                TandemError::not_found(format!("version {} of {}/{}", version, parent, name))
            })?;

        let compressed = fs::read(Self::version_path(&dir, version))?;
        let content = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
            TandemError::CorruptionDetected(format!("version {} of {}/{}: {}", version, parent, name, e))
        })?;
        if hash_data(&content) != info.digest {
            return Err(TandemError::CorruptionDetected(format!(
                "digest mismatch for version {} of {}/{}",
                version, parent, name
            )));
        }
        Ok(content)
    }

    fn versions(&self, parent: &str, name: &str) -> Result<Vec<VersionInfo>> {
        self.check_online()?;
        let (_, record) = self.require_record(parent, name)?;
        Ok(record.versions)
    }

    fn checkout(
        &self,
        parent: &str,
        name: &str,
        checkout_type: CheckoutType,
        user: &str,
        project_path: &str,
    ) -> Result<Option<CheckoutStatus>> {
        self.check_writable()?;
        let _guard = self.lock()?;
        let (dir, mut record) = self.require_record(parent, name)?;
        let mut checkouts = self.load_checkouts(&dir)?;

        let blocked = checkouts.iter().any(|c| c.checkout_type.is_exclusive())
            || (!checkouts.is_empty() && (checkout_type.is_exclusive() || !self.is_shared()));
        if blocked {
            debug!(
                "Checkout of {}/{} declined: {} existing checkout(s)",
                parent,
                name,
                checkouts.len()
            );
            return Ok(None);
        }

        let status = CheckoutStatus {
            checkout_id: record.next_checkout_id,
            checkout_type,
            user: user.to_string(),
            checkout_version: record.tip()?.version,
            project_path: project_path.to_string(),
            checkout_time: Utc::now(),
        };
        record.next_checkout_id += 1;
        checkouts.push(status.clone());
        self.store_checkouts(&dir, &checkouts)?;
        self.store_record(&dir, &record)?;

        info!(
            "Checked out {}/{} version {} (id {}, {:?})",
            parent, name, status.checkout_version, status.checkout_id, checkout_type
        );
        Ok(Some(status))
    }

    fn get_checkout(&self, parent: &str, name: &str, checkout_id: CheckoutId) -> Result<Option<CheckoutStatus>> {
        self.check_online()?;
        let (dir, _) = self.require_record(parent, name)?;
        Ok(self
            .load_checkouts(&dir)?
            .into_iter()
            .find(|c| c.checkout_id == checkout_id))
    }

    fn checkouts(&self, parent: &str, name: &str) -> Result<Vec<CheckoutStatus>> {
        self.check_online()?;
        let (dir, _) = self.require_record(parent, name)?;
        self.load_checkouts(&dir)
    }

    fn terminate_checkout(&self, parent: &str, name: &str, checkout_id: CheckoutId) -> Result<()> {
        self.check_online()?;
        let _guard = self.lock()?;
        let (dir, _) = self.require_record(parent, name)?;
        let mut checkouts = self.load_checkouts(&dir)?;
        let before = checkouts.len();
        checkouts.retain(|c| c.checkout_id != checkout_id);
        if checkouts.len() != before {
            self.store_checkouts(&dir, &checkouts)?;
            info!("Terminated checkout {} of {}/{}", checkout_id, parent, name);
        }
        Ok(())
    }

    fn update_checkout_version(
        &self,
        parent: &str,
        name: &str,
        checkout_id: CheckoutId,
        version: Version,
    ) -> Result<()> {
        self.check_online()?;
        let _guard = self.lock()?;
        let (dir, record) = self.require_record(parent, name)?;
        if !record.versions.iter().any(|v| v.version == version) {
            return Err(TandemError::not_found(format!("version {} of {}/{}", version, parent, name)));
        }
        let mut checkouts = self.load_checkouts(&dir)?;
        let checkout = checkouts
            .iter_mut()
            .find(|c| c.checkout_id == checkout_id)
            .ok_or_else(|| TandemError::NotCheckedOut(format!("checkout {} of {}/{}", checkout_id, parent, name)))?;
        checkout.checkout_version = version;
        self.store_checkouts(&dir, &checkouts)
    }

    fn commit_version(
        &self,
        parent: &str,
        name: &str,
        checkout_id: CheckoutId,
        expected_tip: Version,
        content: &[u8],
        comment: Option<&str>,
        user: &str,
    ) -> Result<Version> {
        self.check_writable()?;
        let _guard = self.lock()?;
        let (dir, mut record) = self.require_record(parent, name)?;

        if !self.load_checkouts(&dir)?.iter().any(|c| c.checkout_id == checkout_id) {
            return Err(TandemError::NotCheckedOut(format!(
                "checkout {} of {}/{} is no longer active",
                checkout_id, parent, name
            )));
        }
        let tip = record.tip()?.version;
        if tip != expected_tip {
            return Err(TandemError::VersionConflict {
                expected: expected_tip,
                actual: tip,
            });
        }

        let version = tip + 1;
        let info = self.write_version(&dir, version, content, comment, user)?;
        record.versions.push(info);
        self.store_record(&dir, &record)?;

        info!("Committed version {} of {}/{}", version, parent, name);
        Ok(version)
    }

    fn delete_version(&self, parent: &str, name: &str, version: Version) -> Result<()> {
        self.check_writable()?;
        let _guard = self.lock()?;
        let (dir, mut record) = self.require_record(parent, name)?;

        if record.versions.len() < 2 {
            return Err(TandemError::InvalidArgument(
                "the only version of an item cannot be deleted; delete the item instead".to_string(),
            ));
        }
        let first = record.versions.first().map(|v| v.version);
        let last = record.versions.last().map(|v| v.version);
        if Some(version) != first && Some(version) != last {
            return Err(TandemError::InvalidArgument(format!(
                "only the oldest or latest version can be deleted, not {}",
                version
            )));
        }
        if self
            .load_checkouts(&dir)?
            .iter()
            .any(|c| c.checkout_version == version)
        {
            return Err(TandemError::in_use(format!(
                "version {} of {}/{} is checked out",
                version, parent, name
            )));
        }

        record.versions.retain(|v| v.version != version);
        self.store_record(&dir, &record)?;
        if let Err(e) = fs::remove_file(Self::version_path(&dir, version)) {
            warn!("Failed to remove content of deleted version {}: {}", version, e);
        }
        info!("Deleted version {} of {}/{}", version, parent, name);
        Ok(())
    }

    fn delete_item(&self, parent: &str, name: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.lock()?;
        let (dir, _) = self.require_record(parent, name)?;
        let checkouts = self.load_checkouts(&dir)?;
        if !checkouts.is_empty() {
            return Err(TandemError::in_use(format!(
                "{}/{} has {} active checkout(s)",
                parent,
                name,
                checkouts.len()
            )));
        }
        fs::remove_dir_all(&dir)?;
        if parent != "/" {
            remove_dir_if_empty(&folder_dir(&self.root, parent))?;
        }
        info!("Deleted repository item {}/{}", parent, name);
        Ok(())
    }

    fn move_item(&self, parent: &str, name: &str, new_parent: &str, new_name: &str) -> Result<RepositoryItem> {
        self.check_writable()?;
        let _guard = self.lock()?;
        let (dir, record) = self.require_record(parent, name)?;
        if !self.load_checkouts(&dir)?.is_empty() {
            return Err(TandemError::in_use(format!("{}/{} is checked out", parent, name)));
        }
        let new_dir = self.item_dir(new_parent, new_name);
        if new_dir.exists() {
            return Err(TandemError::DuplicateFile(format!("{}/{}", new_parent, new_name)));
        }
        fs::create_dir_all(folder_dir(&self.root, new_parent))?;
        fs::rename(&dir, &new_dir)?;
        if parent != "/" {
            remove_dir_if_empty(&folder_dir(&self.root, parent))?;
        }
        info!("Moved repository item {}/{} to {}/{}", parent, name, new_parent, new_name);
        Self::to_item(new_parent, new_name, &record)
    }

    fn list_items(&self) -> Result<Vec<RepositoryItem>> {
        self.check_online()?;
        let mut items = Vec::new();
        let mut walker = WalkDir::new(&self.root).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| TandemError::internal(format!("walk failed: {}", e)))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = dir_name.strip_suffix(REPO_EXT) else {
                continue;
            };
            walker.skip_current_dir();

            let Some(rel_dir) = entry.path().parent().and_then(|p| p.strip_prefix(&self.root).ok()) else {
                continue;
            };
            let parent = format!(
                "/{}",
                rel_dir
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/")
            );
            match self.load_record(entry.path()) {
                Ok(Some(record)) => items.push(Self::to_item(&parent, name, &record)?),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable repository item {}/{}: {}", parent, name, e),
            }
        }
        items.sort_by(|a, b| (&a.parent_path, &a.name).cmp(&(&b.parent_path, &b.name)));
        Ok(items)
    }
}
