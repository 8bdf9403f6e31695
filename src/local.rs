//! Filesystem-backed local item store
//!
//! ## Layout
//!
//! ```text
//! local_root/
//! ├── local.json                 # Store metadata
//! ├── .userdata/
//! │   └── <file_id>.bin          # Auxiliary user data per file identity
//! └── <folder>/...
//!     ├── <name>.item            # Item content
//!     ├── <name>.meta.json       # Identity, versions, checkout metadata
//!     └── <name>.recovery        # Crash-recovery snapshot (optional)
//! ```
//!
//! The metadata file is the item's presence marker: an item exists iff its
//! `.meta.json` exists. Content is written before metadata so a crash never
//! exposes metadata pointing at missing content.

use crate::error::{Result, TandemError};
use crate::store::LocalStore;
use crate::types::{CheckoutId, FileId, ItemKind, LocalCheckout, LocalItem, NewItem, Version};
use crate::utils::{atomic_write, folder_dir, remove_dir_if_empty};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

const ITEM_EXT: &str = ".item";
const META_EXT: &str = ".meta.json";
const RECOVERY_EXT: &str = ".recovery";
const USER_DATA_DIR: &str = ".userdata";
const STORE_FILE: &str = "local.json";

/// Persisted store metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalStoreMetadata {
    format_version: u32,
    tandem_version: String,
    created_at: DateTime<Utc>,
}

/// Persisted per-item metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalItemMeta {
    file_id: FileId,
    content_type: String,
    kind: ItemKind,
    current_version: Version,
    checkout: Option<LocalCheckout>,
    read_only: bool,
    last_modified: DateTime<Utc>,
}

/// Local store keeping one item per path on the filesystem
pub struct FsLocalStore {
    root: PathBuf,
    read_only: AtomicBool,
    /// Serializes multi-file mutations (move, replace)
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for FsLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsLocalStore")
            .field("root", &self.root)
            .field("read_only", &self.read_only.load(Ordering::SeqCst))
            .finish()
    }
}

impl FsLocalStore {
    /// Initialize a new local store at `root`
    ///
    /// # Errors
    ///
    /// - [`TandemError::InvalidArgument`] if a store already exists at `root`
    /// - [`TandemError::Io`] if the folder cannot be created
    pub fn init(root: PathBuf) -> Result<Self> {
        if root.join(STORE_FILE).exists() {
            return Err(TandemError::InvalidArgument(format!(
                "local store already exists at {:?}",
                root
            )));
        }
        fs::create_dir_all(root.join(USER_DATA_DIR))?;

        let metadata = LocalStoreMetadata {
            format_version: 1,
            tandem_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
        };
        atomic_write(&root.join(STORE_FILE), serde_json::to_string_pretty(&metadata)?.as_bytes())?;

        info!("Initialized local store at {:?}", root);
        Ok(Self::new_unchecked(root))
    }

    /// Open an existing local store
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotFound`] if no store exists at `root`
    pub fn open(root: PathBuf) -> Result<Self> {
        let meta_path = root.join(STORE_FILE);
        if !meta_path.exists() {
            return Err(TandemError::not_found(format!("no local store at {:?}", root)));
        }
        let metadata: LocalStoreMetadata = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
        debug!("Opened local store at {:?} (format {})", root, metadata.format_version);
        Ok(Self::new_unchecked(root))
    }

    /// Initialize new store or open existing store
    pub fn init_or_open(root: PathBuf) -> Result<Self> {
        if root.join(STORE_FILE).exists() {
            Self::open(root)
        } else {
            Self::init(root)
        }
    }

    fn new_unchecked(root: PathBuf) -> Self {
        Self {
            root,
            read_only: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Root folder of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Toggle write protection of the whole store
    pub fn set_store_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn item_path(&self, parent: &str, name: &str, ext: &str) -> PathBuf {
        folder_dir(&self.root, parent).join(format!("{}{}", name, ext))
    }

    fn user_data_path(&self, file_id: &FileId) -> PathBuf {
        self.root.join(USER_DATA_DIR).join(format!("{}.bin", file_id))
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TandemError::read_only("local store is read-only"));
        }
        Ok(())
    }

    fn load_meta(&self, parent: &str, name: &str) -> Result<Option<LocalItemMeta>> {
        let path = self.item_path(parent, name, META_EXT);
        match fs::read_to_string(&path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn require_meta(&self, parent: &str, name: &str) -> Result<LocalItemMeta> {
        self.load_meta(parent, name)?
            .ok_or_else(|| TandemError::not_found(format!("local item {}/{}", parent, name)))
    }

    fn store_meta(&self, parent: &str, name: &str, meta: &LocalItemMeta) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        atomic_write(&self.item_path(parent, name, META_EXT), json.as_bytes())
    }

    fn to_item(&self, parent: &str, name: &str, meta: LocalItemMeta) -> LocalItem {
        let length = fs::metadata(self.item_path(parent, name, ITEM_EXT))
            .map(|m| m.len())
            .unwrap_or(0);
        LocalItem {
            parent_path: parent.to_string(),
            name: name.to_string(),
            file_id: meta.file_id,
            content_type: meta.content_type,
            kind: meta.kind,
            current_version: meta.current_version,
            checkout: meta.checkout,
            read_only: meta.read_only,
            has_recovery: self.item_path(parent, name, RECOVERY_EXT).exists(),
            last_modified: meta.last_modified,
            length,
        }
    }

    fn update_meta<F>(&self, parent: &str, name: &str, update: F) -> Result<LocalItem>
    where
        F: FnOnce(&mut LocalItemMeta),
    {
        self.check_writable()?;
        let mut meta = self.require_meta(parent, name)?;
        update(&mut meta);
        self.store_meta(parent, name, &meta)?;
        Ok(self.to_item(parent, name, meta))
    }

    /// Move the three files of an item; callers hold the write lock
    fn relocate(&self, parent: &str, name: &str, new_parent: &str, new_name: &str) -> Result<()> {
        fs::create_dir_all(folder_dir(&self.root, new_parent))?;
        for ext in [ITEM_EXT, RECOVERY_EXT, META_EXT] {
            let from = self.item_path(parent, name, ext);
            if from.exists() {
                fs::rename(&from, self.item_path(new_parent, new_name, ext))?;
            }
        }
        if parent != "/" {
            remove_dir_if_empty(&folder_dir(&self.root, parent))?;
        }
        Ok(())
    }
}

impl LocalStore for FsLocalStore {
    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn get_item(&self, parent: &str, name: &str) -> Result<Option<LocalItem>> {
        Ok(self
            .load_meta(parent, name)?
            .map(|meta| self.to_item(parent, name, meta)))
    }

    fn exists(&self, parent: &str, name: &str) -> Result<bool> {
        Ok(self.item_path(parent, name, META_EXT).exists())
    }

    fn create_item(&self, parent: &str, name: &str, item: &NewItem, content: &[u8]) -> Result<LocalItem> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        if self.exists(parent, name)? {
            return Err(TandemError::DuplicateFile(format!("{}/{}", parent, name)));
        }

        atomic_write(&self.item_path(parent, name, ITEM_EXT), content)?;
        let meta = LocalItemMeta {
            file_id: item.file_id.clone(),
            content_type: item.content_type.clone(),
            kind: item.kind,
            current_version: 1,
            checkout: None,
            read_only: false,
            last_modified: Utc::now(),
        };
        self.store_meta(parent, name, &meta)?;

        trace!("Created local item {}/{} ({} bytes)", parent, name, content.len());
        Ok(self.to_item(parent, name, meta))
    }

    fn read_content(&self, parent: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.item_path(parent, name, ITEM_EXT);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                TandemError::not_found(format!("local item {}/{}", parent, name))
            }
            _ => e.into(),
        })
    }

    fn write_content(&self, parent: &str, name: &str, content: &[u8]) -> Result<LocalItem> {
        self.check_writable()?;
        let mut meta = self.require_meta(parent, name)?;
        if meta.read_only {
            return Err(TandemError::read_only(format!("{}/{} is read-only", parent, name)));
        }
        atomic_write(&self.item_path(parent, name, ITEM_EXT), content)?;
        meta.current_version += 1;
        meta.last_modified = Utc::now();
        self.store_meta(parent, name, &meta)?;
        Ok(self.to_item(parent, name, meta))
    }

    fn delete_item(&self, parent: &str, name: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        if !self.exists(parent, name)? {
            return Err(TandemError::not_found(format!("local item {}/{}", parent, name)));
        }
        // Metadata first: the item disappears atomically from readers' view
        for ext in [META_EXT, ITEM_EXT, RECOVERY_EXT] {
            let path = self.item_path(parent, name, ext);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        if parent != "/" {
            remove_dir_if_empty(&folder_dir(&self.root, parent))?;
        }
        debug!("Deleted local item {}/{}", parent, name);
        Ok(())
    }

    fn move_item(&self, parent: &str, name: &str, new_parent: &str, new_name: &str) -> Result<LocalItem> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        let meta = self.require_meta(parent, name)?;
        if self.exists(new_parent, new_name)? {
            return Err(TandemError::DuplicateFile(format!("{}/{}", new_parent, new_name)));
        }
        self.relocate(parent, name, new_parent, new_name)?;
        debug!("Moved local item {}/{} to {}/{}", parent, name, new_parent, new_name);
        Ok(self.to_item(new_parent, new_name, meta))
    }

    fn replace_item(&self, parent: &str, src_name: &str, dest_name: &str) -> Result<LocalItem> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        let meta = self.require_meta(parent, src_name)?;
        fs::rename(
            self.item_path(parent, src_name, ITEM_EXT),
            self.item_path(parent, dest_name, ITEM_EXT),
        )?;
        let stale_recovery = self.item_path(parent, dest_name, RECOVERY_EXT);
        if stale_recovery.exists() {
            fs::remove_file(&stale_recovery)?;
        }
        fs::rename(
            self.item_path(parent, src_name, META_EXT),
            self.item_path(parent, dest_name, META_EXT),
        )?;
        let src_recovery = self.item_path(parent, src_name, RECOVERY_EXT);
        if src_recovery.exists() {
            fs::remove_file(&src_recovery)?;
        }
        debug!("Replaced local item {}/{} with {}", parent, dest_name, src_name);
        Ok(self.to_item(parent, dest_name, meta))
    }

    fn set_checkout(
        &self,
        parent: &str,
        name: &str,
        checkout_id: CheckoutId,
        exclusive: bool,
        checkout_version: Version,
    ) -> Result<LocalItem> {
        self.update_meta(parent, name, |meta| {
            meta.checkout = Some(LocalCheckout {
                checkout_id,
                exclusive,
                checkout_version,
                local_version: meta.current_version,
            });
        })
    }

    fn clear_checkout(&self, parent: &str, name: &str) -> Result<LocalItem> {
        self.update_meta(parent, name, |meta| meta.checkout = None)
    }

    fn reset_file_id(&self, parent: &str, name: &str, file_id: &FileId) -> Result<LocalItem> {
        self.update_meta(parent, name, |meta| meta.file_id = file_id.clone())
    }

    fn set_read_only(&self, parent: &str, name: &str, read_only: bool) -> Result<LocalItem> {
        self.update_meta(parent, name, |meta| meta.read_only = read_only)
    }

    fn write_recovery(&self, parent: &str, name: &str, snapshot: Option<&[u8]>) -> Result<()> {
        self.check_writable()?;
        let path = self.item_path(parent, name, RECOVERY_EXT);
        match snapshot {
            Some(bytes) => {
                if !self.exists(parent, name)? {
                    return Err(TandemError::not_found(format!("local item {}/{}", parent, name)));
                }
                atomic_write(&path, bytes)
            }
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn read_recovery(&self, parent: &str, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.item_path(parent, name, RECOVERY_EXT)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_items(&self) -> Result<Vec<LocalItem>> {
        let mut items = Vec::new();
        let walker = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name() != USER_DATA_DIR);
        for entry in walker {
            let entry = entry.map_err(|e| TandemError::internal(format!("walk failed: {}", e)))?;
            let file_name = entry.file_name().to_string_lossy();
            let Some(name) = file_name.strip_suffix(META_EXT) else {
                continue;
            };
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
            match self.get_item(&parent, name) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable local item {}/{}: {}", parent, name, e),
            }
        }
        items.sort_by(|a, b| (&a.parent_path, &a.name).cmp(&(&b.parent_path, &b.name)));
        Ok(items)
    }

    fn write_user_data(&self, file_id: &FileId, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        atomic_write(&self.user_data_path(file_id), data)
    }

    fn has_user_data(&self, file_id: &FileId) -> Result<bool> {
        Ok(self.user_data_path(file_id).exists())
    }

    fn remove_user_data(&self, file_id: &FileId) -> Result<()> {
        match fs::remove_file(self.user_data_path(file_id)) {
            Ok(()) => {
                debug!("Removed user data for {}", file_id.short());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
