//! Project context and file cache
//!
//! A [`Project`] ties together the two stores, the listener and the content
//! adapter registry, and hands out one shared [`VersionedFile`] per path.
//!
//! ## Layout
//!
//! A project created with [`Project::init`] lives in one folder:
//!
//! ```text
//! project_root/
//! ├── project.json     # Project configuration and repository location
//! └── local/           # Local item store
//! ```
//!
//! The repository lives wherever `project.json` points to, so several
//! projects can share one.

use crate::content::{ContentAdapter, OpaqueContentAdapter, TextContentAdapter};
use crate::domain::DomainObjectHandle;
use crate::error::{Result, TandemError};
use crate::file::VersionedFile;
use crate::listener::{FileEvent, FileListener, TracingListener};
use crate::local::FsLocalStore;
use crate::naming::validate_name;
use crate::recovery::RecoveryCoordinator;
use crate::repository::{FsRepository, RepositoryOptions};
use crate::store::{LocalStore, RepositoryStore};
use crate::types::{ItemKind, NewItem, ProjectConfig};
use crate::utils::{atomic_write, join_path, split_path};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const PROJECT_FILE: &str = "project.json";
const LOCAL_DIR: &str = "local";

/// Persisted project description
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectFile {
    config: ProjectConfig,
    repository_path: PathBuf,
    repository: RepositoryOptions,
    created_at: DateTime<Utc>,
}

/// Shared state every file of a project refers to
pub(crate) struct ProjectContext {
    pub(crate) config: ProjectConfig,
    pub(crate) local: Arc<dyn LocalStore>,
    pub(crate) repository: Arc<dyn RepositoryStore>,
    pub(crate) listener: Arc<dyn FileListener>,
    adapters: DashMap<String, Arc<dyn ContentAdapter>>,
    files: DashMap<String, Arc<VersionedFile>>,
}

impl ProjectContext {
    /// Adapter registered for `content_type`
    pub(crate) fn adapter(&self, content_type: &str) -> Result<Arc<dyn ContentAdapter>> {
        self.adapters
            .get(content_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TandemError::unsupported(format!("no content adapter for type '{}'", content_type))
            })
    }

    /// Drop the cached file at `path`
    pub(crate) fn forget(&self, path: &str) {
        if self.files.remove(path).is_some() {
            debug!("Dropped cached file {}", path);
        }
    }

    /// Move a cached file to its new path
    pub(crate) fn rekey(&self, old_path: &str, new_path: &str, file: Arc<VersionedFile>) {
        self.files.remove(old_path);
        self.files.insert(new_path.to_string(), file);
    }

    /// Snapshot of all cached files
    ///
    /// Callers query the files after the map has been released, since file
    /// operations may update the cache while holding their own lock.
    pub(crate) fn cached_files(&self) -> Vec<Arc<VersionedFile>> {
        self.files.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// A project: two stores, one listener, one file per path
#[derive(Clone)]
pub struct Project {
    ctx: Arc<ProjectContext>,
    root: Option<PathBuf>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("config", &self.ctx.config)
            .field("root", &self.root)
            .field("local", &self.ctx.local)
            .field("repository", &self.ctx.repository)
            .field("adapters", &self.ctx.adapters.len())
            .field("cached_files", &self.ctx.files.len())
            .finish()
    }
}

impl Project {
    /// Create a project folder at `root` backed by the repository at `repository_path`
    ///
    /// The repository is created when it does not exist yet; an existing one
    /// keeps its own options.
    ///
    /// # Errors
    ///
    /// - [`TandemError::InvalidArgument`] if `root` already holds a project
    #[instrument(skip(config, options))]
    pub fn init(root: PathBuf, repository_path: PathBuf, config: ProjectConfig, options: RepositoryOptions) -> Result<Self> {
        let project_file = root.join(PROJECT_FILE);
        if project_file.exists() {
            return Err(TandemError::InvalidArgument(format!(
                "project already exists at {:?}",
                root
            )));
        }
        fs::create_dir_all(&root)?;
        let local = FsLocalStore::init(root.join(LOCAL_DIR))?;
        let repository = FsRepository::init_or_open(repository_path.clone(), options, config.user.clone())?;

        let persisted = ProjectFile {
            config: config.clone(),
            repository_path,
            repository: options,
            created_at: Utc::now(),
        };
        atomic_write(&project_file, serde_json::to_string_pretty(&persisted)?.as_bytes())?;
        info!("Initialized project '{}' at {:?}", config.name, root);

        let mut project = ProjectBuilder::from_config(config)
            .local_store(Arc::new(local))
            .repository(Arc::new(repository))
            .build()?;
        project.root = Some(root);
        Ok(project)
    }

    /// Open the project folder at `root`
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotFound`] if `root` holds no project
    #[instrument]
    pub fn open(root: PathBuf) -> Result<Self> {
        let project_file = root.join(PROJECT_FILE);
        if !project_file.exists() {
            return Err(TandemError::not_found(format!("no project at {:?}", root)));
        }
        let persisted: ProjectFile = serde_json::from_str(&fs::read_to_string(&project_file)?)?;
        let local = FsLocalStore::open(root.join(LOCAL_DIR))?;
        let repository = FsRepository::open(persisted.repository_path.clone(), persisted.config.user.clone())?;
        debug!(
            "Opened project '{}' with repository {:?}",
            persisted.config.name, persisted.repository_path
        );

        let mut project = ProjectBuilder::from_config(persisted.config)
            .local_store(Arc::new(local))
            .repository(Arc::new(repository))
            .build()?;
        project.root = Some(root);
        Ok(project)
    }

    /// Project folder, for projects created through [`Project::init`]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Project configuration
    pub fn config(&self) -> &ProjectConfig {
        &self.ctx.config
    }

    /// Local item store
    pub fn local_store(&self) -> Arc<dyn LocalStore> {
        self.ctx.local.clone()
    }

    /// Repository item store
    pub fn repository(&self) -> Arc<dyn RepositoryStore> {
        self.ctx.repository.clone()
    }

    /// Register or replace the adapter for its content type
    pub fn register_adapter(&self, adapter: Arc<dyn ContentAdapter>) {
        let content_type = adapter.content_type().to_string();
        debug!("Registered content adapter for '{}'", content_type);
        self.ctx.adapters.insert(content_type, adapter);
    }

    /// Adapter registered for `content_type`
    pub fn adapter(&self, content_type: &str) -> Result<Arc<dyn ContentAdapter>> {
        self.ctx.adapter(content_type)
    }

    /// The file at `path`
    ///
    /// Every call for the same path returns the same [`VersionedFile`] until
    /// it is disposed or the file disappears.
    ///
    /// # Errors
    ///
    /// - [`TandemError::NotFound`] if neither store holds the file
    pub fn file(&self, path: &str) -> Result<Arc<VersionedFile>> {
        let (parent, name) = split_path(path)?;
        let key = join_path(&parent, &name);
        if let Some(file) = self.ctx.files.get(&key) {
            return Ok(file.value().clone());
        }
        let file = VersionedFile::load(&self.ctx, parent, name)?;
        Ok(self.ctx.files.entry(key).or_insert(file).value().clone())
    }

    /// Whether either store holds a file at `path`
    pub fn exists(&self, path: &str) -> Result<bool> {
        let (parent, name) = split_path(path)?;
        if self.ctx.local.exists(&parent, &name)? {
            return Ok(true);
        }
        Ok(self.ctx.repository.is_online() && self.ctx.repository.exists(&parent, &name)?)
    }

    /// Create a private file at `path`
    ///
    /// # Errors
    ///
    /// - [`TandemError::InvalidName`] if the name is not usable
    /// - [`TandemError::DuplicateFile`] if either store holds the path
    /// - [`TandemError::Unsupported`] if no adapter handles `content_type`
    #[instrument(skip(self, content))]
    pub fn create_file(&self, path: &str, content_type: &str, kind: ItemKind, content: &[u8]) -> Result<Arc<VersionedFile>> {
        let (parent, name) = split_path(path)?;
        validate_name(&name)?;
        if self.ctx.local.is_read_only() {
            return Err(TandemError::read_only("local store is read-only"));
        }
        self.ctx.adapter(content_type)?;
        let path = join_path(&parent, &name);
        if self.exists(&path)? {
            return Err(TandemError::DuplicateFile(path));
        }

        self.ctx
            .local
            .create_item(&parent, &name, &NewItem::fresh(content_type, kind), content)?;
        self.ctx.forget(&path);
        info!("Created private file {}", path);
        let file = self.file(&path)?;
        FileEvent::StatusChanged {
            path,
            file_id_set: true,
        }
        .dispatch(self.ctx.listener.as_ref());
        Ok(file)
    }

    /// Paths of all files in either store, sorted
    ///
    /// Repository files are listed only while the repository is online.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .ctx
            .local
            .list_items()?
            .into_iter()
            .map(|item| join_path(&item.parent_path, &item.name))
            .collect();
        if self.ctx.repository.is_online() {
            match self.ctx.repository.list_items() {
                Ok(items) => paths.extend(
                    items
                        .into_iter()
                        .map(|item| join_path(&item.parent_path, &item.name)),
                ),
                Err(e) => warn!("Failed to list repository items: {}", e),
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Drop the cached file at `path`
    ///
    /// # Errors
    ///
    /// - [`TandemError::InUse`] while the file is busy
    pub fn dispose_file(&self, path: &str) -> Result<()> {
        let (parent, name) = split_path(path)?;
        let key = join_path(&parent, &name);
        let cached = self.ctx.files.get(&key).map(|entry| entry.value().clone());
        if let Some(file) = cached {
            if file.is_busy() {
                return Err(TandemError::in_use(format!("{} is busy", key)));
            }
            self.ctx.forget(&key);
        }
        Ok(())
    }

    /// Cached files
    pub fn cached_files(&self) -> Vec<Arc<VersionedFile>> {
        self.ctx.cached_files()
    }

    /// Open domain objects by file path
    pub fn open_objects(&self) -> Vec<(String, DomainObjectHandle)> {
        let mut open: Vec<_> = self
            .ctx
            .cached_files()
            .into_iter()
            .filter_map(|file| file.open_object().map(|object| (file.path(), object)))
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        open
    }

    /// Coordinator that snapshots open objects of this project
    pub fn recovery_coordinator(&self) -> RecoveryCoordinator {
        RecoveryCoordinator::new(self.clone())
    }
}

/// Builder for [`Project`] instances
///
/// The text and opaque content adapters are registered by default.
///
/// # Examples
///
/// ```rust,no_run
/// use tandem::{FsLocalStore, FsRepository, ProjectBuilder, RepositoryOptions};
/// use std::path::PathBuf;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let local = Arc::new(FsLocalStore::init_or_open(PathBuf::from("./work"))?);
/// let repo = Arc::new(FsRepository::init_or_open(
///     PathBuf::from("./repo"),
///     RepositoryOptions::default(),
///     "alice",
/// )?);
/// let project = ProjectBuilder::new("demo")
///     .user("alice")
///     .headless(true)
///     .local_store(local)
///     .repository(repo)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ProjectBuilder {
    config: ProjectConfig,
    local: Option<Arc<dyn LocalStore>>,
    repository: Option<Arc<dyn RepositoryStore>>,
    listener: Arc<dyn FileListener>,
    adapters: Vec<Arc<dyn ContentAdapter>>,
}

impl std::fmt::Debug for ProjectBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectBuilder")
            .field("config", &self.config)
            .field("local", &self.local.is_some())
            .field("repository", &self.repository.is_some())
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl ProjectBuilder {
    /// Create a builder for a project named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(ProjectConfig::new(name))
    }

    /// Create a builder from an existing configuration
    pub fn from_config(config: ProjectConfig) -> Self {
        Self {
            config,
            local: None,
            repository: None,
            listener: Arc::new(TracingListener),
            adapters: vec![Arc::new(TextContentAdapter), Arc::new(OpaqueContentAdapter)],
        }
    }

    /// Set the acting user
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = user.into();
        self
    }

    /// Mark the project transient
    pub fn transient(mut self, transient: bool) -> Self {
        self.config.transient = transient;
        self
    }

    /// Reject operations that need an interactive merge
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    /// Always take the merge path on checkin
    pub fn always_merge(mut self, always_merge: bool) -> Self {
        self.config.always_merge = always_merge;
        self
    }

    /// Set the local item store
    pub fn local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Set the repository item store
    pub fn repository(mut self, repository: Arc<dyn RepositoryStore>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the listener receiving file notifications
    pub fn listener(mut self, listener: Arc<dyn FileListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Register an additional content adapter
    pub fn adapter(mut self, adapter: Arc<dyn ContentAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Build the project
    ///
    /// # Errors
    ///
    /// - [`TandemError::InvalidArgument`] if a store is missing
    pub fn build(self) -> Result<Project> {
        let local = self
            .local
            .ok_or_else(|| TandemError::InvalidArgument("project needs a local store".to_string()))?;
        let repository = self
            .repository
            .ok_or_else(|| TandemError::InvalidArgument("project needs a repository".to_string()))?;

        let adapters = DashMap::new();
        for adapter in self.adapters {
            adapters.insert(adapter.content_type().to_string(), adapter);
        }
        Ok(Project {
            ctx: Arc::new(ProjectContext {
                config: self.config,
                local,
                repository,
                listener: self.listener,
                adapters,
                files: DashMap::new(),
            }),
            root: None,
        })
    }
}
