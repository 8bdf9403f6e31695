//! Open domain objects
//!
//! A [`DomainObjectHandle`] is the in-memory working state of an opened file.
//! Each handle remembers the file generation it was opened against. When a
//! checkin or merge replaces the stored content, the file bumps its
//! generation and detaches the handle: the handle becomes stale, is marked
//! temporary and is renamed to `~name`. Edits against a stale handle fail
//! with [`TandemError::StaleObject`]; callers must reopen the file.
//!
//! Handles are cheap to clone and all clones share state.

use crate::error::{Result, TandemError};
use crate::types::Version;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct DomainObjectState {
    name: RwLock<String>,
    path: RwLock<String>,
    opened_generation: u64,
    file_generation: Arc<AtomicU64>,
    content: RwLock<Vec<u8>>,
    changed: AtomicBool,
    temporary: AtomicBool,
    read_only: bool,
    version: Version,
    consumers: AtomicUsize,
}

/// Shared handle to an open domain object
#[derive(Clone)]
pub struct DomainObjectHandle {
    state: Arc<DomainObjectState>,
}

impl std::fmt::Debug for DomainObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainObjectHandle")
            .field("path", &*self.state.path.read())
            .field("generation", &self.state.opened_generation)
            .field("stale", &self.is_stale())
            .field("changed", &self.is_changed())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

impl DomainObjectHandle {
    pub(crate) fn new(
        name: &str,
        path: &str,
        file_generation: Arc<AtomicU64>,
        content: Vec<u8>,
        version: Version,
        read_only: bool,
        recovered: bool,
    ) -> Self {
        let opened_generation = file_generation.load(Ordering::SeqCst);
        Self {
            state: Arc::new(DomainObjectState {
                name: RwLock::new(name.to_string()),
                path: RwLock::new(path.to_string()),
                opened_generation,
                file_generation,
                content: RwLock::new(content),
                changed: AtomicBool::new(recovered),
                temporary: AtomicBool::new(false),
                read_only,
                version,
                consumers: AtomicUsize::new(1),
            }),
        }
    }

    /// Current name; `~name` once detached
    pub fn name(&self) -> String {
        self.state.name.read().clone()
    }

    /// Path of the file the object was opened from
    pub fn path(&self) -> String {
        self.state.path.read().clone()
    }

    /// Generation the object was opened against
    pub fn generation(&self) -> u64 {
        self.state.opened_generation
    }

    /// Whether the file generation moved on since the object was opened
    pub fn is_stale(&self) -> bool {
        self.state.file_generation.load(Ordering::SeqCst) != self.state.opened_generation
    }

    /// Whether the object was detached from its file
    pub fn is_temporary(&self) -> bool {
        self.state.temporary.load(Ordering::SeqCst)
    }

    /// Whether the object holds unsaved edits
    pub fn is_changed(&self) -> bool {
        self.state.changed.load(Ordering::SeqCst)
    }

    /// Whether edits are rejected
    pub fn is_read_only(&self) -> bool {
        self.state.read_only
    }

    /// Version the object was opened at
    pub fn version(&self) -> Version {
        self.state.version
    }

    /// Number of consumers holding the object
    pub fn consumer_count(&self) -> usize {
        self.state.consumers.load(Ordering::SeqCst)
    }

    /// Copy of the current content
    pub fn content(&self) -> Vec<u8> {
        self.state.content.read().clone()
    }

    /// Replace the content
    ///
    /// # Errors
    ///
    /// - [`TandemError::StaleObject`] if the file generation moved on
    /// - [`TandemError::ReadOnly`] for read-only objects
    pub fn set_content(&self, content: Vec<u8>) -> Result<()> {
        self.ensure_current()?;
        if self.state.read_only {
            return Err(TandemError::read_only(format!("{} was opened read-only", self.path())));
        }
        *self.state.content.write() = content;
        self.state.changed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Fail with [`TandemError::StaleObject`] if the object is stale
    pub fn ensure_current(&self) -> Result<()> {
        if self.is_stale() {
            return Err(TandemError::StaleObject(self.path()));
        }
        Ok(())
    }

    /// Whether both handles share the same object
    pub fn same_object(&self, other: &DomainObjectHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn add_consumer(&self) {
        self.state.consumers.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one consumer; returns the remaining count
    pub(crate) fn remove_consumer(&self) -> usize {
        let previous = self
            .state
            .consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn mark_saved(&self) {
        self.state.changed.store(false, Ordering::SeqCst);
    }

    /// Detach from the file: temporary, renamed to `~name`
    pub(crate) fn detach(&self) {
        self.state.temporary.store(true, Ordering::SeqCst);
        let mut name = self.state.name.write();
        if !name.starts_with('~') {
            *name = format!("~{}", name);
        }
    }
}
