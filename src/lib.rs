//! # Tandem - per-file version control over two stores
//!
//! Tandem manages files that live in two independently versioned, independently
//! failing stores: a private local store holding working copies, and a shared
//! repository holding the version history every user sees.
//!
//! ## Overview
//!
//! Each file of a project is a pair of an optional local item and an optional
//! repository item. Users move files between states explicitly:
//! - Add a private file to the repository
//! - Check a versioned file out into the local store, optionally exclusively
//! - Check local changes back in, directly or through a three-way merge when
//!   others checked in first
//! - Merge newer repository versions into a checkout without checking in
//! - Undo a checkout, optionally keeping the local copy as a keep file
//! - Rename, move, copy and delete files consistently across both stores
//!
//! ## File States
//!
//! | local | repository | checked out | state |
//! |---|---|---|---|
//! | present | absent | no | [`FileState::Private`] |
//! | absent | present | - | [`FileState::Versioned`] |
//! | present | any | yes | [`FileState::CheckedOut`] |
//! | present | present | no | [`FileState::Hijacked`] |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tandem::{CheckinOptions, ItemKind, Project, ProjectConfig, RepositoryOptions, TaskMonitor};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let project = Project::init(
//!     PathBuf::from("./work"),
//!     PathBuf::from("./repo"),
//!     ProjectConfig::new("demo"),
//!     RepositoryOptions::default(),
//! )?;
//!
//! // Create a private file and put it under version control
//! let file = project.create_file("/notes.txt", "text", ItemKind::Database, b"hello\n")?;
//! file.add_to_repository(Some("first draft"), false, &TaskMonitor::none())?;
//!
//! // Check it out, edit, and check it back in
//! file.checkout(false, &TaskMonitor::none())?;
//! let object = file.open_for_update(false)?;
//! object.set_content(b"hello world\n".to_vec())?;
//! file.save(&object)?;
//! file.release(&object)?;
//! let outcome = file.checkin(&CheckinOptions::default(), &TaskMonitor::none())?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Merging
//!
//! When the repository moved past the version a checkout is based on, the
//! content adapter registered for the file's content type merges the local
//! changes onto the latest version. [`TextContentAdapter`] merges line by line
//! and aborts on overlapping edits; an aborted merge never touches the local
//! item.
//!
//! ## Module Organization
//!
//! - [`file`]: The versioned file state machine
//! - [`project`]: Project context, file cache and builder
//! - [`store`]: Local and repository store traits
//! - [`local`], [`repository`]: Filesystem-backed stores
//! - [`content`]: Content adapters and merge strategies
//! - [`domain`]: Open domain objects
//! - [`listener`]: File notifications
//! - [`recovery`]: Crash-recovery snapshots
//! - [`naming`]: Keep, merge and copy name generation
//! - [`types`]: Common types and data structures
//! - [`error`]: Error types and handling

// Public API modules
pub mod content;
pub mod domain;
pub mod error;
pub mod file;
pub mod listener;
pub mod local;
pub mod naming;
pub mod project;
pub mod recovery;
pub mod repository;
pub mod store;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use content::{
    ChangeKind, ChangeSet, ContentAdapter, ContentView, MergeResult, MergeTarget,
    OpaqueContentAdapter, TextContentAdapter, OPAQUE_CONTENT_TYPE, TEXT_CONTENT_TYPE,
};
pub use domain::DomainObjectHandle;
pub use error::{Result, TandemError};
pub use file::VersionedFile;
pub use listener::{FileEvent, FileListener, NoOpListener, RecordingListener, TracingListener};
pub use local::FsLocalStore;
pub use project::{Project, ProjectBuilder};
pub use recovery::{RecoveryCoordinator, RecoveryTask};
pub use repository::{FsRepository, RepositoryOptions};
pub use store::{LocalStore, RepositoryStore};
pub use types::*;
