//! Utility functions for Tandem
//!
//! This module provides helpers shared by the stores, the file state machine
//! and the command line tool.
//!
//! ## Categories of Utilities
//!
//! ### Path Addressing
//! Files are addressed by a flat `parent_path + name` scheme. Parent paths are
//! absolute, `/`-separated and never end with a separator except for the root
//! folder `/` itself.
//!
//! ### Data Processing
//! - SHA-256 digests of content
//! - Human-readable byte counts
//!
//! ### File Operations
//! - Atomic file writing through a persisted temporary file
//! - Removal of emptied folders
//!
//! ## Example Usage
//!
//! ```rust
//! use tandem::utils::{join_path, split_path};
//!
//! let (parent, name) = split_path("/docs/notes.txt").unwrap();
//! assert_eq!(parent, "/docs");
//! assert_eq!(name, "notes.txt");
//! assert_eq!(join_path(&parent, &name), "/docs/notes.txt");
//! ```

use crate::error::{Result, TandemError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Normalize a folder path to its canonical `/a/b` form
///
/// Empty input and `/` map to the root folder. Repeated and trailing
/// separators are dropped.
///
/// # Errors
///
/// - [`TandemError::InvalidName`] if a component is `.` or `..`
pub fn normalize_parent(parent: &str) -> Result<String> {
    let mut parts = Vec::new();
    for component in parent.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." {
            return Err(TandemError::InvalidName(format!(
                "relative component '{}' in {}",
                component, parent
            )));
        }
        parts.push(component);
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Split a file path into its parent folder and name
///
/// # Errors
///
/// - [`TandemError::InvalidName`] if the path has no name component
pub fn split_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    if name.is_empty() {
        return Err(TandemError::InvalidName(format!("no file name in '{}'", path)));
    }
    Ok((normalize_parent(parent)?, name.to_string()))
}

/// Join a normalized parent folder and a name into a file path
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Resolve a normalized parent folder below a filesystem root
pub fn folder_dir(root: &Path, parent: &str) -> PathBuf {
    let mut dir = root.to_path_buf();
    for component in parent.split('/').filter(|c| !c.is_empty()) {
        dir.push(component);
    }
    dir
}

/// Hash arbitrary data using SHA-256
///
/// Returns the digest as a 64-character hexadecimal string.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Format bytes in human-readable form
///
/// Uses binary units (1024-based).
///
/// ```rust
/// use tandem::utils::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write
///
/// Content is written to a temporary file in the target's folder which is
/// then persisted over the target. Readers observe either the old or the new
/// content, never a partial write. Missing parent folders are created.
///
/// # Errors
///
/// - [`TandemError::Io`] if writing or persisting the temporary file fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TandemError::internal(format!("{:?} has no parent folder", path)))?;
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| TandemError::Io(e.error))?;

    trace!("Atomically wrote {} to {:?}", format_bytes(content.len() as u64), path);
    Ok(())
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Acting user when none is configured
///
/// `TANDEM_USER` wins, then the login name from `USER`/`USERNAME`, then the
/// host name.
pub fn default_user() -> String {
    ["TANDEM_USER", "USER", "USERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.trim().is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
