//! Name validation and collision-free name generation
//!
//! Every generator here is a pure function over an existence predicate. The
//! caller decides what "exists" means; the file state machine probes the local
//! store and, when online, the repository.

use crate::error::{Result, TandemError};
use crate::types::Version;

/// Suffixes the stores use for their own bookkeeping files
pub const RESERVED_SUFFIXES: &[&str] = &[".item", ".meta.json", ".recovery", ".repo"];

/// Suffix of keep files
pub const KEEP_SUFFIX: &str = ".keep";

/// Suffix of the temporary item used while merging into a checkout
pub const MERGE_SUFFIX: &str = ".merge";

/// Validate a file name
///
/// # Errors
///
/// - [`TandemError::InvalidName`] for empty names, names containing `/`,
///   `.` / `..`, leading dots, and names ending in a reserved store suffix
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.trim().is_empty() {
        return Err(TandemError::InvalidName("name is empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(TandemError::InvalidName(format!("'{}' contains a path separator", name)));
    }
    if name.starts_with('.') {
        return Err(TandemError::InvalidName(format!("'{}' starts with a dot", name)));
    }
    if let Some(suffix) = RESERVED_SUFFIXES.iter().find(|s| name.ends_with(*s)) {
        return Err(TandemError::InvalidName(format!(
            "'{}' ends with reserved suffix '{}'",
            name, suffix
        )));
    }
    Ok(())
}

/// First name in `base`, `base.1`, `base.2`, ... for which `exists` is false
pub fn next_available_name<F>(base: &str, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    if !exists(base) {
        return base.to_string();
    }
    let mut counter: u64 = 1;
    loop {
        let candidate = format!("{}.{}", base, counter);
        if !exists(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Keep-file name for `name`: `name.keep`, then `name.keep.1`, `name.keep.2`, ...
pub fn keep_name<F>(name: &str, exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    next_available_name(&format!("{}{}", name, KEEP_SUFFIX), exists)
}

/// Name of the temporary merge item for `name`
pub fn merge_temp_name<F>(name: &str, exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    next_available_name(&format!("{}{}", name, MERGE_SUFFIX), exists)
}

/// Target name of a copy: `name`, then `name.1`, `name.2`, ...
pub fn target_name<F>(name: &str, exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    next_available_name(name, exists)
}

/// Base name of a copy of a specific version: `name_v<version>`
pub fn versioned_copy_name(name: &str, version: Version) -> String {
    format!("{}_v{}", name, version)
}
