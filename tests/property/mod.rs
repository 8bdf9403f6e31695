//! Property-based testing for Tandem
//!
//! Uses proptest to check naming, state derivation and version numbering
//! invariants across randomly generated inputs and operation sequences.

use ::tandem::naming::{keep_name, next_available_name, target_name, validate_name};
use ::tandem::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

/// An operation one user applies to a single versioned file
#[derive(Debug, Clone)]
pub enum FileOperation {
    Checkout { exclusive: bool },
    Edit { line: String },
    Checkin { keep_checked_out: bool },
    Undo { keep: bool },
    Merge,
}

fn file_operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        any::<bool>().prop_map(|exclusive| FileOperation::Checkout { exclusive }),
        "[a-z]{1,12}".prop_map(|line| FileOperation::Edit { line }),
        any::<bool>().prop_map(|keep_checked_out| FileOperation::Checkin { keep_checked_out }),
        any::<bool>().prop_map(|keep| FileOperation::Undo { keep }),
        Just(FileOperation::Merge),
    ]
}

/// Valid file names
fn name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{1,10}\\.(txt|md|dat)",
        "[a-zA-Z0-9_-]{1,16}",
        "[a-z]{2,6} [a-z]{2,6}",
    ]
}

fn single_user_project() -> (Project, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let repository = Arc::new(
        FsRepository::init(temp_dir.path().join("repo"), RepositoryOptions::default(), "prop").unwrap(),
    );
    let local = Arc::new(FsLocalStore::init(temp_dir.path().join("local")).unwrap());
    let project = ProjectBuilder::new("prop")
        .user("prop")
        .headless(true)
        .local_store(local)
        .repository(repository)
        .build()
        .unwrap();
    (project, temp_dir)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_generated_names_never_collide(
        name in name_strategy(),
        taken_count in 0usize..12,
    ) {
        let mut taken: BTreeSet<String> = BTreeSet::new();
        taken.insert(format!("{}.keep", name));
        for i in 1..taken_count {
            taken.insert(format!("{}.keep.{}", name, i));
        }

        let keep = keep_name(&name, |n| taken.contains(n));
        prop_assert!(!taken.contains(&keep));
        let keep_prefix = format!("{}.keep", name);
        prop_assert!(keep.starts_with(&keep_prefix));
        prop_assert!(validate_name(&keep).is_ok());

        let copy = target_name(&name, |n| n == name);
        prop_assert_ne!(&copy, &name);
        prop_assert!(copy.starts_with(&name));
    }

    #[test]
    fn prop_next_available_name_is_first_free(
        base in name_strategy(),
        taken in prop::collection::btree_set(0u64..8, 0..8),
    ) {
        let exists = |candidate: &str| {
            if candidate == base {
                return taken.contains(&0);
            }
            candidate
                .strip_prefix(&format!("{}.", base))
                .and_then(|suffix| suffix.parse::<u64>().ok())
                .is_some_and(|n| taken.contains(&n))
        };
        let chosen = next_available_name(&base, exists);
        let expected = (0u64..).find(|n| !taken.contains(n)).unwrap();
        if expected == 0 {
            prop_assert_eq!(chosen, base);
        } else {
            prop_assert_eq!(chosen, format!("{}.{}", base, expected));
        }
    }

    #[test]
    fn prop_valid_names_pass_validation(name in name_strategy()) {
        prop_assert!(validate_name(&name).is_ok());
        let with_slash = format!("{}/x", name);
        let with_dot = format!(".{}", name);
        prop_assert!(validate_name(&with_slash).is_err());
        prop_assert!(validate_name(&with_dot).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_operation_sequences_keep_versions_dense(
        ops in prop::collection::vec(file_operation_strategy(), 1..20),
    ) {
        let (project, _temp) = single_user_project();
        let file = project
            .create_file("/prop.txt", TEXT_CONTENT_TYPE, ItemKind::Database, b"seed\n")
            .unwrap();
        file.add_to_repository(None, false, &TaskMonitor::none()).unwrap();
        let mut expected_versions: Version = 1;

        for op in ops {
            let before = file.state().unwrap();
            match op {
                FileOperation::Checkout { exclusive } => {
                    let result = file.checkout(exclusive, &TaskMonitor::none());
                    if before == FileState::Versioned {
                        prop_assert!(result.unwrap());
                        prop_assert_eq!(file.state().unwrap(), FileState::CheckedOut);
                        prop_assert_eq!(file.version(), expected_versions);
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
                FileOperation::Edit { line } => {
                    if before == FileState::CheckedOut {
                        let object = file.open_for_update(false).unwrap();
                        let mut content = object.content();
                        content.extend_from_slice(format!("{}\n", line).as_bytes());
                        object.set_content(content).unwrap();
                        file.save(&object).unwrap();
                        file.release(&object).unwrap();
                        prop_assert!(file.modified_since_checkout());
                    }
                }
                FileOperation::Checkin { keep_checked_out } => {
                    let modified = file.modified_since_checkout();
                    let options = CheckinOptions { keep_checked_out, ..Default::default() };
                    let result = file.checkin(&options, &TaskMonitor::none());
                    if before == FileState::CheckedOut && modified {
                        let outcome = result.unwrap();
                        expected_versions += 1;
                        prop_assert_eq!(outcome, CheckinOutcome::Committed { version: expected_versions, fast_path: true });
                        let expected_state = if keep_checked_out { FileState::CheckedOut } else { FileState::Versioned };
                        prop_assert_eq!(file.state().unwrap(), expected_state);
                    } else {
                        prop_assert!(result.is_err());
                        prop_assert_eq!(file.state().unwrap(), before);
                    }
                }
                FileOperation::Undo { keep } => {
                    let result = file.undo_checkout(keep, false, false);
                    if before == FileState::CheckedOut {
                        result.unwrap();
                        prop_assert_eq!(file.state().unwrap(), FileState::Versioned);
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
                FileOperation::Merge => {
                    // Nobody else commits, so there is never anything to merge
                    prop_assert!(file.merge(&TaskMonitor::none()).is_err());
                }
            }
            prop_assert_eq!(file.latest_version(), expected_versions);
            prop_assert_eq!(file.version_history().unwrap().len() as Version, expected_versions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_state_derivation_is_total() {
        for local in [false, true] {
            for repository in [false, true] {
                for checked_out in [false, true] {
                    let state = FileState::derive(local, repository, checked_out);
                    match (local, repository, checked_out) {
                        (false, false, _) => assert_eq!(state, None),
                        (true, _, true) => assert_eq!(state, Some(FileState::CheckedOut)),
                        (true, false, false) => assert_eq!(state, Some(FileState::Private)),
                        (true, true, false) => assert_eq!(state, Some(FileState::Hijacked)),
                        (false, true, _) => assert_eq!(state, Some(FileState::Versioned)),
                    }
                }
            }
        }
    }
}
