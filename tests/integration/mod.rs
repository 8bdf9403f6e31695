//! Integration tests for Tandem
//!
//! Tests complete multi-user scenarios: checkout/checkin round trips, merges
//! against concurrent checkins, hijacked files and identity operations.

use ::tandem::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// Two users sharing one repository
pub struct TandemTestHarness {
    pub temp_dir: TempDir,
    pub repository: Arc<FsRepository>,
    pub alice: Project,
}

impl TandemTestHarness {
    /// Harness with a shared repository
    pub fn new() -> Self {
        Self::with_options(RepositoryOptions::default())
    }

    /// Harness with custom repository options
    pub fn with_options(options: RepositoryOptions) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let repository = Arc::new(
            FsRepository::init(temp_dir.path().join("repo"), options, "alice").unwrap(),
        );
        let local = Arc::new(FsLocalStore::init(temp_dir.path().join("alice")).unwrap());
        let alice = ProjectBuilder::new("alice-project")
            .user("alice")
            .headless(true)
            .local_store(local)
            .repository(repository.clone())
            .build()
            .unwrap();
        Self {
            temp_dir,
            repository,
            alice,
        }
    }

    /// Project of another user working against the same repository
    pub fn project_for(&self, user: &str) -> Project {
        self.project_with(user, |builder| builder)
    }

    /// Project of another user, customized by `configure`
    pub fn project_with<F>(&self, user: &str, configure: F) -> Project
    where
        F: FnOnce(ProjectBuilder) -> ProjectBuilder,
    {
        let local = Arc::new(FsLocalStore::init(self.temp_dir.path().join(user)).unwrap());
        let repository =
            Arc::new(FsRepository::open(self.temp_dir.path().join("repo"), user).unwrap());
        configure(
            ProjectBuilder::new(format!("{}-project", user))
                .user(user)
                .headless(true)
                .local_store(local)
                .repository(repository),
        )
        .build()
        .unwrap()
    }

    /// Create `path` in `project` and add it to the repository
    pub fn versioned(&self, project: &Project, path: &str, content: &str) -> Arc<VersionedFile> {
        let file = project
            .create_file(path, TEXT_CONTENT_TYPE, ItemKind::Database, content.as_bytes())
            .unwrap();
        file.add_to_repository(Some("initial"), false, &TaskMonitor::none())
            .unwrap();
        file
    }

    /// Check out, edit and check in through `project`
    pub fn commit(&self, project: &Project, path: &str, content: &str) -> Version {
        let file = project.file(path).unwrap();
        assert!(file.checkout(false, &TaskMonitor::none()).unwrap());
        edit(&file, content);
        match file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap()
        {
            CheckinOutcome::Committed { version, .. } => version,
            CheckinOutcome::Aborted => panic!("checkin of {} aborted", path),
        }
    }
}

impl Default for TandemTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace the content of a file through a domain object
pub fn edit(file: &VersionedFile, content: &str) {
    let object = file.open_for_update(false).unwrap();
    object.set_content(content.as_bytes().to_vec()).unwrap();
    file.save(&object).unwrap();
    file.release(&object).unwrap();
}

/// Visible content of a file
pub fn read(file: &VersionedFile) -> String {
    String::from_utf8(file.open_read_only(None).unwrap().content()).unwrap()
}

/// Arguments one merge invocation received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCall {
    pub target_label: String,
    pub target_version: Option<Version>,
    pub source_label: String,
    pub original_version: Option<Version>,
    pub latest_version: Option<Version>,
    pub latest_changes: usize,
}

/// Text adapter that records its merge invocations
#[derive(Debug, Default)]
pub struct RecordingAdapter {
    pub calls: Mutex<Vec<MergeCall>>,
}

pub const RECORDED_CONTENT_TYPE: &str = "recorded-text";

impl ContentAdapter for RecordingAdapter {
    fn content_type(&self) -> &str {
        RECORDED_CONTENT_TYPE
    }

    fn compute_change_set(&self, base: &[u8], target: &[u8], base_version: Version, target_version: Version) -> Result<ChangeSet> {
        TextContentAdapter.compute_change_set(base, target, base_version, target_version)
    }

    fn merge(
        &self,
        target: &mut MergeTarget,
        source: &ContentView,
        original: &ContentView,
        latest: &ContentView,
        monitor: &TaskMonitor,
    ) -> Result<MergeResult> {
        self.calls.lock().push(MergeCall {
            target_label: target.label.clone(),
            target_version: target.version,
            source_label: source.label.clone(),
            original_version: original.version,
            latest_version: latest.version,
            latest_changes: latest.changes.as_ref().map(|c| c.changes.len()).unwrap_or(0),
        });
        TextContentAdapter.merge(target, source, original, latest, monitor)
    }
}

/// Repository wrapper that lets another user check in right before the
/// next commit of anyone else
#[derive(Debug)]
pub struct RacingRepository {
    inner: Arc<FsRepository>,
    armed: AtomicBool,
    racing_content: Mutex<Vec<u8>>,
}

impl RacingRepository {
    pub fn new(inner: Arc<FsRepository>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            racing_content: Mutex::new(Vec::new()),
        }
    }

    /// Let `content` be checked in by another user before the next commit
    pub fn arm(&self, content: &str) {
        *self.racing_content.lock() = content.as_bytes().to_vec();
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl RepositoryStore for RacingRepository {
    fn is_online(&self) -> bool {
        self.inner.is_online()
    }
    fn is_shared(&self) -> bool {
        self.inner.is_shared()
    }
    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
    fn is_local(&self) -> bool {
        self.inner.is_local()
    }
    fn user(&self) -> Option<String> {
        self.inner.user()
    }
    fn get_item(&self, parent: &str, name: &str) -> Result<Option<RepositoryItem>> {
        self.inner.get_item(parent, name)
    }
    fn exists(&self, parent: &str, name: &str) -> Result<bool> {
        self.inner.exists(parent, name)
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
        self.inner.create_item(parent, name, item, content, comment, user)
    }
    fn read_version(&self, parent: &str, name: &str, version: Version) -> Result<Vec<u8>> {
        self.inner.read_version(parent, name, version)
    }
    fn versions(&self, parent: &str, name: &str) -> Result<Vec<VersionInfo>> {
        self.inner.versions(parent, name)
    }
    fn checkout(
        &self,
        parent: &str,
        name: &str,
        checkout_type: CheckoutType,
        user: &str,
        project_path: &str,
    ) -> Result<Option<CheckoutStatus>> {
        self.inner.checkout(parent, name, checkout_type, user, project_path)
    }
    fn get_checkout(&self, parent: &str, name: &str, checkout_id: CheckoutId) -> Result<Option<CheckoutStatus>> {
        self.inner.get_checkout(parent, name, checkout_id)
    }
    fn checkouts(&self, parent: &str, name: &str) -> Result<Vec<CheckoutStatus>> {
        self.inner.checkouts(parent, name)
    }
    fn terminate_checkout(&self, parent: &str, name: &str, checkout_id: CheckoutId) -> Result<()> {
        self.inner.terminate_checkout(parent, name, checkout_id)
    }
    fn update_checkout_version(&self, parent: &str, name: &str, checkout_id: CheckoutId, version: Version) -> Result<()> {
        self.inner.update_checkout_version(parent, name, checkout_id, version)
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
        if self.armed.swap(false, Ordering::SeqCst) {
            let racer = self
                .inner
                .checkout(parent, name, CheckoutType::Normal, "mallory", "elsewhere::race")?
                .expect("racing checkout declined");
            let racing_content = self.racing_content.lock().clone();
            let version = self.inner.commit_version(
                parent,
                name,
                racer.checkout_id,
                expected_tip,
                &racing_content,
                Some("racing checkin"),
                "mallory",
            )?;
            self.inner.terminate_checkout(parent, name, racer.checkout_id)?;
            info!("Racing checkin created version {}", version);
        }
        self.inner
            .commit_version(parent, name, checkout_id, expected_tip, content, comment, user)
    }
    fn delete_version(&self, parent: &str, name: &str, version: Version) -> Result<()> {
        self.inner.delete_version(parent, name, version)
    }
    fn delete_item(&self, parent: &str, name: &str) -> Result<()> {
        self.inner.delete_item(parent, name)
    }
    fn move_item(&self, parent: &str, name: &str, new_parent: &str, new_name: &str) -> Result<RepositoryItem> {
        self.inner.move_item(parent, name, new_parent, new_name)
    }
    fn list_items(&self) -> Result<Vec<RepositoryItem>> {
        self.inner.list_items()
    }
}

/// Adapter whose merge strategy always gives up
#[derive(Debug, Default)]
pub struct AbortingAdapter;

pub const ABORTING_CONTENT_TYPE: &str = "aborting-text";

impl ContentAdapter for AbortingAdapter {
    fn content_type(&self) -> &str {
        ABORTING_CONTENT_TYPE
    }

    fn compute_change_set(&self, base: &[u8], target: &[u8], base_version: Version, target_version: Version) -> Result<ChangeSet> {
        TextContentAdapter.compute_change_set(base, target, base_version, target_version)
    }

    fn merge(
        &self,
        target: &mut MergeTarget,
        _source: &ContentView,
        _original: &ContentView,
        _latest: &ContentView,
        _monitor: &TaskMonitor,
    ) -> Result<MergeResult> {
        target.apply(b"half-merged garbage".to_vec());
        Ok(MergeResult::Aborted)
    }
}

/// Text adapter that runs a hook in the middle of its next merge
#[derive(Default)]
pub struct InterleavingAdapter {
    during_merge: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

pub const INTERLEAVING_CONTENT_TYPE: &str = "interleaving-text";

impl InterleavingAdapter {
    /// Run `hook` once, while the next merge is in progress
    pub fn during_next_merge(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during_merge.lock() = Some(Box::new(hook));
    }
}

impl std::fmt::Debug for InterleavingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterleavingAdapter")
            .field("armed", &self.during_merge.lock().is_some())
            .finish()
    }
}

impl ContentAdapter for InterleavingAdapter {
    fn content_type(&self) -> &str {
        INTERLEAVING_CONTENT_TYPE
    }

    fn compute_change_set(&self, base: &[u8], target: &[u8], base_version: Version, target_version: Version) -> Result<ChangeSet> {
        TextContentAdapter.compute_change_set(base, target, base_version, target_version)
    }

    fn merge(
        &self,
        target: &mut MergeTarget,
        source: &ContentView,
        original: &ContentView,
        latest: &ContentView,
        monitor: &TaskMonitor,
    ) -> Result<MergeResult> {
        let hook = self.during_merge.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        TextContentAdapter.merge(target, source, original, latest, monitor)
    }
}

/// Local store whose next deletes fail
#[derive(Debug)]
pub struct FailingLocalStore {
    inner: Arc<FsLocalStore>,
    failing_deletes: AtomicUsize,
}

impl FailingLocalStore {
    pub fn new(inner: Arc<FsLocalStore>) -> Self {
        Self {
            inner,
            failing_deletes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` deletes fail with an I/O error
    pub fn fail_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }
}

impl LocalStore for FailingLocalStore {
    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
    fn get_item(&self, parent: &str, name: &str) -> Result<Option<LocalItem>> {
        self.inner.get_item(parent, name)
    }
    fn exists(&self, parent: &str, name: &str) -> Result<bool> {
        self.inner.exists(parent, name)
    }
    fn create_item(&self, parent: &str, name: &str, item: &NewItem, content: &[u8]) -> Result<LocalItem> {
        self.inner.create_item(parent, name, item, content)
    }
    fn read_content(&self, parent: &str, name: &str) -> Result<Vec<u8>> {
        self.inner.read_content(parent, name)
    }
    fn write_content(&self, parent: &str, name: &str, content: &[u8]) -> Result<LocalItem> {
        self.inner.write_content(parent, name, content)
    }
    fn delete_item(&self, parent: &str, name: &str) -> Result<()> {
        let failing = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TandemError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot delete {}/{}", parent, name),
            )));
        }
        self.inner.delete_item(parent, name)
    }
    fn move_item(&self, parent: &str, name: &str, new_parent: &str, new_name: &str) -> Result<LocalItem> {
        self.inner.move_item(parent, name, new_parent, new_name)
    }
    fn replace_item(&self, parent: &str, src_name: &str, dest_name: &str) -> Result<LocalItem> {
        self.inner.replace_item(parent, src_name, dest_name)
    }
    fn set_checkout(
        &self,
        parent: &str,
        name: &str,
        checkout_id: CheckoutId,
        exclusive: bool,
        checkout_version: Version,
    ) -> Result<LocalItem> {
        self.inner.set_checkout(parent, name, checkout_id, exclusive, checkout_version)
    }
    fn clear_checkout(&self, parent: &str, name: &str) -> Result<LocalItem> {
        self.inner.clear_checkout(parent, name)
    }
    fn reset_file_id(&self, parent: &str, name: &str, file_id: &FileId) -> Result<LocalItem> {
        self.inner.reset_file_id(parent, name, file_id)
    }
    fn set_read_only(&self, parent: &str, name: &str, read_only: bool) -> Result<LocalItem> {
        self.inner.set_read_only(parent, name, read_only)
    }
    fn write_recovery(&self, parent: &str, name: &str, snapshot: Option<&[u8]>) -> Result<()> {
        self.inner.write_recovery(parent, name, snapshot)
    }
    fn read_recovery(&self, parent: &str, name: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read_recovery(parent, name)
    }
    fn list_items(&self) -> Result<Vec<LocalItem>> {
        self.inner.list_items()
    }
    fn write_user_data(&self, file_id: &FileId, data: &[u8]) -> Result<()> {
        self.inner.write_user_data(file_id, data)
    }
    fn has_user_data(&self, file_id: &FileId) -> Result<bool> {
        self.inner.has_user_data(file_id)
    }
    fn remove_user_data(&self, file_id: &FileId) -> Result<()> {
        self.inner.remove_user_data(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_scenario_private_file_added_to_non_shared_repository() {
        let harness = TandemTestHarness::with_options(RepositoryOptions {
            shared: false,
            ..RepositoryOptions::default()
        });
        let file = harness
            .alice
            .create_file("/A", TEXT_CONTENT_TYPE, ItemKind::Database, b"a\n")
            .unwrap();
        assert_eq!(file.state().unwrap(), FileState::Private);
        assert!(!file.can_checkout());
        assert!(matches!(
            file.checkout(false, &TaskMonitor::none()),
            Err(TandemError::InternalConsistency(_))
        ));

        file.add_to_repository(None, false, &TaskMonitor::none()).unwrap();
        assert_eq!(file.state().unwrap(), FileState::Versioned);
        assert!(!file.is_checked_out());

        assert!(file.checkout(false, &TaskMonitor::none()).unwrap());
        assert!(file.is_checked_out_exclusive());
        let status = file.checkout_status().unwrap().unwrap();
        assert_eq!(status.checkout_type, CheckoutType::Exclusive);

        // Nobody else gets a checkout while the exclusive one is held
        let bob = harness.project_for("bob");
        assert!(!bob.file("/A").unwrap().checkout(false, &TaskMonitor::none()).unwrap());
    }

    #[test]
    fn test_scenario_checkin_merges_against_newer_version() {
        let harness = TandemTestHarness::new();
        let recorder = Arc::new(RecordingAdapter::default());
        harness.alice.register_adapter(recorder.clone());
        let bob = harness.project_for("bob");
        bob.register_adapter(recorder.clone());

        let file = harness
            .alice
            .create_file("/B", RECORDED_CONTENT_TYPE, ItemKind::Database, b"1\n2\n3\n4\n5\n")
            .unwrap();
        file.add_to_repository(None, false, &TaskMonitor::none()).unwrap();
        harness.commit(&harness.alice, "/B", "1\n2\n3\n4\n5\nv2\n");
        harness.commit(&harness.alice, "/B", "1\n2\n3\n4\n5\nv3\n");
        assert_eq!(file.latest_version(), 3);

        // Alice checks out at version 3 and edits the top
        assert!(file.checkout(false, &TaskMonitor::none()).unwrap());
        assert_eq!(file.version(), 3);
        edit(&file, "one\n2\n3\n4\n5\nv3\n");

        // Bob advances the repository to version 4 by editing the bottom
        let bob_version = harness.commit(&bob, "/B", "1\n2\n3\n4\nfive\nv3\n");
        assert_eq!(bob_version, 4);
        assert!(!file.can_merge());
        file.refresh().unwrap();
        assert!(file.can_merge());
        assert_eq!(file.changes_by_others_since_checkout().unwrap().changes.len(), 1);

        let outcome = file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap();
        assert_eq!(outcome, CheckinOutcome::Committed { version: 5, fast_path: false });

        let calls = recorder.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.target_label, "B@5");
        assert_eq!(call.target_version, Some(5));
        assert_eq!(call.source_label, "B (local)");
        assert_eq!(call.original_version, Some(3));
        assert_eq!(call.latest_version, Some(4));
        assert_eq!(call.latest_changes, 1);

        assert_eq!(file.state().unwrap(), FileState::Versioned);
        assert_eq!(read(&file), "one\n2\n3\n4\nfive\nv3\n");
    }

    #[test]
    fn test_scenario_delete_hijacked_reveals_repository_file() {
        let harness = TandemTestHarness::new();
        let file = harness
            .alice
            .create_file("/C", TEXT_CONTENT_TYPE, ItemKind::Database, b"c\n")
            .unwrap();
        let object = file.open_for_update(false).unwrap();
        file.add_to_repository(None, false, &TaskMonitor::none()).unwrap();
        assert!(object.is_stale());
        file.release(&object).unwrap();

        assert_eq!(file.state().unwrap(), FileState::Hijacked);
        assert!(file.is_hijacked());
        assert_eq!(file.latest_version(), 0);

        file.delete().unwrap();
        assert_eq!(file.state().unwrap(), FileState::Versioned);
        assert!(!file.is_checked_out());
        assert!(harness.repository.exists("/", "C").unwrap());
    }

    #[test]
    fn test_checkout_undo_round_trip_is_identity() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/round.txt", "x\n");
        let before = (file.state().unwrap(), file.latest_version(), file.file_id());

        file.checkout(false, &TaskMonitor::none()).unwrap();
        file.undo_checkout(false, false, false).unwrap();

        assert_eq!((file.state().unwrap(), file.latest_version(), file.file_id()), before);
        assert!(harness.repository.checkouts("/", "round.txt").unwrap().is_empty());
        assert!(!harness.alice.local_store().exists("/", "round.txt").unwrap());
    }

    #[test]
    fn test_racing_checkin_forces_merge_path() {
        let harness = TandemTestHarness::new();
        harness.versioned(&harness.alice, "/race.txt", "top\nmiddle\nbottom\n");

        let racing = Arc::new(RacingRepository::new(harness.repository.clone()));
        let carol = harness.project_with("carol", |builder| builder.repository(racing.clone()));
        let file = carol.file("/race.txt").unwrap();
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "top\nmiddle\nBOTTOM\n");

        racing.arm("TOP\nmiddle\nbottom\n");
        let outcome = file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap();
        assert_eq!(outcome, CheckinOutcome::Committed { version: 3, fast_path: false });
        assert_eq!(read(&file), "TOP\nmiddle\nBOTTOM\n");

        let history = file.version_history().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].user, "mallory");
        assert_eq!(history[2].user, "carol");
    }

    #[test]
    fn test_fast_path_when_repository_did_not_move() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/fast.txt", "a\n");
        for expected in 2..5 {
            file.checkout(false, &TaskMonitor::none()).unwrap();
            let baseline = file.version();
            edit(&file, &format!("a\n{}\n", expected));
            let outcome = file
                .checkin(&CheckinOptions::default(), &TaskMonitor::none())
                .unwrap();
            assert_eq!(outcome, CheckinOutcome::Committed { version: baseline + 1, fast_path: true });
            assert_eq!(file.latest_version(), expected);
        }
    }

    #[test]
    fn test_always_merge_disables_fast_path() {
        let harness = TandemTestHarness::new();
        harness.versioned(&harness.alice, "/slow.txt", "a\n");
        let dave = harness.project_with("dave", |builder| builder.always_merge(true));
        let file = dave.file("/slow.txt").unwrap();
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "b\n");
        let outcome = file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap();
        assert_eq!(outcome, CheckinOutcome::Committed { version: 2, fast_path: false });
    }

    #[test]
    fn test_aborted_merge_leaves_local_untouched() {
        let harness = TandemTestHarness::new();
        harness.alice.register_adapter(Arc::new(AbortingAdapter));
        let bob = harness.project_for("bob");
        bob.register_adapter(Arc::new(AbortingAdapter));

        let file = harness
            .alice
            .create_file("/abort.txt", ABORTING_CONTENT_TYPE, ItemKind::Database, b"base\n")
            .unwrap();
        file.add_to_repository(None, false, &TaskMonitor::none()).unwrap();
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "mine\n");
        let local_before = file.local_item().unwrap();

        harness.commit(&bob, "/abort.txt", "theirs\n");

        let outcome = file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap();
        assert_eq!(outcome, CheckinOutcome::Aborted);
        file.refresh().unwrap();
        assert_eq!(file.latest_version(), 2);

        assert_eq!(file.merge(&TaskMonitor::none()).unwrap(), MergeOutcome::Aborted);
        let local_after = harness.alice.local_store().get_item("/", "abort.txt").unwrap().unwrap();
        assert_eq!(local_after.current_version, local_before.current_version);
        assert_eq!(local_after.checkout, local_before.checkout);
        assert_eq!(read(&file), "mine\n");
        assert!(!harness.alice.local_store().exists("/", "abort.txt.merge").unwrap());
        assert!(!file.is_busy());
    }

    #[test]
    fn test_merge_into_stale_checkout() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/m.txt", "a\nb\nc\nd\n");
        let bob = harness.project_for("bob");

        file.checkout(false, &TaskMonitor::none()).unwrap();
        assert!(matches!(file.merge(&TaskMonitor::none()), Err(TandemError::NotUpdated(_))));
        edit(&file, "A\nb\nc\nd\n");
        harness.commit(&bob, "/m.txt", "a\nb\nc\nD\n");

        let outcome = file.merge(&TaskMonitor::none()).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { version: 2 });
        assert_eq!(read(&file), "A\nb\nc\nD\n");
        assert_eq!(file.version(), 2);
        assert!(file.modified_since_checkout());
        assert_eq!(file.checkout_status().unwrap().unwrap().checkout_version, 2);

        let keep = harness.alice.file("/m.txt.keep").unwrap();
        assert_eq!(keep.state().unwrap(), FileState::Private);
        assert_eq!(read(&keep), "A\nb\nc\nd\n");

        let outcome = file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap();
        assert_eq!(outcome, CheckinOutcome::Committed { version: 3, fast_path: true });
    }

    #[test]
    fn test_quick_merge_of_unmodified_checkout() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/q.txt", "one\n");
        file.checkout(false, &TaskMonitor::none()).unwrap();
        let bob = harness.project_for("bob");
        harness.commit(&bob, "/q.txt", "two\n");

        assert_eq!(file.merge(&TaskMonitor::none()).unwrap(), MergeOutcome::Rebased { version: 2 });
        assert_eq!(read(&file), "two\n");
        assert!(!file.modified_since_checkout());
        assert!(!harness.alice.local_store().exists("/", "q.txt.keep").unwrap());
    }

    #[test]
    fn test_transient_project_cannot_merge() {
        let harness = TandemTestHarness::new();
        harness.versioned(&harness.alice, "/t.txt", "t\n");
        let viewer = harness.project_with("viewer", |builder| builder.transient(true));
        let file = viewer.file("/t.txt").unwrap();
        assert!(file.checkout(false, &TaskMonitor::none()).unwrap());
        assert_eq!(file.checkout_status().unwrap().unwrap().checkout_type, CheckoutType::Transient);
        assert!(file.is_checked_out_exclusive());
        assert!(matches!(file.merge(&TaskMonitor::none()), Err(TandemError::Unsupported(_))));
    }

    #[test]
    fn test_checkin_with_keep_file() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/k.txt", "v1\n");
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "v2\n");
        let options = CheckinOptions {
            comment: Some("second".to_string()),
            create_keep_file: true,
            ..Default::default()
        };
        file.checkin(&options, &TaskMonitor::none()).unwrap();

        let keep = harness.alice.file("/k.txt.keep").unwrap();
        assert_eq!(read(&keep), "v2\n");
        assert_ne!(keep.file_id(), file.file_id());
        let history = file.version_history().unwrap();
        assert_eq!(history.last().unwrap().comment.as_deref(), Some("second"));
    }

    #[test]
    fn test_undo_checkout_keep_names_never_collide() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/n.txt", "n\n");
        for i in 0..3 {
            file.checkout(false, &TaskMonitor::none()).unwrap();
            edit(&file, &format!("edit {}\n", i));
            file.undo_checkout(true, false, false).unwrap();
        }
        let files = harness.alice.list_files().unwrap();
        assert!(files.contains(&"/n.txt.keep".to_string()));
        assert!(files.contains(&"/n.txt.keep.1".to_string()));
        assert!(files.contains(&"/n.txt.keep.2".to_string()));
        assert_eq!(read(&harness.alice.file("/n.txt.keep.2").unwrap()), "edit 2\n");
    }

    #[test]
    fn test_identity_mismatch_on_authenticated_repository() {
        let harness = TandemTestHarness::with_options(RepositoryOptions {
            authenticated: true,
            ..RepositoryOptions::default()
        });
        let file = harness.versioned(&harness.alice, "/id.txt", "x\n");
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "y\n");

        harness.repository.set_user(Some("mallory".to_string()));
        assert!(matches!(
            file.checkin(&CheckinOptions::default(), &TaskMonitor::none()),
            Err(TandemError::IdentityMismatch { .. })
        ));
        harness.repository.set_user(None);
        assert!(matches!(
            file.checkin(&CheckinOptions::default(), &TaskMonitor::none()),
            Err(TandemError::NotConnected(_))
        ));

        harness.repository.set_user(Some("alice".to_string()));
        assert!(file.checkin(&CheckinOptions::default(), &TaskMonitor::none()).is_ok());
        assert!(matches!(
            file.convert_to_private(&TaskMonitor::none()),
            Err(TandemError::Unsupported(_))
        ));
    }

    #[test]
    fn test_terminated_checkout_is_repaired_on_refresh() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/r.txt", "r\n");
        file.checkout(false, &TaskMonitor::none()).unwrap();
        let checkout_id = file.checkout_status().unwrap().unwrap().checkout_id;

        let bob = harness.project_for("bob");
        bob.file("/r.txt").unwrap().terminate_checkout(checkout_id).unwrap();

        file.refresh().unwrap();
        assert!(!file.is_checked_out());
        assert_eq!(file.state().unwrap(), FileState::Hijacked);
    }

    #[test]
    fn test_offline_repository() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/off.txt", "o\n");
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "p\n");

        harness.repository.set_online(false);
        assert!(matches!(
            file.checkin(&CheckinOptions::default(), &TaskMonitor::none()),
            Err(TandemError::NotConnected(_))
        ));
        assert!(matches!(file.undo_checkout(false, false, false), Err(TandemError::NotConnected(_))));
        assert_eq!(file.state().unwrap(), FileState::CheckedOut);
        assert!(harness.alice.list_files().unwrap().contains(&"/off.txt".to_string()));

        harness.repository.set_online(true);
        file.checkin(&CheckinOptions::default(), &TaskMonitor::none()).unwrap();
        assert_eq!(file.latest_version(), 2);
    }

    #[test]
    fn test_rename_move_copy_delete_versioned() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/docs/plan.txt", "plan\n");
        let bob = harness.project_for("bob");
        harness.commit(&bob, "/docs/plan.txt", "plan v2\n");

        file.rename("roadmap.txt").unwrap();
        assert_eq!(file.path(), "/docs/roadmap.txt");
        file.move_to("/archive").unwrap();
        assert_eq!(file.path(), "/archive/roadmap.txt");
        assert!(Arc::ptr_eq(&file, &harness.alice.file("/archive/roadmap.txt").unwrap()));
        assert_eq!(file.version_history().unwrap().len(), 2);

        let copy = file.copy_version_to(1, "/archive", &TaskMonitor::none()).unwrap();
        assert_eq!(copy, "/archive/roadmap.txt_v1");
        assert_eq!(read(&harness.alice.file(&copy).unwrap()), "plan\n");

        let exported = harness.temp_dir.path().join("out.txt");
        assert_eq!(file.export(&exported).unwrap(), 8);
        assert_eq!(std::fs::read_to_string(&exported).unwrap(), "plan v2\n");

        file.delete_version(1).unwrap();
        assert_eq!(file.version_history().unwrap().len(), 1);
        file.delete().unwrap();
        assert!(!harness.repository.exists("/archive", "roadmap.txt").unwrap());
    }

    #[test]
    fn test_checked_out_version_is_protected() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/p.txt", "1\n");
        harness.commit(&harness.alice, "/p.txt", "2\n");
        file.checkout(false, &TaskMonitor::none()).unwrap();
        assert!(matches!(file.delete_version(2), Err(TandemError::InUse(_))));
    }

    #[test]
    fn test_convert_to_private() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/cv.txt", "cv\n");
        let original_id = file.file_id();
        file.convert_to_private(&TaskMonitor::none()).unwrap();
        assert_eq!(file.state().unwrap(), FileState::Private);
        assert_eq!(file.file_id(), original_id);
        assert_eq!(read(&file), "cv\n");
        assert!(!harness.repository.exists("/", "cv.txt").unwrap());

        let other = harness.versioned(&harness.alice, "/co.txt", "co\n");
        other.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&other, "edited\n");
        other.convert_to_private(&TaskMonitor::none()).unwrap();
        assert_eq!(other.state().unwrap(), FileState::Private);
        assert_eq!(read(&other), "edited\n");
    }

    #[test]
    fn test_add_keep_checked_out_and_reset_id() {
        let harness = TandemTestHarness::new();
        let file = harness
            .alice
            .create_file("/new.txt", TEXT_CONTENT_TYPE, ItemKind::Database, b"n\n")
            .unwrap();
        let previous_id = file.file_id().unwrap();
        let new_id = file.reset_file_id().unwrap();
        assert_ne!(new_id, previous_id);
        assert_eq!(file.file_id(), Some(new_id.clone()));

        file.add_to_repository(Some("keep"), true, &TaskMonitor::none()).unwrap();
        assert_eq!(file.state().unwrap(), FileState::CheckedOut);
        assert_eq!(file.version(), 1);
        assert_eq!(harness.repository.get_item("/", "new.txt").unwrap().unwrap().file_id, new_id);
        assert!(matches!(file.reset_file_id(), Err(TandemError::Unsupported(_))));
    }

    #[traced_test]
    #[test]
    fn test_keep_checked_out_across_checkins() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/log.txt", "l\n");
        file.checkout(true, &TaskMonitor::none()).unwrap();
        let checkout_id = file.checkout_status().unwrap().unwrap().checkout_id;
        let options = CheckinOptions {
            keep_checked_out: true,
            ..Default::default()
        };
        for i in 0..3 {
            edit(&file, &format!("l{}\n", i));
            file.checkin(&options, &TaskMonitor::none()).unwrap();
            assert_eq!(file.state().unwrap(), FileState::CheckedOut);
            assert!(!file.modified_since_checkout());
        }
        let status = file.checkout_status().unwrap().unwrap();
        assert_eq!(status.checkout_id, checkout_id);
        assert_eq!(status.checkout_version, 4);
        assert!(matches!(
            file.checkin(&options, &TaskMonitor::none()),
            Err(TandemError::NoChanges(_))
        ));
    }

    #[test]
    fn test_listener_sees_post_transition_state() {
        struct StateObserver {
            project: Mutex<Option<Project>>,
            seen: Mutex<Vec<(String, Option<FileState>)>>,
        }
        impl FileListener for StateObserver {
            fn file_status_changed(&self, path: &str, _file_id_set: bool) {
                let project = self.project.lock().clone();
                if let Some(project) = project {
                    let state = project.file(path).ok().and_then(|f| f.state().ok());
                    self.seen.lock().push((path.to_string(), state));
                }
            }
        }

        let observer = Arc::new(StateObserver {
            project: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        });
        let harness = TandemTestHarness::new();
        harness.versioned(&harness.alice, "/observer.txt", "p\n");
        let erin = harness.project_with("erin", |builder| builder.listener(observer.clone()));
        *observer.project.lock() = Some(erin.clone());

        let file = erin.file("/observer.txt").unwrap();
        file.checkout(false, &TaskMonitor::none()).unwrap();
        assert_eq!(
            observer.seen.lock().last().cloned(),
            Some(("/observer.txt".to_string(), Some(FileState::CheckedOut)))
        );
    }

    #[test]
    fn test_merge_survives_checkin_by_another_user_while_merging() {
        let harness = TandemTestHarness::new();
        let adapter = Arc::new(InterleavingAdapter::default());
        harness.alice.register_adapter(adapter.clone());
        let bob = harness.project_for("bob");
        bob.register_adapter(adapter.clone());

        let file = harness
            .alice
            .create_file("/i.txt", INTERLEAVING_CONTENT_TYPE, ItemKind::Database, b"a\nb\nc\nd\ne\n")
            .unwrap();
        file.add_to_repository(None, false, &TaskMonitor::none()).unwrap();
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "A\nb\nc\nd\ne\n");
        assert_eq!(harness.commit(&bob, "/i.txt", "a\nb\nc\nd\nE\n"), 2);

        // Bob checks in version 3 while Alice merges version 2
        let racer = bob.clone();
        adapter.during_next_merge(move || {
            let theirs = racer.file("/i.txt").unwrap();
            assert!(theirs.checkout(false, &TaskMonitor::none()).unwrap());
            edit(&theirs, "a\nb\nC\nd\nE\n");
            let outcome = theirs
                .checkin(&CheckinOptions::default(), &TaskMonitor::none())
                .unwrap();
            assert_eq!(outcome, CheckinOutcome::Committed { version: 3, fast_path: true });
        });

        let outcome = file.merge(&TaskMonitor::none()).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { version: 2 });
        assert_eq!(read(&file), "A\nb\nc\nd\nE\n");
        assert_eq!(file.checkout_status().unwrap().unwrap().checkout_version, 2);
        assert_eq!(file.latest_version(), 3);
        assert!(file.can_merge());

        let outcome = file.merge(&TaskMonitor::none()).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { version: 3 });
        assert_eq!(read(&file), "A\nb\nC\nd\nE\n");

        let outcome = file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap();
        assert_eq!(outcome, CheckinOutcome::Committed { version: 4, fast_path: true });
        assert!(!file.is_busy());
    }

    #[test]
    fn test_merge_fails_when_checkout_is_terminated_while_merging() {
        let harness = TandemTestHarness::new();
        let adapter = Arc::new(InterleavingAdapter::default());
        harness.alice.register_adapter(adapter.clone());
        let bob = harness.project_for("bob");
        bob.register_adapter(adapter.clone());

        let file = harness
            .alice
            .create_file("/t.txt", INTERLEAVING_CONTENT_TYPE, ItemKind::Database, b"a\nb\nc\n")
            .unwrap();
        file.add_to_repository(None, false, &TaskMonitor::none()).unwrap();
        file.checkout(false, &TaskMonitor::none()).unwrap();
        let checkout_id = file.checkout_status().unwrap().unwrap().checkout_id;
        edit(&file, "A\nb\nc\n");
        harness.commit(&bob, "/t.txt", "a\nb\nC\n");

        let admin = harness.repository.clone();
        adapter.during_next_merge(move || {
            admin.terminate_checkout("/", "t.txt", checkout_id).unwrap();
        });
        assert!(matches!(
            file.merge(&TaskMonitor::none()),
            Err(TandemError::NotCheckedOut(_))
        ));
        assert_eq!(read(&file), "A\nb\nc\n");
        assert!(!harness.alice.local_store().exists("/", "t.txt.merge").unwrap());
    }

    #[test]
    fn test_unreadable_checkout_table_keeps_local_checkout() {
        let harness = TandemTestHarness::new();
        let file = harness.versioned(&harness.alice, "/c.txt", "c\n");
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "changed\n");

        let table = harness.repository.root().join("c.txt.repo").join("checkouts.bin");
        std::fs::write(&table, [0xffu8, 0xff, 0xff]).unwrap();

        assert!(!file.refresh().unwrap());
        assert_eq!(file.state().unwrap(), FileState::CheckedOut);
        assert!(file.modified_since_checkout());
        assert_eq!(read(&file), "changed\n");
    }

    #[test]
    fn test_failed_release_after_checkin_undoes_checkout() {
        let harness = TandemTestHarness::new();
        harness.versioned(&harness.alice, "/r.txt", "r\n");
        let local = Arc::new(FsLocalStore::init(harness.temp_dir.path().join("frank-local")).unwrap());
        let failing = Arc::new(FailingLocalStore::new(local));
        let frank = harness.project_with("frank", |builder| builder.local_store(failing.clone()));

        let file = frank.file("/r.txt").unwrap();
        file.checkout(false, &TaskMonitor::none()).unwrap();
        edit(&file, "r2\n");
        failing.fail_deletes(1);

        let err = file
            .checkin(&CheckinOptions::default(), &TaskMonitor::none())
            .unwrap_err();
        assert!(matches!(err, TandemError::Io(_)));

        // The version landed; the checkout is gone on both sides
        assert_eq!(harness.repository.versions("/", "r.txt").unwrap().len(), 2);
        assert!(harness.repository.checkouts("/", "r.txt").unwrap().is_empty());
        assert!(!frank.local_store().exists("/", "r.txt").unwrap());
        file.refresh().unwrap();
        assert_eq!(file.state().unwrap(), FileState::Versioned);
        assert!(!file.is_busy());
    }
}
