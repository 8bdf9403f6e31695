//! Crash-recovery snapshots
//!
//! The [`RecoveryCoordinator`] writes the unsaved content of every open,
//! changed domain object into the recovery slot of its local item. Files that
//! are busy with a checkin or merge are skipped and picked up by the next run.

use crate::project::Project;
use rayon::prelude::*;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshots open domain objects of one project
#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    project: Project,
}

impl RecoveryCoordinator {
    /// Create a coordinator for `project`
    pub fn new(project: Project) -> Self {
        Self { project }
    }

    /// Snapshot every open, changed domain object
    ///
    /// Returns the number of snapshots written. Failures are logged and do
    /// not stop the remaining files.
    pub fn snapshot_all(&self) -> usize {
        let start = Instant::now();
        let files: Vec<_> = self
            .project
            .cached_files()
            .into_iter()
            .filter(|file| file.open_object().is_some())
            .collect();

        let written = files
            .par_iter()
            .filter(|file| match file.take_recovery_snapshot() {
                Ok(written) => written,
                Err(e) => {
                    warn!("Recovery snapshot of {} failed: {}", file.path(), e);
                    false
                }
            })
            .count();

        if written > 0 {
            info!("Wrote {} recovery snapshots in {:?}", written, start.elapsed());
        } else {
            debug!("No recovery snapshots needed ({} open files)", files.len());
        }
        written
    }

    /// Run [`RecoveryCoordinator::snapshot_all`] every `interval` on the tokio runtime
    pub fn spawn(self, interval: Duration) -> RecoveryTask {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let coordinator = self.clone();
                        match tokio::task::spawn_blocking(move || coordinator.snapshot_all()).await {
                            Ok(_) => {}
                            Err(e) => warn!("Recovery snapshot task failed: {}", e),
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Recovery coordinator stopped");
        });
        RecoveryTask { stop, handle }
    }
}

/// Handle of a running periodic recovery task
#[derive(Debug)]
pub struct RecoveryTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RecoveryTask {
    /// Stop the task and wait for the current run to finish
    pub async fn shutdown(self) {
        if self.stop.send(true).is_err() {
            debug!("Recovery task already stopped");
        }
        if let Err(e) = self.handle.await {
            warn!("Recovery task ended abnormally: {}", e);
        }
    }
}
