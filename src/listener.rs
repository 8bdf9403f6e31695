//! File change notifications
//!
//! The file state machine collects [`FileEvent`]s while it holds its lock and
//! dispatches them to the project's [`FileListener`] after the lock has been
//! released and the state transition has committed. Listeners therefore
//! always observe the post-transition state and may call back into the file.

use parking_lot::Mutex;
use tracing::debug;

/// Receiver of file notifications
///
/// All methods have empty default implementations.
pub trait FileListener: Send + Sync {
    /// The state of the file at `path` changed
    ///
    /// `file_id_set` is true when the file identity was just established.
    fn file_status_changed(&self, _path: &str, _file_id_set: bool) {}

    /// A file was renamed within its folder
    fn file_renamed(&self, _old_path: &str, _new_path: &str) {}

    /// A file was moved to another folder
    fn file_moved(&self, _old_path: &str, _new_path: &str) {}

    /// The open domain object of a file was closed or detached
    fn domain_object_closed(&self, _path: &str) {}

    /// The generation backing an open domain object was replaced
    fn domain_object_replaced(&self, _path: &str) {}
}

/// Listener that ignores all notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpListener;

impl FileListener for NoOpListener {}

/// Listener that logs notifications through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl FileListener for TracingListener {
    fn file_status_changed(&self, path: &str, file_id_set: bool) {
        debug!(path, file_id_set, "file status changed");
    }

    fn file_renamed(&self, old_path: &str, new_path: &str) {
        debug!(old_path, new_path, "file renamed");
    }

    fn file_moved(&self, old_path: &str, new_path: &str) {
        debug!(old_path, new_path, "file moved");
    }

    fn domain_object_closed(&self, path: &str) {
        debug!(path, "domain object closed");
    }

    fn domain_object_replaced(&self, path: &str) {
        debug!(path, "domain object replaced");
    }
}

/// A notification waiting to be dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// See [`FileListener::file_status_changed`]
    StatusChanged {
        /// File path
        path: String,
        /// Identity just established
        file_id_set: bool,
    },
    /// See [`FileListener::file_renamed`]
    Renamed {
        /// Path before the rename
        old_path: String,
        /// Path after the rename
        new_path: String,
    },
    /// See [`FileListener::file_moved`]
    Moved {
        /// Path before the move
        old_path: String,
        /// Path after the move
        new_path: String,
    },
    /// See [`FileListener::domain_object_closed`]
    ObjectClosed {
        /// File path
        path: String,
    },
    /// See [`FileListener::domain_object_replaced`]
    ObjectReplaced {
        /// File path
        path: String,
    },
}

impl FileEvent {
    /// Deliver the event
    pub fn dispatch(&self, listener: &dyn FileListener) {
        match self {
            FileEvent::StatusChanged { path, file_id_set } => {
                listener.file_status_changed(path, *file_id_set)
            }
            FileEvent::Renamed { old_path, new_path } => listener.file_renamed(old_path, new_path),
            FileEvent::Moved { old_path, new_path } => listener.file_moved(old_path, new_path),
            FileEvent::ObjectClosed { path } => listener.domain_object_closed(path),
            FileEvent::ObjectReplaced { path } => listener.domain_object_replaced(path),
        }
    }
}

/// Listener that records every notification in order
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<FileEvent>>,
}

impl RecordingListener {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded events
    pub fn events(&self) -> Vec<FileEvent> {
        self.events.lock().clone()
    }

    /// Remove and return all recorded events
    pub fn take(&self) -> Vec<FileEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl FileListener for RecordingListener {
    fn file_status_changed(&self, path: &str, file_id_set: bool) {
        self.events.lock().push(FileEvent::StatusChanged {
            path: path.to_string(),
            file_id_set,
        });
    }

    fn file_renamed(&self, old_path: &str, new_path: &str) {
        self.events.lock().push(FileEvent::Renamed {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        });
    }

    fn file_moved(&self, old_path: &str, new_path: &str) {
        self.events.lock().push(FileEvent::Moved {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        });
    }

    fn domain_object_closed(&self, path: &str) {
        self.events.lock().push(FileEvent::ObjectClosed {
            path: path.to_string(),
        });
    }

    fn domain_object_replaced(&self, path: &str) {
        self.events.lock().push(FileEvent::ObjectReplaced {
            path: path.to_string(),
        });
    }
}
