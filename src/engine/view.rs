use tracing::{debug, error, info};

use crate::engine::registry::StatusCounters;
use crate::engine::task::{TaskId, TaskStatus};

/// Sink the engine reports state changes to. Never read from.
#[cfg_attr(test, mockall::automock)]
pub trait TaskView: Send + Sync {
    /// Editing of url/selector/method is locked while a run is in flight
    fn row_locked(&self, id: TaskId, locked: bool);

    fn status_changed(&self, id: TaskId, status: TaskStatus, message: &str);

    fn counters_changed(&self, counters: StatusCounters);
}

/// View that writes every notification to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogView;

impl TaskView for LogView {
    fn row_locked(&self, id: TaskId, locked: bool) {
        if locked {
            debug!("Task {} locked for editing", id);
        } else {
            debug!("Task {} unlocked", id);
        }
    }

    fn status_changed(&self, id: TaskId, status: TaskStatus, message: &str) {
        match status {
            TaskStatus::Error => error!("Task {} finished: {} ({})", id, status, message),
            _ => info!("Task {}: {} ({})", id, status, message),
        }
    }

    fn counters_changed(&self, counters: StatusCounters) {
        info!("{}", counters);
    }
}

/// View that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullView;

impl TaskView for NullView {
    fn row_locked(&self, _id: TaskId, _locked: bool) {}
    fn status_changed(&self, _id: TaskId, _status: TaskStatus, _message: &str) {}
    fn counters_changed(&self, _counters: StatusCounters) {}
}
