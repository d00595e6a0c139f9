use std::time::Instant;

use serde::Serialize;

use crate::engine::task::{RunRecord, Task, TaskStatus};

/// Run statistics derived from the history of a set of tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    /// Runs recorded across all tasks
    pub total_runs: usize,

    /// Runs that ended in `Success`
    pub successful_runs: usize,

    /// Runs that ended in `Error`
    pub failed_runs: usize,

    /// Records extracted by all successful runs
    pub records_extracted: usize,

    /// Mean run duration in milliseconds
    pub average_duration_ms: u64,

    /// Longest run duration in milliseconds
    pub slowest_duration_ms: u64,
}

impl RunStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        Self::from_history(tasks.into_iter().flat_map(|task| task.history.iter()))
    }

    pub fn from_history<'a>(history: impl IntoIterator<Item = &'a RunRecord>) -> Self {
        let mut stats = Self::default();
        let mut total_duration: u64 = 0;

        for record in history {
            stats.total_runs += 1;
            match record.status {
                TaskStatus::Success => {
                    stats.successful_runs += 1;
                    stats.records_extracted += record.record_count;
                }
                TaskStatus::Error => stats.failed_runs += 1,
                _ => {}
            }
            total_duration = total_duration.saturating_add(record.duration_ms);
            stats.slowest_duration_ms = stats.slowest_duration_ms.max(record.duration_ms);
        }

        if stats.total_runs > 0 {
            stats.average_duration_ms = total_duration / stats.total_runs as u64;
        }
        stats
    }
}

/// Timer for measuring run durations
pub struct RequestTimer {
    /// Start time of the run
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
