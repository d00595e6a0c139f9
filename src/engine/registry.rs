use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::engine::filter::TaskFilter;
use crate::engine::task::{
    NewTask, RunRecord, ScrapeMethod, ScrapeRecord, Task, TaskFields, TaskId, TaskParams,
    TaskStatus,
};
use crate::error::{Result, ScrapeError};

/// Hook invoked synchronously, under the registry write lock, whenever the
/// schedule of a task changes or tasks leave the registry
#[cfg_attr(test, mockall::automock)]
pub trait RegistryListener: Send + Sync {
    /// A task got a new interval, 0 meaning no schedule
    fn interval_changed(&self, id: TaskId, seconds: u64);
    fn task_removed(&self, id: TaskId);
    fn registry_cleared(&self);
}

/// Aggregate status counters, always derived from a full scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounters {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub error: usize,
    pub stopped: usize,
}

impl StatusCounters {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counters = Self::default();
        for task in tasks {
            counters.total += 1;
            match task.status {
                TaskStatus::Pending => counters.pending += 1,
                TaskStatus::Running => counters.running += 1,
                TaskStatus::Success => counters.success += 1,
                TaskStatus::Error => counters.error += 1,
                TaskStatus::Stopped => counters.stopped += 1,
            }
        }
        counters
    }
}

impl fmt::Display for StatusCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {} | running {} | success {} | error {} | stopped {}",
            self.total, self.running, self.success, self.error, self.stopped
        )
    }
}

/// Snapshot of the identity of a task taken when its run starts
#[derive(Debug, Clone)]
pub(crate) struct RunSpec {
    pub url: String,
    pub selector: String,
    pub method: ScrapeMethod,
    pub params: TaskParams,
}

/// What the execution engine reports back for one run
#[derive(Debug, Clone)]
pub(crate) struct RunCompletion {
    pub finished_at: NaiveDateTime,
    pub duration_ms: u64,
    pub outcome: std::result::Result<Vec<ScrapeRecord>, String>,
}

/// In-memory registry of tasks keyed by a stable id
pub struct TaskRegistry {
    /// Tasks ordered by id, which is also insertion order
    tasks: RwLock<BTreeMap<TaskId, Task>>,

    /// Next id to hand out; never rewinds, even on clear
    next_id: AtomicU64,

    /// Notified of interval changes and before any task is removed
    listener: Option<Arc<dyn RegistryListener>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            listener: None,
        }
    }

    pub fn with_listener(listener: Arc<dyn RegistryListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new()
        }
    }

    fn allocate_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn notify_interval(&self, id: TaskId, seconds: u64) {
        if let Some(listener) = &self.listener {
            listener.interval_changed(id, seconds);
        }
    }

    /// Add a task and return its id
    pub async fn add(&self, task: NewTask) -> Result<TaskId> {
        task.fields().validate()?;

        let interval = task.interval_seconds;
        let mut tasks = self.tasks.write().await;
        let id = self.allocate_id();
        tasks.insert(id, task.into_task(id));
        if interval > 0 {
            self.notify_interval(id, interval);
        }
        debug!("Added task {}", id);
        Ok(id)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ScrapeError::TaskNotFound(id))
    }

    /// Apply `mutator` to the editable fields of a task.
    ///
    /// The edit is validated as a whole and either fully applied or not at
    /// all. A running task rejects changes to url, selector and method.
    pub async fn update<F>(&self, id: TaskId, mutator: F) -> Result<Task>
    where
        F: FnOnce(&mut TaskFields),
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(ScrapeError::TaskNotFound(id))?;

        let current = task.fields();
        let mut edited = current.clone();
        mutator(&mut edited);

        if task.status == TaskStatus::Running && edited.identity_differs(&current) {
            return Err(ScrapeError::LockedTask(id));
        }
        edited.validate()?;

        task.url = edited.url;
        task.selector = edited.selector;
        task.method = edited.method;
        task.params = edited.params;
        Ok(task.clone())
    }

    /// Replace the request headers from a raw JSON object
    pub async fn set_headers_json(&self, id: TaskId, raw: &str) -> Result<Task> {
        let headers = TaskParams::parse_headers(raw)?;
        self.update(id, |fields| fields.params.headers = headers).await
    }

    /// Set the recurring interval of a task; the listener re-arms its timer before the lock is released
    pub async fn set_interval(&self, id: TaskId, seconds: u64) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(ScrapeError::TaskNotFound(id))?;
        task.interval_seconds = seconds;
        self.notify_interval(id, seconds);
        Ok(())
    }

    pub async fn clear_results(&self, id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(ScrapeError::TaskNotFound(id))?;
        task.results.clear();
        Ok(())
    }

    pub async fn remove(&self, id: TaskId) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&id) {
            return Err(ScrapeError::TaskNotFound(id));
        }
        if let Some(listener) = &self.listener {
            listener.task_removed(id);
        }
        let removed = tasks.remove(&id).ok_or(ScrapeError::TaskNotFound(id))?;
        debug!("Removed task {}", id);
        Ok(removed)
    }

    /// Remove every listed task that exists; unknown ids are ignored
    pub async fn remove_many(&self, ids: &[TaskId]) -> Vec<Task> {
        let mut tasks = self.tasks.write().await;
        let mut removed = Vec::new();
        for id in ids {
            if !tasks.contains_key(id) {
                continue;
            }
            if let Some(listener) = &self.listener {
                listener.task_removed(*id);
            }
            if let Some(task) = tasks.remove(id) {
                removed.push(task);
            }
        }
        removed
    }

    pub async fn clear(&self) {
        let mut tasks = self.tasks.write().await;
        if let Some(listener) = &self.listener {
            listener.registry_cleared();
        }
        tasks.clear();
    }

    /// Swap the whole content for `new_tasks` in one step.
    ///
    /// Every task is validated before anything is cleared. Restored tasks are
    /// never left `Running`.
    pub(crate) async fn replace_all(&self, new_tasks: Vec<NewTask>) -> Result<Vec<TaskId>> {
        for task in &new_tasks {
            task.fields().validate()?;
        }

        let mut tasks = self.tasks.write().await;
        if let Some(listener) = &self.listener {
            listener.registry_cleared();
        }
        tasks.clear();

        let mut ids = Vec::with_capacity(new_tasks.len());
        for mut task in new_tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Stopped;
            }
            let id = self.allocate_id();
            let interval = task.interval_seconds;
            tasks.insert(id, task.into_task(id));
            if interval > 0 {
                self.notify_interval(id, interval);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    pub async fn list(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Tasks accepted by `filter`, in id order
    pub async fn list_matching(&self, filter: &TaskFilter) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    pub async fn ids(&self) -> Vec<TaskId> {
        self.tasks.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    pub async fn counters(&self) -> StatusCounters {
        StatusCounters::from_tasks(self.tasks.read().await.values())
    }

    /// Atomically move a task into `Running` and capture what to execute
    pub(crate) async fn begin_run(&self, id: TaskId) -> Result<RunSpec> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(ScrapeError::TaskNotFound(id))?;
        if task.status == TaskStatus::Running {
            return Err(ScrapeError::AlreadyRunning(id));
        }
        task.status = TaskStatus::Running;
        task.message = Some("Running".to_string());
        Ok(RunSpec {
            url: task.url.clone(),
            selector: task.selector.clone(),
            method: task.method,
            params: task.params.clone(),
        })
    }

    /// Record the end of a run. Returns `None` when the task was removed meanwhile.
    pub(crate) async fn finish_run(&self, id: TaskId, completion: RunCompletion) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id)?;

        let (status, message, record_count) = match completion.outcome {
            Ok(records) => {
                let count = records.len();
                task.results = records;
                (TaskStatus::Success, format!("Extracted {} records", count), count)
            }
            Err(message) => (TaskStatus::Error, message, 0),
        };

        task.status = status;
        task.last_run = Some(completion.finished_at);
        task.message = Some(message.clone());
        task.push_history(RunRecord {
            finished_at: completion.finished_at,
            status,
            message,
            record_count,
            duration_ms: completion.duration_ms,
        });
        Some(task.clone())
    }
}
