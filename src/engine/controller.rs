use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use chrono::Local;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::executor::{ScrapeExecutor, ScrapeRequest};
use crate::engine::filter::TaskFilter;
use crate::engine::registry::{RunCompletion, RunSpec, StatusCounters, TaskRegistry};
use crate::engine::scheduler::{Scheduler, Tick};
use crate::engine::task::{NewTask, Task, TaskFields, TaskId, TaskStatus};
use crate::engine::view::TaskView;
use crate::error::{Result, ScrapeError};
use crate::storage::cookies::CookieStore;
use crate::utils::metrics::RequestTimer;

/// Handle to one in-flight run
pub struct RunHandle {
    pub id: TaskId,
    handle: JoinHandle<Option<Task>>,
}

impl RunHandle {
    /// Wait for the run to finish and return the final task state.
    ///
    /// `None` means the task was removed before the run completed.
    pub async fn wait(self) -> Option<Task> {
        match self.handle.await {
            Ok(task) => task,
            Err(e) => {
                error!("Run of task {} was aborted: {}", self.id, e);
                None
            }
        }
    }
}

struct ControllerInner {
    registry: TaskRegistry,
    scheduler: Arc<Scheduler>,
    executor: Arc<dyn ScrapeExecutor>,
    cookies: Arc<dyn CookieStore>,
    view: Arc<dyn TaskView>,
    template: NewTask,
}

/// Entry point for every task operation: registry edits, runs and timers.
///
/// Cloning is cheap; all clones drive the same registry and scheduler.
#[derive(Clone)]
pub struct TaskController {
    inner: Arc<ControllerInner>,
}

impl TaskController {
    /// Create a controller and start serving scheduler ticks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        executor: Arc<dyn ScrapeExecutor>,
        cookies: Arc<dyn CookieStore>,
        view: Arc<dyn TaskView>,
    ) -> Self {
        Self::with_template(executor, cookies, view, NewTask::template())
    }

    /// Like [`TaskController::new`], with `template` used by [`TaskController::add_template`]
    pub fn with_template(
        executor: Arc<dyn ScrapeExecutor>,
        cookies: Arc<dyn CookieStore>,
        view: Arc<dyn TaskView>,
        template: NewTask,
    ) -> Self {
        let (scheduler, ticks) = Scheduler::new();
        let scheduler = Arc::new(scheduler);
        let registry = TaskRegistry::with_listener(scheduler.clone());

        let inner = Arc::new(ControllerInner {
            registry,
            scheduler,
            executor,
            cookies,
            view,
            template,
        });

        tokio::spawn(dispatch_ticks(Arc::downgrade(&inner), ticks));

        Self { inner }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Add a task; a non-zero interval arms its timer
    pub async fn add(&self, task: NewTask) -> Result<TaskId> {
        let id = self.inner.registry.add(task).await?;
        self.inner.notify_counters().await;
        Ok(id)
    }

    pub async fn add_template(&self) -> Result<TaskId> {
        self.add(self.inner.template.clone()).await
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.inner.registry.get(id).await
    }

    pub async fn list(&self) -> Vec<Task> {
        self.inner.registry.list().await
    }

    pub async fn list_matching(&self, filter: &TaskFilter) -> Vec<Task> {
        self.inner.registry.list_matching(filter).await
    }

    pub async fn update<F>(&self, id: TaskId, mutator: F) -> Result<Task>
    where
        F: FnOnce(&mut TaskFields),
    {
        let result = self.inner.registry.update(id, mutator).await;
        if let Err(ScrapeError::LockedTask(_)) = &result {
            warn!("Rejected edit of running task {}", id);
        }
        result
    }

    pub async fn set_headers_json(&self, id: TaskId, raw: &str) -> Result<Task> {
        self.inner.registry.set_headers_json(id, raw).await
    }

    /// Set the recurring interval of a task and re-arm its timer; 0 disables it.
    pub async fn configure_timer(&self, id: TaskId, seconds: u64) -> Result<()> {
        self.inner.registry.set_interval(id, seconds).await
    }

    pub async fn clear_results(&self, id: TaskId) -> Result<()> {
        self.inner.registry.clear_results(id).await
    }

    pub async fn remove(&self, id: TaskId) -> Result<Task> {
        let removed = self.inner.registry.remove(id).await?;
        self.inner.notify_counters().await;
        Ok(removed)
    }

    pub async fn remove_many(&self, ids: &[TaskId]) -> Vec<Task> {
        let removed = self.inner.registry.remove_many(ids).await;
        self.inner.notify_counters().await;
        removed
    }

    pub async fn clear(&self) {
        self.inner.registry.clear().await;
        self.inner.notify_counters().await;
    }

    /// Start a run of `id` without waiting for it.
    ///
    /// Fails with `AlreadyRunning` when the previous run has not finished.
    pub async fn run(&self, id: TaskId) -> Result<RunHandle> {
        let result = ControllerInner::start_run(&self.inner, id).await;
        if let Err(e) = &result {
            warn!("Run of task {} not started: {}", id, e);
        }
        result
    }

    /// Start runs for every listed task; tasks that cannot start are skipped
    pub async fn run_many(&self, ids: &[TaskId]) -> Vec<RunHandle> {
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(handle) = self.run(*id).await {
                handles.push(handle);
            }
        }
        handles
    }

    pub async fn counters(&self) -> StatusCounters {
        self.inner.registry.counters().await
    }

    /// Ordered copy of every task, suitable for saving
    pub async fn snapshot(&self) -> Vec<Task> {
        self.inner.registry.list().await
    }

    /// Replace every task with `tasks` and re-arm their timers
    pub async fn restore(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskId>> {
        // Old timers are disarmed and new ones armed once every task validated
        let ids = self.inner.registry.replace_all(tasks).await?;

        info!("Restored {} tasks", ids.len());
        self.inner.notify_counters().await;
        Ok(ids)
    }

    /// Disarm every timer. In-flight runs still complete.
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel_all();
    }
}

impl ControllerInner {
    async fn notify_counters(&self) {
        let counters = self.registry.counters().await;
        self.view.counters_changed(counters);
    }

    async fn start_run(inner: &Arc<Self>, id: TaskId) -> Result<RunHandle> {
        let spec = inner.registry.begin_run(id).await?;

        inner.view.row_locked(id, true);
        inner.view.status_changed(id, TaskStatus::Running, "Running");
        inner.notify_counters().await;

        let engine = Arc::clone(inner);
        let handle = tokio::spawn(async move { engine.execute(id, spec).await });
        Ok(RunHandle { id, handle })
    }

    async fn execute(&self, id: TaskId, spec: RunSpec) -> Option<Task> {
        let request = ScrapeRequest {
            cookie_ref: self.cookies.path_for(&spec.url),
            url: spec.url,
            selector: spec.selector,
            method: spec.method,
            params: spec.params,
        };

        debug!("Executing task {} against {}", id, request.url);
        let timer = RequestTimer::start();
        let result = AssertUnwindSafe(self.executor.execute(&request))
            .catch_unwind()
            .await;
        let duration_ms = timer.end();

        let outcome = match result {
            Ok(Ok(outcome)) => {
                if !outcome.cookies.is_empty() {
                    if let Err(e) = self.cookies.save(&request.url, &outcome.cookies) {
                        warn!("Failed to store cookies for {}: {}", request.url, e);
                    }
                }
                Ok(outcome.records)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("executor panicked".to_string()),
        };

        let completion = RunCompletion {
            finished_at: Local::now().naive_local(),
            duration_ms,
            outcome,
        };
        let finished = self.registry.finish_run(id, completion).await;

        self.view.row_locked(id, false);
        match &finished {
            Some(task) => {
                let message = task.message.as_deref().unwrap_or_default();
                self.view.status_changed(id, task.status, message);
            }
            None => warn!("Task {} was removed while running; outcome discarded", id),
        }
        self.notify_counters().await;

        finished
    }
}

/// Turn scheduler ticks into runs until the controller is dropped
async fn dispatch_ticks(inner: Weak<ControllerInner>, mut ticks: mpsc::UnboundedReceiver<Tick>) {
    while let Some(tick) = ticks.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        if !inner.scheduler.is_current(&tick) {
            debug!("Dropping stale tick for task {}", tick.id);
            continue;
        }

        match ControllerInner::start_run(&inner, tick.id).await {
            Ok(_) => debug!("Scheduled run of task {} started", tick.id),
            Err(ScrapeError::AlreadyRunning(id)) => {
                debug!("Tick for task {} skipped: previous run still in flight", id)
            }
            Err(e) => warn!("Scheduled run of task {} failed to start: {}", tick.id, e),
        }
    }
    debug!("Tick dispatcher stopped");
}
