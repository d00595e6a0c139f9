use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::config::AppConfig;
use crate::engine::controller::TaskController;
use crate::engine::executor::ScrapeExecutor;
use crate::engine::filter::TaskFilter;
use crate::engine::task::{ScrapeMethod, Task, TaskId, TaskStatus, TIMESTAMP_FORMAT};
use crate::engine::view::LogView;
use crate::fetch::HttpExecutor;
use crate::storage::cookies::{CookieStore, FileCookieStore};
use crate::storage::export::{self, ExportEntry, ExportFormat};
use crate::storage::session::{generate_session_name, SessionStore};
use crate::utils::metrics::RunStats;

/// Everything a command needs: configuration, stores and the task controller
pub struct Workspace {
    config: AppConfig,
    sessions: SessionStore,
    controller: TaskController,
}

impl Workspace {
    /// Workspace executing tasks over HTTP
    pub fn new(config: AppConfig) -> Self {
        let executor = Arc::new(HttpExecutor::new(config.http.clone()));
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: AppConfig, executor: Arc<dyn ScrapeExecutor>) -> Self {
        let cookies: Arc<dyn CookieStore> = Arc::new(FileCookieStore::new(&config.storage.cookies_dir));
        let sessions = SessionStore::new(
            &config.storage.sessions_dir,
            &config.storage.results_dir,
            cookies.clone(),
        );
        let controller = TaskController::with_template(
            executor,
            cookies,
            Arc::new(LogView),
            config.defaults.new_task(),
        );

        Self {
            config,
            sessions,
            controller,
        }
    }

    /// Restore `name` into the controller. Unknown sessions start empty.
    ///
    /// Timers stay armed only when `arm_timers` is set.
    async fn open(&self, name: &str, arm_timers: bool) -> Result<()> {
        match self.sessions.find(name)? {
            Some(session) => {
                self.sessions
                    .restore(&session, &self.controller)
                    .await
                    .context(format!("Failed to restore session: {}", name))?;
            }
            None => info!("Session '{}' not found, starting empty", name),
        }

        if !arm_timers {
            self.controller.shutdown();
        }
        Ok(())
    }

    async fn save(&self, name: &str) -> Result<PathBuf> {
        let tasks = self.controller.snapshot().await;
        let path = self
            .sessions
            .save(name, &tasks)
            .context(format!("Failed to save session: {}", name))?;
        Ok(path)
    }

    async fn task_id(&self, index: usize) -> Result<TaskId> {
        let ids = self.controller.registry().ids().await;
        match ids.get(index) {
            Some(id) => Ok(*id),
            None => bail!("No task at index {} (session has {} tasks)", index, ids.len()),
        }
    }
}

fn parse_method(method: &str) -> Result<ScrapeMethod> {
    method.parse::<ScrapeMethod>().map_err(anyhow::Error::msg)
}

fn format_last_run(task: &Task) -> String {
    task.last_run
        .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn print_tasks<'a>(rows: impl IntoIterator<Item = (usize, &'a Task)>) {
    println!(
        "{:<5} {:<8} {:<6} {:<8} {:<20} {:<8} URL / SELECTOR",
        "INDEX", "STATUS", "METHOD", "INTERVAL", "LAST RUN", "RESULTS"
    );
    for (index, task) in rows {
        println!(
            "{:<5} {:<8} {:<6} {:<8} {:<20} {:<8} {} {}",
            index,
            task.status,
            task.method,
            task.interval_seconds,
            format_last_run(task),
            task.results.len(),
            task.url,
            task.selector
        );
        if let Some(message) = &task.message {
            println!("      {}", message);
        }
        println!("      {}", task.params.summary());
    }
}

fn print_stats(stats: &RunStats) {
    println!(
        "Runs: {} ({} ok, {} failed), {} records, avg {} ms, slowest {} ms",
        stats.total_runs,
        stats.successful_runs,
        stats.failed_runs,
        stats.records_extracted,
        stats.average_duration_ms,
        stats.slowest_duration_ms
    );
}

/// Add a task to a session
pub async fn task_add(
    workspace: &Workspace,
    session: &str,
    url: Option<String>,
    selector: Option<String>,
    method: Option<String>,
    interval: u64,
) -> Result<()> {
    workspace.open(session, false).await?;

    let added = if url.is_none() && selector.is_none() && method.is_none() {
        workspace.controller.add_template().await
    } else {
        let mut task = workspace.config.defaults.new_task();
        if let Some(url) = url {
            task.url = url;
        }
        if let Some(selector) = selector {
            task.selector = selector;
        }
        if let Some(method) = method {
            task.method = parse_method(&method)?;
        }
        workspace.controller.add(task).await
    };
    let id = added.context("Failed to add task")?;
    if interval > 0 {
        workspace.controller.configure_timer(id, interval).await?;
        workspace.controller.shutdown();
    }
    let index = workspace.controller.registry().len().await - 1;
    workspace.save(session).await?;

    println!("Added task at index {} to session {}", index, session);
    Ok(())
}

/// Print the tasks of a session
pub async fn task_list(workspace: &Workspace, session: &str, filters: &[String]) -> Result<()> {
    let filter = TaskFilter::parse(filters).context("Invalid filter")?;
    workspace.open(session, false).await?;

    let ids = workspace.controller.registry().ids().await;
    let tasks = workspace.controller.list_matching(&filter).await;

    if tasks.is_empty() {
        if filter.is_empty() {
            println!("Session {} has no tasks", session);
        } else {
            println!("No task of session {} matches the filter", session);
        }
    } else {
        // Indices stay the positions in the session so they can be passed to other commands
        print_tasks(tasks.iter().filter_map(|task| {
            ids.iter().position(|id| *id == task.id).map(|index| (index, task))
        }));
        print_stats(&RunStats::from_tasks(&tasks));
    }
    println!("{}", workspace.controller.counters().await);
    Ok(())
}

/// Change url, selector, method or interval of a task
pub async fn task_edit(
    workspace: &Workspace,
    session: &str,
    index: usize,
    url: Option<String>,
    selector: Option<String>,
    method: Option<String>,
    interval: Option<u64>,
) -> Result<()> {
    workspace.open(session, false).await?;
    let id = workspace.task_id(index).await?;
    let method = method.as_deref().map(parse_method).transpose()?;

    workspace
        .controller
        .update(id, |fields| {
            if let Some(url) = url {
                fields.url = url;
            }
            if let Some(selector) = selector {
                fields.selector = selector;
            }
            if let Some(method) = method {
                fields.method = method;
            }
        })
        .await
        .context(format!("Failed to edit task {}", index))?;

    if let Some(seconds) = interval {
        workspace.controller.configure_timer(id, seconds).await?;
        // Only `watch` keeps timers running
        workspace.controller.shutdown();
    }

    workspace.save(session).await?;
    println!("Updated task {} of session {}", index, session);
    Ok(())
}

/// Parameter changes requested on the command line
#[derive(Debug, Default)]
pub struct ParamsUpdate {
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Option<String>,
    pub timeout: Option<u32>,
}

/// Change the request parameters of a task
pub async fn task_params(workspace: &Workspace, session: &str, index: usize, update: ParamsUpdate) -> Result<()> {
    workspace.open(session, false).await?;
    let id = workspace.task_id(index).await?;

    // Validate everything before changing anything
    let mut params = workspace.controller.get(id).await?.params;
    if let Some(proxy) = &update.proxy {
        params.proxy = Some(proxy.trim().to_string()).filter(|p| !p.is_empty());
    }
    if let Some(user_agent) = &update.user_agent {
        params.user_agent = Some(user_agent.trim().to_string()).filter(|ua| !ua.is_empty());
    }
    if let Some(timeout) = update.timeout {
        params.timeout_seconds = timeout;
    }
    params.validate()?;

    if let Some(raw) = &update.headers {
        workspace
            .controller
            .set_headers_json(id, raw)
            .await
            .context("Headers were rejected; parameters left unchanged")?;
    }

    let task = workspace
        .controller
        .update(id, |fields| {
            fields.params.proxy = params.proxy;
            fields.params.user_agent = params.user_agent;
            fields.params.timeout_seconds = params.timeout_seconds;
        })
        .await?;

    workspace.save(session).await?;
    println!("{}", task.params.summary());
    Ok(())
}

/// Remove tasks by index
pub async fn task_remove(workspace: &Workspace, session: &str, indices: &[usize]) -> Result<()> {
    workspace.open(session, false).await?;

    let mut ids = Vec::with_capacity(indices.len());
    for index in indices {
        ids.push(workspace.task_id(*index).await?);
    }
    let removed = workspace.controller.remove_many(&ids).await;
    workspace.save(session).await?;

    println!("Removed {} tasks from session {}", removed.len(), session);
    Ok(())
}

/// Drop the stored results of one task
pub async fn task_clear_results(workspace: &Workspace, session: &str, index: usize) -> Result<()> {
    workspace.open(session, false).await?;
    let id = workspace.task_id(index).await?;
    workspace.controller.clear_results(id).await?;
    workspace.save(session).await?;

    println!("Cleared results of task {} in session {}", index, session);
    Ok(())
}

/// Run the selected tasks (all when `indices` is empty) and save the session
pub async fn run(workspace: &Workspace, session: &str, indices: &[usize]) -> Result<()> {
    workspace.open(session, false).await?;

    let ids = if indices.is_empty() {
        workspace.controller.registry().ids().await
    } else {
        let mut ids = Vec::with_capacity(indices.len());
        for index in indices {
            ids.push(workspace.task_id(*index).await?);
        }
        ids
    };

    if ids.is_empty() {
        warn!("Session {} has no tasks to run", session);
        return Ok(());
    }

    let handles = workspace.controller.run_many(&ids).await;
    for handle in handles {
        let id = handle.id;
        if handle.wait().await.is_none() {
            warn!("Task {} produced no outcome", id);
        }
    }

    let path = workspace.save(session).await?;
    let tasks = workspace.controller.list().await;
    print_tasks(tasks.iter().enumerate());
    println!("{}", workspace.controller.counters().await);
    println!("Session saved to {}", path.display());
    Ok(())
}

/// Serve the timers of a session until Ctrl-C, then save it
pub async fn watch(workspace: &Workspace, session: &str) -> Result<()> {
    workspace.open(session, true).await?;

    let armed = workspace.controller.scheduler().active_timers();
    if armed == 0 {
        warn!("No task of session {} has an interval; nothing to watch", session);
        return Ok(());
    }

    info!("Watching {} timers, press Ctrl-C to stop", armed);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping timers");
    workspace.controller.shutdown();
    while workspace.controller.counters().await.running > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let path = workspace.save(session).await?;
    println!("Session saved to {}", path.display());
    Ok(())
}

/// Create an empty session
pub async fn session_new(workspace: &Workspace, name: Option<String>) -> Result<()> {
    let name = name.unwrap_or_else(generate_session_name);
    if workspace.sessions.find(&name)?.is_some() {
        bail!("Session '{}' already exists", name);
    }

    let path = workspace.sessions.save(&name, &[]).context(format!("Failed to save session: {}", name))?;
    println!("Created session {} at {}", name, path.display());
    Ok(())
}

/// Print every saved session
pub fn session_list(workspace: &Workspace) -> Result<()> {
    let sessions = workspace.sessions.list_sessions()?;
    if sessions.is_empty() {
        println!("No saved sessions");
        return Ok(());
    }

    println!("{:<32} {:<20} {:<6}", "NAME", "SAVED", "TASKS");
    for session in sessions {
        println!("{:<32} {:<20} {:<6}", session.session_name, session.datetime, session.task_count);
    }
    Ok(())
}

/// Print a saved session without touching the controller
pub fn session_show(workspace: &Workspace, name: &str) -> Result<()> {
    let Some(session) = workspace.sessions.find(name)? else {
        bail!("Session '{}' not found", name);
    };
    let tasks = workspace.sessions.prepare(&session)?;

    println!("Session: {}", session.session_name);
    println!("Saved: {}", session.datetime);
    for (index, (task, saved)) in tasks.iter().zip(&session.tasks).enumerate() {
        println!(
            "{:<3} [{}] {} {} ({}) every {}s, {} results, cookies: {}",
            index,
            task.status,
            task.url,
            task.selector,
            task.method,
            task.interval_seconds,
            task.results.len(),
            if saved.cookies_file.is_empty() { "-" } else { saved.cookies_file.as_str() },
        );
    }

    print_stats(&RunStats::from_history(tasks.iter().flat_map(|t| t.history.iter())));
    Ok(())
}

/// Delete a session file
pub fn session_delete(workspace: &Workspace, name: &str) -> Result<()> {
    let path = workspace.sessions.path_for(name)?;
    if workspace.sessions.delete_session(&path)? {
        println!("Deleted session {} (result files kept)", name);
    } else {
        println!("Session {} does not exist", name);
    }
    Ok(())
}

/// Export the results of one task
pub async fn export(
    workspace: &Workspace,
    session: &str,
    index: usize,
    format: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let format: ExportFormat = format.parse().map_err(anyhow::Error::msg)?;
    workspace.open(session, false).await?;
    let id = workspace.task_id(index).await?;
    let task = workspace.controller.get(id).await?;

    if task.status == TaskStatus::Running || task.results.is_empty() {
        warn!("Task {} has no results to export", index);
    }

    let output_path = match output {
        Some(path) => path,
        None => workspace
            .sessions
            .results_dir_for(session)?
            .join(format!("task_{}_{}.{}", index, format, format.extension())),
    };

    let entries = [ExportEntry {
        url: &task.url,
        selector: &task.selector,
        records: &task.results,
    }];
    export::export_to_file(&output_path, &entries, format)
        .context(format!("Failed to export to {}", output_path.display()))?;

    println!("Exported {} records to {}", task.results.len(), output_path.display());
    Ok(())
}

/// Print the effective configuration
pub fn show_config(workspace: &Workspace, path: Option<&Path>) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(AppConfig::default_path);
    println!("# {}", path.display());
    print!("{}", workspace.config.to_yaml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::engine::executor::{ScrapeOutcome, ScrapeRequest};
    use crate::engine::task::ScrapeRecord;
    use crate::error::ExecutionError;

    struct EchoExecutor;

    #[async_trait]
    impl ScrapeExecutor for EchoExecutor {
        async fn execute(&self, request: &ScrapeRequest) -> std::result::Result<ScrapeOutcome, ExecutionError> {
            Ok(ScrapeOutcome {
                records: vec![ScrapeRecord {
                    title: Some(request.selector.clone()),
                    link: Some(request.url.clone()),
                    description: None,
                }],
                cookies: Vec::new(),
            })
        }
    }

    fn config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.sessions_dir = root.join("sessions");
        config.storage.results_dir = root.join("results");
        config.storage.cookies_dir = root.join("cookies");
        config
    }

    // Each command runs against a fresh workspace, like separate invocations
    fn workspace(root: &Path) -> Workspace {
        Workspace::with_executor(config(root), Arc::new(EchoExecutor))
    }

    #[tokio::test]
    async fn test_add_run_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        task_add(&workspace(root), "daily", None, None, None, 0).await.unwrap();
        task_add(
            &workspace(root),
            "daily",
            Some("https://example.org".to_string()),
            Some("//h1".to_string()),
            Some("xpath".to_string()),
            60,
        )
        .await
        .unwrap();

        run(&workspace(root), "daily", &[1]).await.unwrap();

        let ws = workspace(root);
        ws.open("daily", false).await.unwrap();
        let tasks = ws.controller.list().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[1].status, TaskStatus::Success);
        assert_eq!(tasks[1].method, ScrapeMethod::XPath);
        assert_eq!(tasks[1].interval_seconds, 60);
        assert_eq!(ws.controller.scheduler().active_timers(), 0);

        let output = root.join("export.csv");
        export(&workspace(root), "daily", 1, "csv", Some(output.clone())).await.unwrap();
        let csv = std::fs::read_to_string(output).unwrap();
        assert!(csv.contains("https://example.org,//h1,https://example.org,"));
    }

    #[tokio::test]
    async fn test_list_with_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        task_add(&workspace(root), "s", None, None, None, 0).await.unwrap();

        let filters = vec!["url=example.com".to_string(), "selector=a".to_string()];
        task_list(&workspace(root), "s", &filters).await.unwrap();
        task_list(&workspace(root), "s", &[]).await.unwrap();
        assert!(task_list(&workspace(root), "s", &["colour=red".to_string()]).await.is_err());
        assert!(task_list(&workspace(root), "s", &["url".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_headers_leave_params_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        task_add(&workspace(root), "s", None, None, None, 0).await.unwrap();

        let update = ParamsUpdate {
            timeout: Some(30),
            headers: Some("not valid JSON".to_string()),
            ..ParamsUpdate::default()
        };
        assert!(task_params(&workspace(root), "s", 0, update).await.is_err());

        let update = ParamsUpdate {
            user_agent: Some("Bot/2.0".to_string()),
            headers: Some(r#"{"Accept": "text/html"}"#.to_string()),
            ..ParamsUpdate::default()
        };
        task_params(&workspace(root), "s", 0, update).await.unwrap();

        let ws = workspace(root);
        ws.open("s", false).await.unwrap();
        let params = ws.controller.list().await[0].params.clone();
        assert_eq!(params.timeout_seconds, 10);
        assert_eq!(params.user_agent.as_deref(), Some("Bot/2.0"));
        assert_eq!(params.headers.len(), 1);
    }

    #[tokio::test]
    async fn test_edit_remove_and_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for _ in 0..3 {
            task_add(&workspace(root), "s", None, None, None, 0).await.unwrap();
        }

        task_edit(&workspace(root), "s", 2, None, Some("p".to_string()), None, Some(15))
            .await
            .unwrap();
        assert!(task_edit(&workspace(root), "s", 5, None, None, None, None).await.is_err());
        task_remove(&workspace(root), "s", &[0, 1]).await.unwrap();

        let ws = workspace(root);
        ws.open("s", false).await.unwrap();
        let tasks = ws.controller.list().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].selector, "p");
        assert_eq!(tasks[0].interval_seconds, 15);

        session_new(&ws, Some("empty".to_string())).await.unwrap();
        assert!(session_new(&ws, Some("empty".to_string())).await.is_err());
        assert_eq!(ws.sessions.list_sessions().unwrap().len(), 2);

        session_delete(&ws, "empty").unwrap();
        assert_eq!(ws.sessions.list_sessions().unwrap().len(), 1);
        assert!(session_show(&ws, "s").is_ok());
        assert!(session_show(&ws, "missing").is_err());
    }
}
