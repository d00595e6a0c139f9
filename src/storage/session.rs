use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::controller::TaskController;
use crate::engine::task::{
    NewTask, RunRecord, ScrapeMethod, ScrapeRecord, Task, TaskId, TaskParams, TaskStatus,
    TIMESTAMP_FORMAT,
};
use crate::error::{Result, ScrapeError};
use crate::storage::atomic::write_atomic;
use crate::storage::cookies::CookieStore;

/// A saved task as it appears in the session file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTask {
    pub url: String,
    pub selector: String,
    #[serde(default)]
    pub method: ScrapeMethod,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub params: TaskParams,

    /// File name of the cookie jar derived from the url
    #[serde(default)]
    pub cookies_file: String,

    /// Written only when the task had results at save time
    #[serde(default)]
    pub results_path: Option<String>,

    /// Run history as JSON lines, empty when there is none
    #[serde(default)]
    pub log_path: String,

    #[serde(default)]
    pub timer_interval: u64,

    /// `YYYY-MM-DD HH:MM:SS`, empty when the task never ran
    #[serde(default)]
    pub last_run: String,
}

/// Named snapshot of every task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_name: String,
    #[serde(default)]
    pub datetime: String,
    #[serde(default)]
    pub tasks: Vec<SessionTask>,
}

impl Session {
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.datetime, TIMESTAMP_FORMAT).ok()
    }
}

/// What `list_sessions` reports for one session file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub session_name: String,
    pub datetime: String,
    pub task_count: usize,
}

// Reads the index without materializing the tasks
#[derive(Deserialize)]
struct SessionHeader {
    #[serde(default)]
    session_name: Option<String>,
    #[serde(default)]
    datetime: String,
    #[serde(default)]
    tasks: Vec<IgnoredAny>,
}

/// Default name for a new session, e.g. `session_2024-05-01_14-30`
pub fn generate_session_name() -> String {
    format!("session_{}", Local::now().format("%Y-%m-%d_%H-%M"))
}

pub fn validate_session_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(ScrapeError::InvalidSessionName(name.to_string()));
    }
    Ok(())
}

/// Session files in one directory, result payloads in another
pub struct SessionStore {
    sessions_dir: PathBuf,
    results_dir: PathBuf,
    cookies: Arc<dyn CookieStore>,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        sessions_dir: P,
        results_dir: Q,
        cookies: Arc<dyn CookieStore>,
    ) -> Self {
        Self {
            sessions_dir: PathBuf::from(sessions_dir.as_ref()),
            results_dir: PathBuf::from(results_dir.as_ref()),
            cookies,
        }
    }

    /// Path of the session file for `name`
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_session_name(name)?;
        Ok(self.sessions_dir.join(format!("{}.json", name)))
    }

    /// Directory holding the result and history files of `name`
    pub fn results_dir_for(&self, name: &str) -> Result<PathBuf> {
        validate_session_name(name)?;
        Ok(self.results_dir.join(name))
    }

    /// Write `tasks` under `name`, replacing any session with the same name
    pub fn save(&self, name: &str, tasks: &[Task]) -> Result<PathBuf> {
        let session_path = self.path_for(name)?;
        let result_dir = self.results_dir_for(name)?;
        fs::create_dir_all(&result_dir).map_err(|e| ScrapeError::io(&result_dir, e))?;

        let mut saved = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let results_path = if task.results.is_empty() {
                None
            } else {
                let path = result_dir.join(format!("task_{}.json", index));
                write_json(&path, &task.results)?;
                Some(path.to_string_lossy().into_owned())
            };

            let log_path = if task.history.is_empty() {
                String::new()
            } else {
                let path = result_dir.join(format!("task_{}.log", index));
                write_history(&path, &task.history)?;
                path.to_string_lossy().into_owned()
            };

            let cookies_file = self
                .cookies
                .path_for(&task.url)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();

            saved.push(SessionTask {
                url: task.url.clone(),
                selector: task.selector.clone(),
                method: task.method,
                status: task.status.to_string(),
                params: task.params.clone(),
                cookies_file,
                results_path,
                log_path,
                timer_interval: task.interval_seconds,
                last_run: task
                    .last_run
                    .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
                    .unwrap_or_default(),
            });
        }

        let session = Session {
            session_name: name.to_string(),
            datetime: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            tasks: saved,
        };

        fs::create_dir_all(&self.sessions_dir).map_err(|e| ScrapeError::io(&self.sessions_dir, e))?;
        write_json(&session_path, &session)?;

        info!("Saved session '{}' with {} tasks to {}", name, tasks.len(), session_path.display());
        Ok(session_path)
    }

    /// Parse a session file. Touches nothing but the file.
    pub fn load(&self, path: &Path) -> Result<Session> {
        let contents = fs::read_to_string(path).map_err(|e| ScrapeError::io(path, e))?;
        let session = serde_json::from_str(&contents).map_err(|e| ScrapeError::serialization(path, e))?;
        debug!("Loaded session file {}", path.display());
        Ok(session)
    }

    /// Load the session called `name`, or `None` when it was never saved
    pub fn find(&self, name: &str) -> Result<Option<Session>> {
        let path = self.path_for(name)?;
        if path.is_file() {
            self.load(&path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Turn a parsed session into tasks ready for the registry, reading result and history files.
    ///
    /// Fails without side effects when a referenced file is malformed.
    pub fn prepare(&self, session: &Session) -> Result<Vec<NewTask>> {
        session.tasks.iter().map(|saved| self.prepare_task(saved)).collect()
    }

    fn prepare_task(&self, saved: &SessionTask) -> Result<NewTask> {
        let status = if saved.status.trim().is_empty() {
            TaskStatus::Pending
        } else {
            saved.status.parse::<TaskStatus>().unwrap_or_else(|e| {
                warn!("{}; restoring {} as Pending", e, saved.url);
                TaskStatus::Pending
            })
        };

        let last_run = if saved.last_run.trim().is_empty() {
            None
        } else {
            match NaiveDateTime::parse_from_str(saved.last_run.trim(), TIMESTAMP_FORMAT) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!("Ignoring last run {:?} of {}: {}", saved.last_run, saved.url, e);
                    None
                }
            }
        };

        let results = match saved.results_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => read_results(Path::new(path))?,
            None => Vec::new(),
        };

        let history = if saved.log_path.is_empty() {
            Vec::new()
        } else {
            read_history(Path::new(&saved.log_path))?
        };

        let mut task = NewTask::new(saved.url.clone(), saved.selector.clone(), saved.method)
            .with_params(saved.params.clone())
            .with_interval(saved.timer_interval);
        task.status = status;
        task.last_run = last_run;
        task.results = results;
        task.message = history.last().map(|run| run.message.clone());
        task.history = history;
        Ok(task)
    }

    /// Replace the controller's tasks with the content of `session` and re-arm its timers
    pub async fn restore(&self, session: &Session, controller: &TaskController) -> Result<Vec<TaskId>> {
        let tasks = self.prepare(session)?;
        let ids = controller.restore(tasks).await?;
        info!("Restored session '{}'", session.session_name);
        Ok(ids)
    }

    /// Every saved session, newest file name first. Result files are never opened.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        if !self.sessions_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir).map_err(|e| ScrapeError::io(&self.sessions_dir, e))? {
            let path = entry.map_err(|e| ScrapeError::io(&self.sessions_dir, e))?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        paths.reverse();

        let mut sessions = Vec::with_capacity(paths.len());
        for path in paths {
            let header = File::open(&path)
                .map_err(|e| ScrapeError::io(&path, e))
                .and_then(|file| {
                    serde_json::from_reader::<_, SessionHeader>(BufReader::new(file))
                        .map_err(|e| ScrapeError::serialization(&path, e))
                });

            match header {
                Ok(header) => sessions.push(SessionSummary {
                    session_name: header.session_name.unwrap_or_else(|| {
                        path.file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default()
                    }),
                    datetime: header.datetime,
                    task_count: header.tasks.len(),
                    path,
                }),
                Err(e) => warn!("Skipping unreadable session file: {}", e),
            }
        }
        Ok(sessions)
    }

    /// Remove a session file. Its result files are left on disk.
    pub fn delete_session(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path).map_err(|e| ScrapeError::io(path, e))?;
        info!("Deleted session file {}", path.display());
        Ok(true)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value).map_err(|e| ScrapeError::serialization(path, e))?;
    write_atomic(path, contents.as_bytes())
}

fn write_history(path: &Path, history: &[RunRecord]) -> Result<()> {
    let mut contents = String::new();
    for run in history {
        let line = serde_json::to_string(run).map_err(|e| ScrapeError::serialization(path, e))?;
        contents.push_str(&line);
        contents.push('\n');
    }
    write_atomic(path, contents.as_bytes())
}

fn read_results(path: &Path) -> Result<Vec<ScrapeRecord>> {
    if !path.is_file() {
        warn!("Result file {} is missing; results left empty", path.display());
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).map_err(|e| ScrapeError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|e| ScrapeError::serialization(path, e))
}

fn read_history(path: &Path) -> Result<Vec<RunRecord>> {
    if !path.is_file() {
        debug!("History file {} is missing", path.display());
        return Ok(Vec::new());
    }

    let file = File::open(path).map_err(|e| ScrapeError::io(path, e))?;
    let mut history = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ScrapeError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunRecord>(&line) {
            Ok(run) => history.push(run),
            Err(e) => warn!("Skipping malformed history line in {}: {}", path.display(), e),
        }
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::engine::executor::{ScrapeExecutor, ScrapeOutcome, ScrapeRequest};
    use crate::engine::view::NullView;
    use crate::error::ExecutionError;
    use crate::storage::cookies::FileCookieStore;

    struct OneLinkExecutor;

    #[async_trait]
    impl ScrapeExecutor for OneLinkExecutor {
        async fn execute(&self, request: &ScrapeRequest) -> std::result::Result<ScrapeOutcome, ExecutionError> {
            Ok(ScrapeOutcome {
                records: vec![ScrapeRecord {
                    title: Some("More information...".to_string()),
                    link: Some(format!("{}/more", request.url)),
                    description: None,
                }],
                cookies: Vec::new(),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: SessionStore,
        controller: TaskController,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cookies: Arc<dyn CookieStore> = Arc::new(FileCookieStore::new(root.join("cookies")));
        let store = SessionStore::new(root.join("sessions"), root.join("results"), cookies.clone());
        let controller = TaskController::new(Arc::new(OneLinkExecutor), cookies, Arc::new(NullView));
        Fixture {
            _dir: dir,
            root,
            store,
            controller,
        }
    }

    #[test]
    fn test_session_names() {
        assert!(generate_session_name().starts_with("session_"));
        assert!(validate_session_name(&generate_session_name()).is_ok());
        for bad in ["", "  ", "../escape", "a/b", "a\\b"] {
            assert!(matches!(
                validate_session_name(bad),
                Err(ScrapeError::InvalidSessionName(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_save_load_restore_round_trip() {
        let fx = fixture();
        let mut params = TaskParams::default();
        params.user_agent = Some("Bot/1.0".to_string());
        params.timeout_seconds = 20;

        let ran = fx
            .controller
            .add(NewTask::new("https://example.com", "a", ScrapeMethod::Css).with_params(params.clone()))
            .await
            .unwrap();
        fx.controller
            .add(NewTask::new("https://example.org", "//h1", ScrapeMethod::XPath).with_interval(30))
            .await
            .unwrap();
        fx.controller.run(ran).await.unwrap().wait().await.unwrap();

        let path = fx.store.save("s1", &fx.controller.snapshot().await).unwrap();
        assert_eq!(path, fx.root.join("sessions").join("s1.json"));

        let session = fx.store.load(&path).unwrap();
        assert_eq!(session.session_name, "s1");
        assert!(session.created_at().is_some());
        assert_eq!(session.tasks[0].cookies_file, "example.com.json");
        assert!(session.tasks[0].results_path.is_some());
        assert!(session.tasks[1].results_path.is_none());
        assert_eq!(session.tasks[1].last_run, "");

        let other = fixture();
        let ids = other.store.restore(&session, &other.controller).await.unwrap();
        assert_eq!(ids.len(), 2);

        let restored = other.controller.list().await;
        assert_eq!(restored[0].url, "https://example.com");
        assert_eq!(restored[0].params, params);
        assert_eq!(restored[0].status, TaskStatus::Success);
        assert_eq!(restored[0].results.len(), 1);
        assert_eq!(restored[0].history.len(), 1);
        assert!(restored[0].last_run.is_some());
        assert_eq!(restored[1].method, ScrapeMethod::XPath);
        assert_eq!(restored[1].interval_seconds, 30);
        assert!(other.controller.scheduler().is_armed(ids[1]));
        assert!(!other.controller.scheduler().is_armed(ids[0]));
    }

    #[tokio::test]
    async fn test_running_status_is_not_restored() {
        let fx = fixture();
        let session = Session {
            session_name: "s".to_string(),
            datetime: "2024-05-01 10:00:00".to_string(),
            tasks: vec![SessionTask {
                url: "https://example.com".to_string(),
                selector: "a".to_string(),
                method: ScrapeMethod::Css,
                status: "Running".to_string(),
                params: TaskParams::default(),
                cookies_file: String::new(),
                results_path: None,
                log_path: String::new(),
                timer_interval: 0,
                last_run: "2024-05-01 09:59:00".to_string(),
            }],
        };

        fx.store.restore(&session, &fx.controller).await.unwrap();
        let task = &fx.controller.list().await[0];
        assert_eq!(task.status, TaskStatus::Stopped);
        assert_eq!(
            task.last_run.map(|t| t.format(TIMESTAMP_FORMAT).to_string()).as_deref(),
            Some("2024-05-01 09:59:00")
        );
    }

    #[tokio::test]
    async fn test_resave_overwrites_by_content() {
        let fx = fixture();
        fx.controller
            .add(NewTask::new("https://first.example", "a", ScrapeMethod::Css))
            .await
            .unwrap();
        let path = fx.store.save("same", &fx.controller.snapshot().await).unwrap();

        fx.controller.clear().await;
        fx.controller
            .add(NewTask::new("https://second.example", "p", ScrapeMethod::Css))
            .await
            .unwrap();
        fx.controller
            .add(NewTask::new("https://third.example", "p", ScrapeMethod::Css))
            .await
            .unwrap();
        let again = fx.store.save("same", &fx.controller.snapshot().await).unwrap();

        assert_eq!(path, again);
        let session = fx.store.load(&path).unwrap();
        let urls: Vec<_> = session.tasks.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(urls, ["https://second.example", "https://third.example"]);
        assert_eq!(fx.store.list_sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_session_keeps_result_files() {
        let fx = fixture();
        let id = fx
            .controller
            .add(NewTask::new("https://example.com", "a", ScrapeMethod::Css))
            .await
            .unwrap();
        let task = fx.controller.run(id).await.unwrap().wait().await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(!task.results.is_empty());
        assert!(task.last_run.is_some());

        let path = fx.store.save("s1", &fx.controller.snapshot().await).unwrap();
        let result_file = fx.root.join("results").join("s1").join("task_0.json");
        assert!(result_file.is_file());

        assert!(fx.store.delete_session(&path).unwrap());
        assert!(!path.exists());
        assert!(result_file.is_file());
        assert!(!fx.store.delete_session(&path).unwrap());
    }

    #[tokio::test]
    async fn test_malformed_result_file_leaves_registry_untouched() {
        let fx = fixture();
        fx.controller.add_template().await.unwrap();
        let before = fx.controller.list().await;

        let broken = fx.root.join("broken.json");
        fs::write(&broken, "[{not json").unwrap();
        let session = Session {
            session_name: "bad".to_string(),
            datetime: String::new(),
            tasks: vec![SessionTask {
                url: "https://example.org".to_string(),
                selector: "a".to_string(),
                method: ScrapeMethod::Css,
                status: "Success".to_string(),
                params: TaskParams::default(),
                cookies_file: String::new(),
                results_path: Some(broken.to_string_lossy().into_owned()),
                log_path: String::new(),
                timer_interval: 5,
                last_run: String::new(),
            }],
        };

        let result = fx.store.restore(&session, &fx.controller).await;
        assert!(matches!(result, Err(ScrapeError::Serialization { .. })));
        assert_eq!(fx.controller.list().await, before);
        assert_eq!(fx.controller.scheduler().active_timers(), 0);
    }

    #[test]
    fn test_load_rejects_malformed_session() {
        let fx_dir = tempfile::tempdir().unwrap();
        let path = fx_dir.path().join("broken.json");
        fs::write(&path, "{\"session_name\": 3").unwrap();

        let store = SessionStore::new(
            fx_dir.path(),
            fx_dir.path(),
            Arc::new(FileCookieStore::new(fx_dir.path())),
        );
        assert!(matches!(store.load(&path), Err(ScrapeError::Serialization { .. })));
        assert!(matches!(
            store.load(&fx_dir.path().join("missing.json")),
            Err(ScrapeError::Io { .. })
        ));
    }

    #[test]
    fn test_list_sessions_reads_headers_only() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        fs::create_dir_all(&sessions).unwrap();
        fs::write(
            sessions.join("a.json"),
            r#"{"session_name": "a", "datetime": "2024-01-01 00:00:00", "tasks": [{"url": "x"}, {"url": "y"}]}"#,
        )
        .unwrap();
        fs::write(
            sessions.join("b.json"),
            r#"{"session_name": "b", "datetime": "2024-02-01 00:00:00", "tasks": []}"#,
        )
        .unwrap();
        fs::write(sessions.join("c.json"), "garbage").unwrap();
        fs::write(sessions.join("notes.txt"), "ignored").unwrap();

        let store = SessionStore::new(
            &sessions,
            dir.path().join("results"),
            Arc::new(FileCookieStore::new(dir.path())),
        );
        let listed = store.list_sessions().unwrap();

        let names: Vec<_> = listed.iter().map(|s| s.session_name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(listed[1].task_count, 2);
        assert_eq!(listed[0].datetime, "2024-02-01 00:00:00");
    }
}
