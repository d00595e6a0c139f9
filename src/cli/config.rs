use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::engine::task::{NewTask, ScrapeMethod, DEFAULT_TIMEOUT_SECONDS};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageSettings,
    pub defaults: TaskDefaults,
    pub http: HttpSettings,
}

/// Where sessions, results and cookie jars live
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub sessions_dir: PathBuf,
    pub results_dir: PathBuf,
    pub cookies_dir: PathBuf,
}

/// Values of a newly added task
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TaskDefaults {
    pub url: String,
    pub selector: String,
    pub method: ScrapeMethod,
    pub timeout_seconds: u32,
}

/// Settings shared by every HTTP request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpSettings {
    /// Used when a task does not set its own user agent
    pub user_agent: String,
    pub connect_timeout_seconds: u64,
    pub max_redirects: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("sessions"),
            results_dir: PathBuf::from("results"),
            cookies_dir: PathBuf::from("cookies"),
        }
    }
}

impl Default for TaskDefaults {
    fn default() -> Self {
        let template = NewTask::template();
        Self {
            url: template.url,
            selector: template.selector,
            method: template.method,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
            connect_timeout_seconds: 10,
            max_redirects: 10,
        }
    }
}

impl TaskDefaults {
    /// Task added when no url or selector is given
    pub fn new_task(&self) -> NewTask {
        let mut task = NewTask::new(self.url.clone(), self.selector.clone(), self.method);
        task.params.timeout_seconds = self.timeout_seconds;
        task
    }
}

impl AppConfig {
    /// Get the path to the config directory
    pub fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "smart-scraper", "smart-scraper") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.yaml")
    }

    /// Load the default configuration, writing it out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load `path` when given, the default configuration otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        fs::write(path, self.to_yaml()?)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}
