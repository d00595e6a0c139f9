use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, ScrapeError};

/// Wall-clock format used for `last_run` and session timestamps
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Run history entries kept per task
pub const HISTORY_LIMIT: usize = 50;

pub const MIN_TIMEOUT_SECONDS: u32 = 1;
pub const MAX_TIMEOUT_SECONDS: u32 = 60;
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 10;

/// Stable identifier of a task within one registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Selector language of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScrapeMethod {
    #[default]
    #[serde(rename = "CSS")]
    Css,
    #[serde(rename = "XPATH")]
    XPath,
}

impl ScrapeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Css => "CSS",
            Self::XPath => "XPATH",
        }
    }
}

impl fmt::Display for ScrapeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CSS" => Ok(Self::Css),
            "XPATH" => Ok(Self::XPath),
            other => Err(format!("unknown scrape method: {}", other)),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Request configuration of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Proxy URL (http, https or socks5)
    #[serde(default, deserialize_with = "empty_as_none")]
    pub proxy: Option<String>,

    /// User agent override
    #[serde(default, deserialize_with = "empty_as_none")]
    pub user_agent: Option<String>,

    /// Extra request headers
    #[serde(default, deserialize_with = "lenient_headers")]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds (1..=60)
    #[serde(rename = "timeout", default = "default_timeout")]
    pub timeout_seconds: u32,
}

fn default_timeout() -> u32 {
    DEFAULT_TIMEOUT_SECONDS
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Header values that are not strings are kept as their JSON text
fn lenient_headers<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(HashMap::new()),
        Some(serde_json::Value::Object(object)) => Ok(stringify_headers(&object)),
        Some(other) => Err(serde::de::Error::custom(format!(
            "headers must be a JSON object, got {}",
            other
        ))),
    }
}

fn stringify_headers(object: &serde_json::Map<String, serde_json::Value>) -> HashMap<String, String> {
    object
        .iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect()
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent: None,
            headers: HashMap::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl TaskParams {
    /// Parse a user supplied JSON object of header names to values.
    ///
    /// Non-string values are rendered with their JSON text, anything other
    /// than an object is rejected.
    pub fn parse_headers(raw: &str) -> Result<HashMap<String, String>> {
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ScrapeError::ConfigParse(format!("headers are not valid JSON: {}", e)))?;

        let object = value.as_object().ok_or_else(|| {
            ScrapeError::ConfigParse("headers must be a JSON object".to_string())
        })?;

        Ok(stringify_headers(object))
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds) {
            return Err(ScrapeError::InvalidTask(format!(
                "timeout must be between {} and {} seconds, got {}",
                MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS, self.timeout_seconds
            )));
        }
        Ok(())
    }

    /// One-line description for tooltips and listings
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(proxy) = &self.proxy {
            parts.push(format!("Proxy: {}", proxy));
        }
        if let Some(ua) = &self.user_agent {
            let short: String = ua.chars().take(40).collect();
            if short.len() < ua.len() {
                parts.push(format!("UA: {}...", short));
            } else {
                parts.push(format!("UA: {}", short));
            }
        }
        parts.push(format!("Timeout: {}s", self.timeout_seconds));
        if !self.headers.is_empty() {
            parts.push(format!("Headers: {} items", self.headers.len()));
        }
        parts.join(" | ")
    }
}

/// One extracted item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScrapeRecord {
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
}

/// Outcome of one finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub finished_at: NaiveDateTime,
    pub status: TaskStatus,
    pub message: String,
    pub record_count: usize,
    pub duration_ms: u64,
}

/// One row of work
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub selector: String,
    pub method: ScrapeMethod,
    pub status: TaskStatus,
    pub params: TaskParams,

    /// 0 disables the recurring schedule
    pub interval_seconds: u64,

    pub last_run: Option<NaiveDateTime>,

    /// Records of the last successful run
    pub results: Vec<ScrapeRecord>,

    /// Human-readable message of the last run
    pub message: Option<String>,

    /// Most recent runs, oldest first
    pub history: Vec<RunRecord>,
}

impl Task {
    pub fn fields(&self) -> TaskFields {
        TaskFields {
            url: self.url.clone(),
            selector: self.selector.clone(),
            method: self.method,
            params: self.params.clone(),
        }
    }

    pub(crate) fn push_history(&mut self, record: RunRecord) {
        self.history.push(record);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

/// Fields a caller may edit through `TaskRegistry::update`
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFields {
    pub url: String,
    pub selector: String,
    pub method: ScrapeMethod,
    pub params: TaskParams,
}

impl TaskFields {
    /// Whether url, selector or method differ from `other`
    pub fn identity_differs(&self, other: &TaskFields) -> bool {
        self.url != other.url || self.selector != other.selector || self.method != other.method
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ScrapeError::InvalidTask("url must not be empty".to_string()));
        }
        if self.selector.trim().is_empty() {
            return Err(ScrapeError::InvalidTask("selector must not be empty".to_string()));
        }
        self.params.validate()
    }
}

/// Everything needed to create a task, either from the template or a restored session
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub url: String,
    pub selector: String,
    pub method: ScrapeMethod,
    pub status: TaskStatus,
    pub params: TaskParams,
    pub interval_seconds: u64,
    pub last_run: Option<NaiveDateTime>,
    pub results: Vec<ScrapeRecord>,
    pub message: Option<String>,
    pub history: Vec<RunRecord>,
}

impl NewTask {
    pub fn new(url: impl Into<String>, selector: impl Into<String>, method: ScrapeMethod) -> Self {
        Self {
            url: url.into(),
            selector: selector.into(),
            method,
            status: TaskStatus::Pending,
            params: TaskParams::default(),
            interval_seconds: 0,
            last_run: None,
            results: Vec::new(),
            message: None,
            history: Vec::new(),
        }
    }

    /// The default row added by "add task"
    pub fn template() -> Self {
        Self::new("https://example.com", "a", ScrapeMethod::Css)
    }

    pub fn with_interval(mut self, seconds: u64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    pub(crate) fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            url: self.url,
            selector: self.selector,
            method: self.method,
            status: self.status,
            params: self.params,
            interval_seconds: self.interval_seconds,
            last_run: self.last_run,
            results: self.results,
            message: self.message,
            history: self.history,
        }
    }

    pub(crate) fn fields(&self) -> TaskFields {
        TaskFields {
            url: self.url.clone(),
            selector: self.selector.clone(),
            method: self.method,
            params: self.params.clone(),
        }
    }
}
