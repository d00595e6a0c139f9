use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::task::{ScrapeMethod, ScrapeRecord, TaskParams};
use crate::error::ExecutionError;

/// Cookie captured from or replayed to a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Input of one executor call
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub url: String,
    pub selector: String,
    pub method: ScrapeMethod,
    pub params: TaskParams,

    /// Cookie file for `url`; may not exist yet
    pub cookie_ref: PathBuf,
}

/// Output of a successful executor call
#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    pub records: Vec<ScrapeRecord>,
    pub cookies: Vec<StoredCookie>,
}

/// Capability that fetches a page and extracts records from it
#[async_trait]
pub trait ScrapeExecutor: Send + Sync {
    async fn execute(&self, request: &ScrapeRequest) -> Result<ScrapeOutcome, ExecutionError>;
}
