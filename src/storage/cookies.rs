use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;
use tracing::debug;
use url::Url;

use crate::engine::executor::StoredCookie;
use crate::error::{Result, ScrapeError};
use crate::storage::atomic::write_atomic;

/// Cookie jars keyed by URL
#[cfg_attr(test, mockall::automock)]
pub trait CookieStore: Send + Sync {
    /// Deterministic jar location for `url`
    fn path_for(&self, url: &str) -> PathBuf;

    fn exists(&self, url: &str) -> bool;

    /// Merge `cookies` into the jar of `url`, overwriting cookies with the same name, domain and path
    fn save(&self, url: &str, cookies: &[StoredCookie]) -> Result<()>;

    fn load(&self, url: &str) -> Result<Vec<StoredCookie>>;
}

/// Stores one JSON jar per host in a directory.
///
/// Saves to one jar are serialized: within the process by a per-jar mutex,
/// across processes by an exclusive lock on `<jar>.lock`.
pub struct FileCookieStore {
    dir: PathBuf,
    jar_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileCookieStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: PathBuf::from(dir.as_ref()),
            jar_locks: Mutex::new(HashMap::new()),
        }
    }

    /// File name for the jar of `url`: the host (and explicit port) with unsafe characters replaced
    pub fn file_name(url: &str) -> String {
        let key = match Url::parse(url) {
            Ok(parsed) => match (parsed.host_str(), parsed.port()) {
                (Some(host), Some(port)) => format!("{}_{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => url.to_string(),
            },
            Err(_) => url.to_string(),
        };

        let sanitized: String = key
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();

        format!("{}.json", sanitized.trim_matches('.'))
    }

    pub fn read_jar(path: &Path) -> Result<Vec<StoredCookie>> {
        let contents = fs::read_to_string(path).map_err(|e| ScrapeError::io(path, e))?;
        serde_json::from_str(&contents).map_err(|e| ScrapeError::serialization(path, e))
    }

    fn jar_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.jar_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

impl CookieStore for FileCookieStore {
    fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(Self::file_name(url))
    }

    fn exists(&self, url: &str) -> bool {
        self.path_for(url).is_file()
    }

    fn save(&self, url: &str, cookies: &[StoredCookie]) -> Result<()> {
        let path = self.path_for(url);
        fs::create_dir_all(&self.dir).map_err(|e| ScrapeError::io(&self.dir, e))?;

        let jar_lock = self.jar_lock(&path);
        let _guard = jar_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Released when `lock_file` is dropped
        let lock_path = path.with_extension("json.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ScrapeError::io(&lock_path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| ScrapeError::io(&lock_path, e))?;

        let mut jar = if path.is_file() { Self::read_jar(&path)? } else { Vec::new() };

        for cookie in cookies {
            match jar.iter_mut().find(|c| {
                c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
            }) {
                Some(existing) => existing.value = cookie.value.clone(),
                None => jar.push(cookie.clone()),
            }
        }

        let contents = serde_json::to_string_pretty(&jar)
            .map_err(|e| ScrapeError::serialization(&path, e))?;
        write_atomic(&path, contents.as_bytes())?;

        debug!("Saved {} cookies to {}", jar.len(), path.display());
        Ok(())
    }

    fn load(&self, url: &str) -> Result<Vec<StoredCookie>> {
        let path = self.path_for(url);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        Self::read_jar(&path)
    }
}
