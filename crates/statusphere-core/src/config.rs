use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    CURSOR_WRITE_INTERVAL, DEFAULT_CURSOR_STREAM, HANDLE_RESOLVER_URL, JETSTREAM_URL,
    PLC_DIRECTORY_URL, RESOLVER_TIMEOUT, STATUS_COLLECTION,
};
use crate::runtime::BackoffConfig;

/// Core configuration, loadable from a camelCase JSON file and overridable
/// from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    /// SQLite file for the cache; relative paths are resolved under `data_dir`.
    /// `:memory:` keeps everything in process.
    pub db_path: String,
    pub jetstream_url: String,
    pub wanted_collections: Vec<String>,
    pub cursor_stream: String,
    pub cursor_write_interval_secs: u64,
    pub resolver_timeout_ms: u64,
    pub handle_resolver_url: String,
    pub plc_directory_url: String,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            db_path: "statusphere.db".to_string(),
            jetstream_url: JETSTREAM_URL.to_string(),
            wanted_collections: vec![STATUS_COLLECTION.to_string()],
            cursor_stream: DEFAULT_CURSOR_STREAM.to_string(),
            cursor_write_interval_secs: CURSOR_WRITE_INTERVAL.as_secs(),
            resolver_timeout_ms: RESOLVER_TIMEOUT.as_millis() as u64,
            handle_resolver_url: HANDLE_RESOLVER_URL.to_string(),
            plc_directory_url: PLC_DIRECTORY_URL.to_string(),
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }

    /// Load config from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CoreConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("STATUSPHERE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = var("JETSTREAM_URL") {
            self.jetstream_url = url;
        }
        if let Some(url) = var("ATPROTO_SERVER") {
            self.handle_resolver_url = url;
        }
        if let Some(url) = var("PLC_DIRECTORY_URL") {
            self.plc_directory_url = url;
        }
    }

    /// Location of the SQLite cache, or `None` for an in-memory database.
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.db_path == ":memory:" {
            return None;
        }
        let path = Path::new(&self.db_path);
        if path.is_absolute() {
            Some(path.to_path_buf())
        } else {
            Some(self.data_dir.join(path))
        }
    }

    pub fn cursor_write_interval(&self) -> Duration {
        Duration::from_secs(self.cursor_write_interval_secs)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            ..BackoffConfig::default()
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join("statusphere"))
            .unwrap_or_else(|| PathBuf::from("statusphere_data"));
        Self::new(data_dir)
    }
}
