// ⚙️ Configuration - TOML file plus AYUSH_BRIDGE_* environment overrides
//
// Precedence: defaults < config file < environment.

use crate::deadline::Deadline;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file path for the server binary
pub const ENV_CONFIG: &str = "AYUSH_BRIDGE_CONFIG";
pub const ENV_DB: &str = "AYUSH_BRIDGE_DB";
pub const ENV_MAX_PAGE_SIZE: &str = "AYUSH_BRIDGE_MAX_PAGE_SIZE";
pub const ENV_DEADLINE_MS: &str = "AYUSH_BRIDGE_DEADLINE_MS";
pub const ENV_SYNC_INTERVAL: &str = "AYUSH_BRIDGE_ICD11_SYNC_INTERVAL_SECS";
pub const ENV_BIND: &str = "AYUSH_BRIDGE_BIND";
pub const ENV_LOG: &str = "AYUSH_BRIDGE_LOG";
pub const ENV_ICD11_FEED: &str = "AYUSH_BRIDGE_ICD11_FEED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// SQLite database file
    pub database: PathBuf,
    /// Upper bound for search page sizes
    pub max_page_size: usize,
    /// Default per-operation deadline
    pub deadline_ms: u64,
    /// How often the scheduled ICD-11 sync runs
    pub icd11_sync_interval_secs: u64,
    /// JSON file the external ICD-11 fetcher drops refresh batches into
    pub icd11_feed: Option<PathBuf>,
    /// HTTP listen address (server binary)
    pub bind: String,
    /// Default tracing filter when RUST_LOG is unset
    pub log: String,
    /// Shadow cache entries kept in memory (server binary); 0 disables it
    pub cache_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            database: PathBuf::from("ayush-bridge.db"),
            max_page_size: 100,
            deadline_ms: 5_000,
            icd11_sync_interval_secs: 24 * 60 * 60,
            icd11_feed: None,
            bind: "0.0.0.0:8080".to_string(),
            log: "info".to_string(),
            cache_capacity: 10_000,
        }
    }
}

impl BridgeConfig {
    /// Defaults, then the optional TOML file, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply overrides from `lookup` (the environment in production)
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(db) = lookup(ENV_DB) {
            self.database = PathBuf::from(db);
        }
        if let Some(value) = lookup(ENV_MAX_PAGE_SIZE) {
            self.max_page_size = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer", ENV_MAX_PAGE_SIZE))?;
        }
        if let Some(value) = lookup(ENV_DEADLINE_MS) {
            self.deadline_ms = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be milliseconds", ENV_DEADLINE_MS))?;
        }
        if let Some(value) = lookup(ENV_SYNC_INTERVAL) {
            self.icd11_sync_interval_secs = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be seconds", ENV_SYNC_INTERVAL))?;
        }
        if let Some(feed) = lookup(ENV_ICD11_FEED) {
            self.icd11_feed = Some(PathBuf::from(feed));
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind = bind;
        }
        if let Some(log) = lookup(ENV_LOG) {
            self.log = log;
        }

        anyhow::ensure!(self.max_page_size > 0, "max_page_size must be at least 1");
        anyhow::ensure!(self.icd11_sync_interval_secs > 0, "icd11_sync_interval_secs must be at least 1");
        Ok(self)
    }

    /// Fresh deadline for one operation
    pub fn deadline(&self) -> Deadline {
        Deadline::after(Duration::from_millis(self.deadline_ms))
    }

    pub fn icd11_sync_interval(&self) -> Duration {
        Duration::from_secs(self.icd11_sync_interval_secs)
    }
}
