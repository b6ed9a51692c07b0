//! Retention engine configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, RetentionError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Engine database: job definitions, execution logs, job locks.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Records database backing the retention targets.
    #[serde(default = "default_records_db_path")]
    pub records_db_path: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_db_path() -> String { "~/.retention/retention.db".into() }
fn default_records_db_path() -> String { "~/.retention/records.db".into() }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            records_db_path: default_records_db_path(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RetentionConfig {
    /// Load config from the default path (~/.retention/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RetentionError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RetentionError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RetentionError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.engine.page_size == 0 {
            return Err(RetentionError::Config("engine.page_size must be at least 1".into()));
        }
        if self.scheduler.check_interval_secs == 0 {
            return Err(RetentionError::Config(
                "scheduler.check_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Engine database path with `~` expanded.
    pub fn db_path(&self) -> PathBuf {
        expand_path(&self.db_path)
    }

    /// Records database path with `~` expanded.
    pub fn records_db_path(&self) -> PathBuf {
        expand_path(&self.records_db_path)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the retention home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".retention")
    }
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Job runner tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Candidate records fetched per page while streaming a target.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// A job lock older than this is considered abandoned and taken over.
    #[serde(default = "default_lock_stale_after_secs")]
    pub lock_stale_after_secs: u64,
    /// Record ids listed in an execution log's details summary.
    #[serde(default = "default_details_id_limit")]
    pub details_id_limit: usize,
}

fn default_page_size() -> usize { 500 }
fn default_lock_stale_after_secs() -> u64 { 3600 }
fn default_details_id_limit() -> usize { 50 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            lock_stale_after_secs: default_lock_stale_after_secs(),
            details_id_limit: default_details_id_limit(),
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Identity recorded as `initiated_by` for scheduled runs.
    #[serde(default = "default_initiated_by")]
    pub initiated_by: String,
}

fn default_check_interval_secs() -> u64 { 60 }
fn default_initiated_by() -> String { "Scheduler".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            initiated_by: default_initiated_by(),
        }
    }
}
