//! Tradeflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TradeflowError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeflowConfig {
    /// Orchestrator name; also keys the persisted snapshot.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_name() -> String { "tradeflow".into() }

impl Default for TradeflowConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            scheduler: SchedulerConfig::default(),
            state: StateConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TradeflowConfig {
    /// Load config from the default path (~/.tradeflow/config.toml).
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
            .map_err(|e| TradeflowError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TradeflowError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TradeflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Tradeflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tradeflow")
    }
}

/// What the scheduler does with an attempt when every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the attempt and report it.
    Drop,
    /// Park the attempt in the bounded work queue until a slot frees.
    #[default]
    Queue,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Timeout applied to tasks that do not set their own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Broadcast buffer per subscriber before it starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrent() -> usize { 5 }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_queue_capacity() -> usize { 64 }
fn default_event_capacity() -> usize { 256 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            default_timeout_ms: default_timeout_ms(),
            overflow: OverflowPolicy::default(),
            queue_capacity: default_queue_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Bound used by the engine; a configured 0 still allows one task.
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_tasks.max(1)
    }
}

/// Where snapshots are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

/// State persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: StateBackend,
    #[serde(default = "default_state_dir")]
    pub dir: String,
}

fn bool_true() -> bool { true }
fn default_state_dir() -> String { "~/.tradeflow/state".into() }

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: StateBackend::default(),
            dir: default_state_dir(),
        }
    }
}

impl StateConfig {
    /// State directory with `~` expanded.
    pub fn resolved_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.dir).to_string())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
