//! Configuration loading, validation, and management for the ADCP agent
//! service.
//!
//! Loads configuration from `~/.adcp/config.toml` with environment variable
//! overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.adcp/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backing store configuration
    #[serde(default)]
    pub stores: StoresConfig,

    /// Config cache policy
    #[serde(default)]
    pub cache: CacheConfig,

    /// In-process session context bounds
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Durable conversation memory
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    /// "sqlite", "memory", or "none"
    #[serde(default = "default_kv_backend")]
    pub kv_backend: String,

    /// SQLite database path for the key/value store
    #[serde(default = "default_kv_path")]
    pub kv_path: String,

    /// "directory", "memory", or "none"
    #[serde(default = "default_object_backend")]
    pub object_backend: String,

    /// Root directory that holds one sub-directory per bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_root: Option<String>,

    /// Bucket holding the config library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket
    #[serde(default = "default_object_prefix")]
    pub object_prefix: String,

    /// Local library directory (last fallback)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_library_dir: Option<String>,

    /// Per-call timeout for every backing store
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_kv_backend() -> String {
    "sqlite".into()
}
fn default_kv_path() -> String {
    AppConfig::config_dir()
        .join("agent_config.db")
        .to_string_lossy()
        .into_owned()
}
fn default_object_backend() -> String {
    "none".into()
}
fn default_object_prefix() -> String {
    "configs".into()
}
fn default_store_timeout_ms() -> u64 {
    3000
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            kv_backend: default_kv_backend(),
            kv_path: default_kv_path(),
            object_backend: default_object_backend(),
            object_root: None,
            bucket: None,
            object_prefix: default_object_prefix(),
            local_library_dir: None,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoresConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Expire negative entries after this many seconds. Unset keeps them
    /// until the next refresh or invalidation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_ttl_secs: Option<u64>,

    /// Concurrent per-agent reloads during a refresh
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,
}

fn default_refresh_concurrency() -> usize {
    8
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            negative_ttl_secs: None,
            refresh_concurrency: default_refresh_concurrency(),
        }
    }
}

impl CacheConfig {
    pub fn negative_ttl(&self) -> Option<Duration> {
        self.negative_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Steady-state bound on an agent's saved history
    #[serde(default = "default_max_live_turns")]
    pub max_live_turns: usize,

    /// Bound used when saving history across an agent switch
    #[serde(default = "default_max_switch_turns")]
    pub max_switch_turns: usize,

    /// Sessions kept before the least recently used one is evicted
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_live_turns() -> usize {
    30
}
fn default_max_switch_turns() -> usize {
    8
}
fn default_max_sessions() -> usize {
    1024
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_live_turns: default_max_live_turns(),
            max_switch_turns: default_max_switch_turns(),
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "sqlite", "memory", or "none"
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// SQLite database path for durable memory
    #[serde(default = "default_memory_path")]
    pub path: String,

    /// Memory resource id; empty or placeholder ids leave managers unbound
    #[serde(default)]
    pub memory_id: String,

    /// Turns fetched when resuming a session
    #[serde(default = "default_max_turns_to_retrieve")]
    pub max_turns_to_retrieve: usize,

    /// Messages longer than this are truncated before persisting
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    #[serde(default = "default_memory_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_true")]
    pub auto_persist: bool,

    /// Share of older turns folded into a summary on context overflow
    #[serde(default = "default_summary_ratio")]
    pub summary_ratio: f32,

    /// Most recent turns never summarized
    #[serde(default = "default_preserve_recent")]
    pub preserve_recent: usize,

    /// Turns kept by the sliding-window reducer
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_memory_backend() -> String {
    "sqlite".into()
}
fn default_memory_path() -> String {
    AppConfig::config_dir()
        .join("conversation_memory.db")
        .to_string_lossy()
        .into_owned()
}
fn default_max_turns_to_retrieve() -> usize {
    10
}
fn default_max_message_chars() -> usize {
    9000
}
fn default_memory_timeout_ms() -> u64 {
    5000
}
fn default_summary_ratio() -> f32 {
    0.3
}
fn default_preserve_recent() -> usize {
    5
}
fn default_window_size() -> usize {
    10
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            path: default_memory_path(),
            memory_id: String::new(),
            max_turns_to_retrieve: default_max_turns_to_retrieve(),
            max_message_chars: default_max_message_chars(),
            timeout_ms: default_memory_timeout_ms(),
            auto_persist: true,
            summary_ratio: default_summary_ratio(),
            preserve_recent: default_preserve_recent(),
            window_size: default_window_size(),
        }
    }
}

impl MemoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.adcp/config.toml),
    /// then apply environment overrides:
    /// - `AGENT_CONFIG_TABLE`: key/value store path
    /// - `STACK_PREFIX` + `UNIQUE_ID`: bucket `{prefix}-data-{id}` if none configured
    /// - `ADCP_MEMORY_ID`: durable memory id
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(table) = lookup("AGENT_CONFIG_TABLE").filter(|t| !t.is_empty()) {
            self.stores.kv_path = table;
        }

        if self.stores.bucket.is_none() {
            let prefix = lookup("STACK_PREFIX").unwrap_or_default();
            let unique_id = lookup("UNIQUE_ID").unwrap_or_default();
            if !prefix.is_empty() && !unique_id.is_empty() {
                self.stores.bucket = Some(format!("{prefix}-data-{unique_id}"));
            }
        }

        if let Some(memory_id) = lookup("ADCP_MEMORY_ID") {
            self.memory.memory_id = memory_id;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".adcp")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sessions = &self.sessions;
        if sessions.max_live_turns == 0 || sessions.max_switch_turns == 0 {
            return Err(ConfigError::ValidationError(
                "session turn bounds must be > 0".into(),
            ));
        }
        if sessions.max_switch_turns > sessions.max_live_turns {
            return Err(ConfigError::ValidationError(
                "max_switch_turns must not exceed max_live_turns".into(),
            ));
        }
        if sessions.max_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "max_sessions must be > 0".into(),
            ));
        }
        if !(self.memory.summary_ratio > 0.0 && self.memory.summary_ratio < 1.0) {
            return Err(ConfigError::ValidationError(
                "summary_ratio must be between 0.0 and 1.0 (exclusive)".into(),
            ));
        }
        if self.memory.max_message_chars == 0 || self.memory.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_chars and window_size must be > 0".into(),
            ));
        }
        if self.stores.timeout_ms == 0 || self.memory.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be > 0".into(),
            ));
        }
        if self.cache.refresh_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "refresh_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
