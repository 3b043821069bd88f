//! procd configuration loading and parsing
//!
//! These are the supervisor's own settings. What to run lives in the
//! process descriptor, see [`crate::descriptor`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/procd/config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcdConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub restart: RestartSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `compact` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Where default `<name>-out.log` / `<name>-error.log` files go
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_dir: default_log_dir(),
            status_file: default_status_file(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartSettings {
    #[serde(default = "default_max_restarts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_restart_window")]
    pub restart_window_seconds: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_restart_attempts: default_max_restarts(),
            restart_window_seconds: default_restart_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_memory_interval")]
    pub memory_check_interval_ms: u64,
    #[serde(default = "default_watch_debounce")]
    pub watch_debounce_ms: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            memory_check_interval_ms: default_memory_interval(),
            watch_debounce_ms: default_watch_debounce(),
        }
    }
}

impl ProcdConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.poll_interval_ms.max(10))
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart.restart_window_seconds)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.memory_check_interval_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.monitoring.watch_debounce_ms)
    }
}

// Default value functions
fn default_log_level() -> String { "info".into() }
fn default_log_format() -> String { "compact".into() }
fn default_log_dir() -> PathBuf { PathBuf::from("./logs") }
fn default_status_file() -> PathBuf { std::env::temp_dir().join("procd-status.json") }
fn default_poll_interval() -> u64 { 1000 }
fn default_max_restarts() -> u32 { 15 }
fn default_restart_window() -> u64 { 60 }
fn default_memory_interval() -> u64 { 5000 }
fn default_watch_debounce() -> u64 { 500 }

/// Load configuration, falling back to defaults when the file is missing
pub fn load_config_from(config_path: &Path) -> Result<ProcdConfig> {
    if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;
        let config: ProcdConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", config_path.display()))?;
        Ok(config)
    } else {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
        Ok(ProcdConfig::default())
    }
}
