//! Configuration for the agentmux session core: a TOML file plus
//! environment overrides. Invalid overrides are logged and fall back to the
//! default rather than aborting startup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_AGENTMUX_CONFIG: &str = "AGENTMUX_CONFIG";
pub const ENV_SYNC_INTERVAL_SECS: &str = "AGENTMUX_SYNC_INTERVAL_SECS";
pub const ENV_CRITICAL_LANE_CAPACITY: &str = "AGENTMUX_CRITICAL_LANE_CAPACITY";
pub const ENV_NORMAL_LANE_CAPACITY: &str = "AGENTMUX_NORMAL_LANE_CAPACITY";
pub const ENV_GC_SWEEP_SECS: &str = "AGENTMUX_GC_SWEEP_SECS";
pub const ENV_TMUX_BINARY: &str = "AGENTMUX_TMUX_BIN";

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 7;
const DEFAULT_GC_SWEEP_SECS: u64 = 3_600;
const DEFAULT_SESSION_RETENTION_SECS: u64 = 86_400;
const DEFAULT_DEBOUNCE_MS: u64 = 300;
const DEFAULT_SELF_SAVE_WINDOW_MS: u64 = 2_000;
const DEFAULT_CRITICAL_LANE_CAPACITY: usize = 256;
const DEFAULT_NORMAL_LANE_CAPACITY: usize = 1_024;
const DEFAULT_TMUX_BINARY: &str = "tmux";
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_gc_sweep_secs")]
    pub gc_sweep_secs: u64,
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_self_save_window_ms")]
    pub self_save_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            gc_sweep_secs: DEFAULT_GC_SWEEP_SECS,
            session_retention_secs: DEFAULT_SESSION_RETENTION_SECS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            self_save_window_ms: DEFAULT_SELF_SAVE_WINDOW_MS,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn gc_sweep(&self) -> Duration {
        Duration::from_secs(self.gc_sweep_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn self_save_window(&self) -> Duration {
        Duration::from_millis(self.self_save_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpLaneConfig {
    #[serde(default = "default_critical_lane_capacity")]
    pub critical_lane_capacity: usize,
    #[serde(default = "default_normal_lane_capacity")]
    pub normal_lane_capacity: usize,
}

impl Default for PumpLaneConfig {
    fn default() -> Self {
        Self {
            critical_lane_capacity: DEFAULT_CRITICAL_LANE_CAPACITY,
            normal_lane_capacity: DEFAULT_NORMAL_LANE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmuxConfig {
    #[serde(default = "default_tmux_binary")]
    pub binary: String,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_TMUX_BINARY.to_owned(),
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
        }
    }
}

impl TmuxConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentmuxConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub pump: PumpLaneConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,
}

impl AgentmuxConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(default_agentmux_data_dir)
    }

    /// Applies `AGENTMUX_*` environment overrides. An unparsable value is
    /// logged and the configured/default value kept.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_SYNC_INTERVAL_SECS) {
            match parse_positive(&raw) {
                Some(value) => self.sync.interval_secs = value,
                None => tracing::warn!(
                    value = raw.as_str(),
                    default = self.sync.interval_secs,
                    "invalid {ENV_SYNC_INTERVAL_SECS} override, using default"
                ),
            }
        }
        if let Some(raw) = lookup(ENV_GC_SWEEP_SECS) {
            match parse_positive(&raw) {
                Some(value) => self.sync.gc_sweep_secs = value,
                None => tracing::warn!(
                    value = raw.as_str(),
                    default = self.sync.gc_sweep_secs,
                    "invalid {ENV_GC_SWEEP_SECS} override, using default"
                ),
            }
        }
        if let Some(raw) = lookup(ENV_CRITICAL_LANE_CAPACITY) {
            match parse_positive(&raw) {
                Some(value) => self.pump.critical_lane_capacity = value as usize,
                None => tracing::warn!(
                    value = raw.as_str(),
                    default = self.pump.critical_lane_capacity,
                    "invalid {ENV_CRITICAL_LANE_CAPACITY} override, using default"
                ),
            }
        }
        if let Some(raw) = lookup(ENV_NORMAL_LANE_CAPACITY) {
            match parse_positive(&raw) {
                Some(value) => self.pump.normal_lane_capacity = value as usize,
                None => tracing::warn!(
                    value = raw.as_str(),
                    default = self.pump.normal_lane_capacity,
                    "invalid {ENV_NORMAL_LANE_CAPACITY} override, using default"
                ),
            }
        }
        if let Some(raw) = lookup(ENV_TMUX_BINARY) {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                tracing::warn!("empty {ENV_TMUX_BINARY} override, using default");
            } else {
                self.tmux.binary = trimmed.to_owned();
            }
        }
    }
}

/// Loads the config file named by `AGENTMUX_CONFIG` (or the default path),
/// then applies environment overrides. A missing file yields defaults.
pub fn load_from_env() -> Result<AgentmuxConfig, ConfigError> {
    let path = config_path_from_env();
    let mut config = match std::fs::read_to_string(&path) {
        Ok(raw) => toml::from_str(&raw).map_err(|error| {
            ConfigError::configuration(format!(
                "failed to parse config file '{}': {error}",
                path.display()
            ))
        })?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => AgentmuxConfig::default(),
        Err(error) => {
            return Err(ConfigError::configuration(format!(
                "failed to read config file '{}': {error}",
                path.display()
            )))
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

fn config_path_from_env() -> PathBuf {
    match std::env::var(ENV_AGENTMUX_CONFIG) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_agentmux_data_dir().join("agentmux.toml"),
    }
}

fn default_agentmux_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("XDG_DATA_HOME") {
        if !path.trim().is_empty() {
            return PathBuf::from(path).join("agentmux");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home).join(".local/share/agentmux");
        }
    }
    std::env::temp_dir().join("agentmux")
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|value| *value > 0)
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_gc_sweep_secs() -> u64 {
    DEFAULT_GC_SWEEP_SECS
}

fn default_session_retention_secs() -> u64 {
    DEFAULT_SESSION_RETENTION_SECS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_self_save_window_ms() -> u64 {
    DEFAULT_SELF_SAVE_WINDOW_MS
}

fn default_critical_lane_capacity() -> usize {
    DEFAULT_CRITICAL_LANE_CAPACITY
}

fn default_normal_lane_capacity() -> usize {
    DEFAULT_NORMAL_LANE_CAPACITY
}

fn default_tmux_binary() -> String {
    DEFAULT_TMUX_BINARY.to_owned()
}

fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}
