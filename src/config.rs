//! Configuration management for aedificator.
//!
//! This module defines the structure of the `aedificator.toml` configuration
//! file (project folders, per-project container settings and session tuning)
//! and resolves it into the `Settings` the runner and sessions consume.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::output::DEFAULT_BUFFER_LINES;

pub const CONFIG_FILE: &str = "aedificator.toml";
const DEFAULT_SHELL: &str = "/bin/bash";

/// Top-level configuration structure corresponding to `aedificator.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for logs and diagnostics (default: the platform data dir).
    pub data_dir: Option<PathBuf>,
    /// Shell used to run command text (default: `/bin/bash`).
    pub shell: Option<String>,
    pub paths: ProjectPaths,
    pub session: SessionConfig,
    pub logs: LogConfig,
    /// Container settings keyed by project key (`superleme`, `sl_phoenix`, ...).
    pub containers: HashMap<String, ContainerConfig>,
}

/// Folders of the three projects the console knows about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProjectPaths {
    pub webserver: Option<PathBuf>,
    pub app: Option<PathBuf>,
    pub extension: Option<PathBuf>,
}

/// Tuning for parallel sessions; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub refresh_ms: Option<u64>,
    pub linger_ms: Option<u64>,
    pub terminate_grace_ms: Option<u64>,
    pub reader_join_ms: Option<u64>,
    pub pane_lines: Option<usize>,
    pub buffer_lines: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Remove ANSI color codes from log files.
    pub strip_ansi: Option<bool>,
}

/// Container settings for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Whether commands for this project run inside its compose service.
    pub use_container: bool,
    /// Relational database image version, e.g. `17-alpine`.
    pub postgres_version: Option<String>,
    pub base_image: Option<String>,
    pub version: Option<String>,
    /// Language runtime versions, e.g. `erlang = "28"`.
    pub languages: BTreeMap<String, String>,
}

impl ContainerConfig {
    /// `base_image:version`, or the bare base image when no version is set.
    pub fn image(&self) -> Option<String> {
        let base = non_blank(self.base_image.as_deref())?;
        Some(match non_blank(self.version.as_deref()) {
            Some(version) => format!("{}:{}", base, version),
            None => base.to_string(),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Container configurations keyed by project key.
pub type ContainerConfigs = HashMap<String, ContainerConfig>;

/// Fixed durations and sizes used by parallel sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Live view redraw cadence.
    pub refresh: Duration,
    /// How long the final state stays on screen once everything exited.
    pub linger: Duration,
    /// Wait after SIGTERM before escalating to a kill.
    pub terminate_grace: Duration,
    /// Bounded wait for each reader thread at session end.
    pub reader_join: Duration,
    /// Lines rendered per pane.
    pub pane_lines: usize,
    /// Lines retained per operation.
    pub buffer_lines: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh: Duration::from_millis(250),
            linger: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(5),
            reader_join: Duration::from_secs(1),
            pane_lines: 30,
            buffer_lines: DEFAULT_BUFFER_LINES,
        }
    }
}

impl SessionSettings {
    fn from_config(config: &SessionConfig) -> Self {
        let defaults = Self::default();
        let millis = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        Self {
            refresh: millis(config.refresh_ms, defaults.refresh).max(Duration::from_millis(10)),
            linger: millis(config.linger_ms, defaults.linger),
            terminate_grace: millis(config.terminate_grace_ms, defaults.terminate_grace),
            reader_join: millis(config.reader_join_ms, defaults.reader_join),
            pane_lines: config.pane_lines.unwrap_or(defaults.pane_lines).max(1),
            buffer_lines: config.buffer_lines.unwrap_or(defaults.buffer_lines).max(1),
        }
    }
}

/// Resolved runtime settings shared by the runner, sessions and supervisor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub shell: String,
    pub strip_ansi_logs: bool,
    pub session: SessionSettings,
}

impl Settings {
    /// Resolves settings from a config, with `data_dir` overriding the file.
    pub fn resolve(config: &Config, data_dir: Option<PathBuf>) -> Self {
        let data_dir = data_dir
            .or_else(|| config.data_dir.clone())
            .unwrap_or_else(default_data_dir);
        Self::with_data_dir(config, data_dir)
    }

    fn with_data_dir(config: &Config, data_dir: PathBuf) -> Self {
        Self {
            logs_dir: data_dir.join("logs"),
            data_dir,
            shell: config.shell.clone().unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            strip_ansi_logs: config.logs.strip_ansi.unwrap_or(false),
            session: SessionSettings::from_config(&config.session),
        }
    }

    /// Settings rooted at an arbitrary directory, used by tests.
    #[cfg(test)]
    pub fn for_tests(data_dir: &Path) -> Self {
        let mut settings = Self::with_data_dir(&Config::default(), data_dir.to_path_buf());
        settings.session.linger = Duration::ZERO;
        settings.session.refresh = Duration::from_millis(20);
        settings.session.terminate_grace = Duration::from_secs(2);
        settings
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("aedificator"))
        .unwrap_or_else(|| PathBuf::from(".aedificator"))
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads the explicit config path, else the first existing default location.
///
/// No config file at all yields the defaults.
pub fn find_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match default_config_paths().into_iter().find(|path| path.exists()) {
        Some(path) => load_config(&path),
        None => Ok(Config::default()),
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("aedificator").join(CONFIG_FILE));
    }
    paths
}
