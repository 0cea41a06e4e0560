// Local crates
use crate::{parser::parser::LineFormat, watcher::pattern::PatternMatcher};

// External crates
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Prefix of environment variables overriding file settings, e.g.
/// `VES_TAIL__GENERAL__POLL_INTERVAL_MS=250`.
pub const ENV_PREFIX: &str = "VES_TAIL";
const ENV_SEPARATOR: &str = "__";

pub const DEFAULT_LOG_PATTERN: &str = "logstash-*.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl Config {
    /// Load, overlay environment overrides and validate the configuration file.
    #[instrument(
        name = "config_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            "Loading tail agent configuration file"
        );

        let settings = config::Config::builder()
            .add_source(config::File::from(path_ref).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config file at {:?}", path_ref))?;

        let cfg: Config = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse configuration from {:?}", path_ref))?;

        cfg.validate()
            .with_context(|| format!("Invalid configuration in {:?}", path_ref))?;

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            projects = cfg.projects.len(),
            "Tail agent configuration loaded successfully"
        );
        Ok(cfg)
    }

    /// Parse and validate TOML text without environment overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(raw).context("Failed to parse TOML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Normalised TOML rendering, defaults filled in.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.projects.is_empty() {
            return Err(ConfigError::NoProjects);
        }

        let mut names = HashSet::new();
        for project in &self.projects {
            project.validate()?;
            if !names.insert(project.name.as_str()) {
                return Err(ConfigError::DuplicateProject(project.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no [[projects]] configured")]
    NoProjects,

    #[error("a project has an empty name")]
    EmptyProjectName,

    #[error("project {0:?} is configured more than once")]
    DuplicateProject(String),

    #[error("project {0:?} has no directories")]
    NoDirectories(String),

    #[error("project {0:?} has an empty log_pattern")]
    EmptyPattern(String),

    #[error("project {project:?} has an invalid log_pattern: {source}")]
    InvalidPattern {
        project: String,
        #[source]
        source: regex::Error,
    },

    #[error("project {0:?}: a cached position store cannot wrap another cached store")]
    NestedCache(String),

    #[error("general.poll_interval_ms must be greater than zero")]
    ZeroPollInterval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl GeneralConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files, in addition to stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub tokio_console: bool,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
            tokio_console: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

/// Where tailed entries are delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SinkConfig {
    #[default]
    Stdout,
    Tracing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub directories: Vec<PathBuf>,
    #[serde(default = "default_log_pattern")]
    pub log_pattern: String,
    #[serde(default)]
    pub line_format: LineFormat,
    /// Wake the monitor on filesystem events instead of waiting a full tick.
    #[serde(default)]
    pub watch_events: bool,
    /// Restart from offset zero when a file shrinks below the tracked offset.
    #[serde(default = "default_true")]
    pub reset_on_truncate: bool,
    /// Rescan for a newer file every N seconds even while the current one
    /// is readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_check_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_storage: Option<PositionStorageConfig>,
}

impl ProjectConfig {
    /// Position tracking needs a storage section with a non-empty path.
    pub fn tracking_enabled(&self) -> bool {
        self.position_storage
            .as_ref()
            .is_some_and(|storage| !storage.path.trim().is_empty())
    }

    pub fn rotation_check_interval(&self) -> Option<Duration> {
        self.rotation_check_interval_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyProjectName);
        }
        if self.directories.is_empty() {
            return Err(ConfigError::NoDirectories(self.name.clone()));
        }
        if self.log_pattern.is_empty() {
            return Err(ConfigError::EmptyPattern(self.name.clone()));
        }
        PatternMatcher::new(&self.log_pattern).map_err(|source| ConfigError::InvalidPattern {
            project: self.name.clone(),
            source,
        })?;

        if let Some(storage) = &self.position_storage {
            if storage.kind == StorageKind::Cached && storage.backing == Some(StorageKind::Cached) {
                return Err(ConfigError::NestedCache(self.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionStorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// Directory for file stores, database file for `sqlite`.
    pub path: String,
    /// Flush interval of the `cached` store.
    #[serde(default = "default_save_interval_seconds")]
    pub save_interval_seconds: u64,
    /// Store wrapped by `cached`, `async-file` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<StorageKind>,
    #[serde(default = "default_max_position_age_hours")]
    pub max_position_age_hours: u64,
}

impl PositionStorageConfig {
    pub fn max_position_age(&self) -> chrono::Duration {
        i64::try_from(self.max_position_age_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    File,
    AsyncFile,
    Cached,
    Sqlite,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_log_pattern() -> String {
    DEFAULT_LOG_PATTERN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_save_interval_seconds() -> u64 {
    5
}

fn default_max_position_age_hours() -> u64 {
    crate::position::models::DEFAULT_MAX_POSITION_AGE_HOURS
}
