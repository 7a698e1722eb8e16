#![forbid(unsafe_code)]

//! Configuration envelope for the Hauler orchestrator.
//!
//! Settings load from a TOML file with every field optional, then
//! `HAULER_*` environment variables override individual values. The
//! result is validated once at startup; worker loops only ever see a
//! checked [`Settings`] value.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const GIB: u64 = 1024 * 1024 * 1024;

/// Problems detected while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for the expected shape.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// An environment override carried an unparseable value.
    #[error("invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Rejected value.
        value: String,
    },
    /// A validated bound was violated.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Storage locations and disk guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory for per-task artifact directories.
    pub root: PathBuf,
    /// Low-space guard in GiB; admission requires free space above it.
    pub low_space_floor_gb: u64,
    /// Live free-space guard enforced by the executor while streaming.
    pub min_free_bytes: u64,
    /// SQLite database path; defaults to `hauler.db` under the root.
    pub database_path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/srv/storage"),
            low_space_floor_gb: 10,
            min_free_bytes: 5 * GIB,
            database_path: None,
        }
    }
}

impl StorageSettings {
    /// The low-space floor in bytes.
    #[must_use]
    pub const fn floor_bytes(&self) -> u64 {
        self.low_space_floor_gb * GIB
    }

    /// Effective database path.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.root.join("hauler.db"))
    }
}

/// Concurrency caps for dispatching file downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    /// Total files in flight across all tasks.
    pub global_queue_limit: u32,
    /// In-flight files per task.
    pub per_task_max_active: u32,
    /// Per-cycle start budget per task.
    pub per_task_max_queued: u32,
    /// Range-parallelism for large files.
    pub segments: u32,
    /// Concurrent provider unlock calls.
    pub unlock_concurrency: u32,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            global_queue_limit: 25,
            per_task_max_active: 3,
            per_task_max_queued: 9,
            segments: 4,
            unlock_concurrency: 4,
        }
    }
}

/// Loop intervals and timeouts, all in natural units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Resolver/dispatcher loop interval in seconds.
    pub worker_loop_secs: u64,
    /// Progress monitor interval in seconds.
    pub progress_monitor_secs: u64,
    /// Delay between provider status polls in seconds.
    pub resolve_poll_secs: u64,
    /// Maximum provider status polls before giving up.
    pub max_resolve_attempts: u32,
    /// Selection timeout in minutes.
    pub selection_timeout_minutes: u64,
    /// Live-feed heartbeat interval in seconds.
    pub heartbeat_secs: u64,
    /// Live-feed gentle snapshot refresh in seconds.
    pub refresh_secs: u64,
    /// Live-feed empty-files poll interval in milliseconds.
    pub empty_files_poll_ms: u64,
    /// Maximum aggressive empty-files polling window in seconds.
    pub max_empty_wait_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            worker_loop_secs: 2,
            progress_monitor_secs: 1,
            resolve_poll_secs: 5,
            max_resolve_attempts: 240,
            selection_timeout_minutes: 15,
            heartbeat_secs: 25,
            refresh_secs: 5,
            empty_files_poll_ms: 500,
            max_empty_wait_secs: 60,
        }
    }
}

impl TimingSettings {
    /// Resolver/dispatcher loop interval.
    #[must_use]
    pub const fn worker_loop_interval(&self) -> Duration {
        Duration::from_secs(self.worker_loop_secs)
    }

    /// Monitor loop interval.
    #[must_use]
    pub const fn progress_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.progress_monitor_secs)
    }

    /// Delay between provider polls.
    #[must_use]
    pub const fn resolve_poll_delay(&self) -> Duration {
        Duration::from_secs(self.resolve_poll_secs)
    }

    /// Selection timeout.
    #[must_use]
    pub const fn selection_timeout(&self) -> Duration {
        Duration::from_secs(self.selection_timeout_minutes * 60)
    }

    /// Feed heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Feed refresh interval.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    /// Feed empty-files poll interval.
    #[must_use]
    pub const fn empty_files_poll(&self) -> Duration {
        Duration::from_millis(self.empty_files_poll_ms)
    }

    /// Feed empty-files polling window.
    #[must_use]
    pub const fn max_empty_wait(&self) -> Duration {
        Duration::from_secs(self.max_empty_wait_secs)
    }
}

/// Retention knobs for the janitor sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Days a completed task directory is kept.
    pub retention_days: u64,
    /// Hours a stale partial (sidecar still present) is kept.
    pub partial_max_age_hours: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            retention_days: 7,
            partial_max_age_hours: 24,
        }
    }
}

/// Debrid provider endpoint and rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider API base URL.
    pub base_url: String,
    /// API key; required for real deployments.
    pub api_key: String,
    /// User agent / application identifier sent with every call.
    pub agent: String,
    /// Token bucket refill rate, requests per second.
    pub rate_per_sec: f64,
    /// Token bucket burst size.
    pub rate_burst: u32,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.alldebrid.com/v4.1".to_owned(),
            api_key: String::new(),
            agent: "hauler".to_owned(),
            rate_per_sec: 2.0,
            rate_burst: 4,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
        }
    }
}

impl ProviderSettings {
    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Download executor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Minimum size before a download is split into parallel ranges.
    pub segment_min_bytes: u64,
    /// Retries on transient download failure.
    pub dl_retries: u32,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            segment_min_bytes: 512 * 1024 * 1024,
            dl_retries: 2,
        }
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Storage locations and disk guards.
    pub storage: StorageSettings,
    /// Concurrency caps.
    pub concurrency: ConcurrencySettings,
    /// Loop intervals and timeouts.
    pub timing: TimingSettings,
    /// Janitor retention knobs.
    pub retention: RetentionSettings,
    /// Provider endpoint and rate limiting.
    pub provider: ProviderSettings,
    /// Executor thresholds.
    pub fetch: FetchSettings,
}

impl Settings {
    /// Load settings from an optional TOML file plus `HAULER_*`
    /// environment overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file is unreadable or
    /// malformed, an override fails to parse, or a bound is violated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_owned(),
                    source,
                })?
            }
            Some(path) => {
                tracing::info!(path = %path.display(), "config file not found; using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_path("HAULER_STORAGE_ROOT", &mut self.storage.root);
        override_num("HAULER_LOW_SPACE_FLOOR_GB", &mut self.storage.low_space_floor_gb)?;
        override_num("HAULER_MIN_FREE_BYTES", &mut self.storage.min_free_bytes)?;
        if let Ok(value) = env::var("HAULER_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(value));
        }
        override_num("HAULER_GLOBAL_QUEUE_LIMIT", &mut self.concurrency.global_queue_limit)?;
        override_num("HAULER_PER_TASK_MAX_ACTIVE", &mut self.concurrency.per_task_max_active)?;
        override_num("HAULER_PER_TASK_MAX_QUEUED", &mut self.concurrency.per_task_max_queued)?;
        override_num("HAULER_SEGMENTS", &mut self.concurrency.segments)?;
        override_num("HAULER_MAX_RESOLVE_ATTEMPTS", &mut self.timing.max_resolve_attempts)?;
        override_num("HAULER_RESOLVE_POLL_SECS", &mut self.timing.resolve_poll_secs)?;
        override_num(
            "HAULER_SELECTION_TIMEOUT_MINUTES",
            &mut self.timing.selection_timeout_minutes,
        )?;
        if let Ok(value) = env::var("HAULER_PROVIDER_BASE_URL") {
            self.provider.base_url = value;
        }
        if let Ok(value) = env::var("HAULER_PROVIDER_API_KEY") {
            self.provider.api_key = value;
        }
        if let Ok(value) = env::var("HAULER_PROVIDER_AGENT") {
            self.provider.agent = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.per_task_max_active == 0 {
            return Err(ConfigError::Invalid(
                "per_task_max_active must be at least 1".to_owned(),
            ));
        }
        if self.concurrency.global_queue_limit == 0 {
            return Err(ConfigError::Invalid(
                "global_queue_limit must be at least 1".to_owned(),
            ));
        }
        if self.concurrency.segments == 0 {
            return Err(ConfigError::Invalid("segments must be at least 1".to_owned()));
        }
        if self.timing.max_resolve_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_resolve_attempts must be at least 1".to_owned(),
            ));
        }
        if self.provider.rate_per_sec <= 0.0 {
            return Err(ConfigError::Invalid(
                "provider.rate_per_sec must be positive".to_owned(),
            ));
        }
        if self.provider.rate_burst == 0 {
            return Err(ConfigError::Invalid(
                "provider.rate_burst must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

fn override_path(name: &'static str, target: &mut PathBuf) {
    if let Ok(value) = env::var(name) {
        *target = PathBuf::from(value);
    }
}

fn override_num<T: std::str::FromStr>(
    name: &'static str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Ok(value) = env::var(name) {
        *target = value
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.storage.root, PathBuf::from("/srv/storage"));
        assert_eq!(settings.storage.low_space_floor_gb, 10);
        assert_eq!(settings.concurrency.global_queue_limit, 25);
        assert_eq!(settings.concurrency.per_task_max_active, 3);
        assert_eq!(settings.concurrency.per_task_max_queued, 9);
        assert_eq!(settings.concurrency.segments, 4);
        assert_eq!(settings.timing.worker_loop_secs, 2);
        assert_eq!(settings.timing.max_resolve_attempts, 240);
        assert_eq!(settings.timing.selection_timeout(), Duration::from_secs(900));
        assert_eq!(settings.timing.heartbeat_secs, 25);
        assert_eq!(settings.timing.empty_files_poll(), Duration::from_millis(500));
        assert_eq!(settings.retention.retention_days, 7);
        assert_eq!(settings.fetch.segment_min_bytes, 512 * 1024 * 1024);
        assert_eq!(settings.fetch.dl_retries, 2);
        assert_eq!(settings.storage.min_free_bytes, 5 * GIB);
    }

    #[test]
    fn database_path_defaults_under_root() {
        let settings = Settings::default();
        assert_eq!(
            settings.storage.database_path(),
            PathBuf::from("/srv/storage/hauler.db")
        );
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[storage]
root = "/tmp/hauler-test"
low_space_floor_gb = 2

[concurrency]
per_task_max_active = 5
"#
        )
        .unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.storage.root, PathBuf::from("/tmp/hauler-test"));
        assert_eq!(settings.storage.low_space_floor_gb, 2);
        assert_eq!(settings.concurrency.per_task_max_active, 5);
        // untouched sections keep defaults
        assert_eq!(settings.concurrency.per_task_max_queued, 9);
        assert_eq!(settings.timing.resolve_poll_secs, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load(Some(Path::new("/nonexistent/hauler.toml"))).unwrap();
        assert_eq!(settings.concurrency.segments, 4);
    }

    #[test]
    fn rejects_zero_caps() {
        let mut settings = Settings::default();
        settings.concurrency.per_task_max_active = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.provider.rate_per_sec = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let settings = Settings::default();
        let raw = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.concurrency.global_queue_limit, 25);
        assert_eq!(parsed.provider.rate_burst, 4);
    }
}
