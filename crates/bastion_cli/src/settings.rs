//! Layered settings.
//!
//! Precedence, lowest first: built-in defaults, the JSON file given with
//! `--config`, `BASTION_*` environment variables, command-line flags.

use bastion_core::{Client, Policy, Repository, Secret};
use bastion_ingest::IngestSettings;
use bastion_runtime::{ExecutorSettings, SchedulerSettings};
use bastion_tool::ToolSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Settings file
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// File is not a valid settings document
    #[error("invalid settings in {path}: {source}")]
    Json {
        /// Settings file
        path: PathBuf,
        /// Cause
        source: serde_json::Error,
    },

    /// Environment variable could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    Env {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },
}

/// Storage location and update retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// redb database file
    pub path: PathBuf,
    /// Advisory lock file serializing scheduler cycles
    pub lock_path: PathBuf,
    /// Control socket of the scheduler daemon
    pub socket_path: PathBuf,
    /// Attempts for a job update on transient errors
    pub retry_attempts: u32,
    /// Pause between those attempts
    pub retry_interval_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("bastion.redb"),
            lock_path: PathBuf::from("bastion.lock"),
            socket_path: PathBuf::from("bastion.sock"),
            retry_attempts: 5,
            retry_interval_ms: 5000,
        }
    }
}

impl StorageSettings {
    /// Pause between update attempts
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Policies, clients and repositories known to this instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    /// Backup policies
    pub policies: Vec<Policy>,
    /// Hosts
    pub clients: Vec<Client>,
    /// Borg repositories
    pub repositories: Vec<Repository>,
}

/// Whole settings document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `tracing` filter directive; `RUST_LOG` wins when set
    pub log_filter: Option<String>,
    /// Scheduler knobs
    pub scheduler: SchedulerSettings,
    /// Executor knobs
    pub executor: ExecutorSettings,
    /// Program names and callback settings for builders
    pub tool: ToolSettings,
    /// Event pipeline knobs
    pub ingest: IngestSettings,
    /// Storage knobs
    pub storage: StorageSettings,
    /// Configuration records
    pub inventory: Inventory,
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::Env {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl Settings {
    /// Read the file at `path`, or start from defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override from the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a recognized variable has an unparseable value
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_vars(std::env::vars())
    }

    /// Override from `BASTION_*` pairs; other keys are ignored
    ///
    /// # Errors
    ///
    /// Returns error if a recognized variable has an unparseable value
    pub fn apply_vars(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), SettingsError> {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("BASTION_") else {
                continue;
            };
            match name {
                "LOG_FILTER" => self.log_filter = Some(value),
                "STORAGE_PATH" => self.storage.path = PathBuf::from(value),
                "LOCK_PATH" => self.storage.lock_path = PathBuf::from(value),
                "SOCKET_PATH" => self.storage.socket_path = PathBuf::from(value),
                "MAX_CONCURRENT_JOBS" => {
                    self.scheduler.max_concurrent_jobs = Some(parse(&key, &value)?);
                }
                "CYCLE_INTERVAL_SECS" => self.scheduler.cycle_interval_secs = parse(&key, &value)?,
                "TIMEOUT_SECS" => self.executor.timeout_secs = parse(&key, &value)?,
                "IDLE_TIMEOUT_SECS" => self.executor.idle_timeout_secs = parse(&key, &value)?,
                "DEBUG_TRACEBACKS" => self.executor.debug_tracebacks = parse_bool(&key, &value)?,
                "SCRATCH_ROOT" => self.executor.scratch_root = Some(PathBuf::from(value)),
                "BASE_URL" => self.tool.base_url = Some(value),
                "TOKEN" => self.tool.token = Some(Secret::new(value)),
                "BORG" => self.tool.borg = value,
                "INGEST_WORKERS" => self.ingest.workers = parse(&key, &value)?,
                "INGEST_QUEUE_CAPACITY" => self.ingest.queue_capacity = parse(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Keep the builders' remote timeouts in step with the executor
    pub fn sync_tool_timeouts(&mut self) {
        self.tool.timeout_secs = self.executor.timeout_secs;
        self.tool.idle_timeout_secs = self.executor.idle_timeout_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.ingest.workers, 4);
        assert_eq!(settings.storage.retry_attempts, 5);
        assert_eq!(settings.scheduler.reconcile_interval_secs, 180);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.json");
        std::fs::write(
            &path,
            r#"{
                "scheduler": {"max_concurrent_jobs": 2},
                "storage": {"path": "/var/lib/bastion/db.redb"},
                "inventory": {"repositories": [
                    {"id": 1, "name": "main", "url": "/srv/borg/main", "ready": false, "credentials": {}}
                ]}
            }"#,
        )
        .unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.scheduler.max_concurrent_jobs, Some(2));
        assert_eq!(settings.scheduler.cycle_interval_secs, 30);
        assert_eq!(settings.storage.path, PathBuf::from("/var/lib/bastion/db.redb"));
        assert_eq!(settings.storage.retry_interval_ms, 5000);
        assert_eq!(settings.inventory.repositories.len(), 1);
    }

    #[test]
    fn test_load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, SettingsError::Json { .. }));
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_vars(vars(&[
                ("BASTION_MAX_CONCURRENT_JOBS", "3"),
                ("BASTION_DEBUG_TRACEBACKS", "yes"),
                ("BASTION_INGEST_WORKERS", "8"),
                ("BASTION_TOKEN", "s3cret"),
                ("BASTION_SOCKET_PATH", "/run/bastion/control.sock"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(settings.scheduler.max_concurrent_jobs, Some(3));
        assert!(settings.executor.debug_tracebacks);
        assert_eq!(settings.ingest.workers, 8);
        assert_eq!(settings.tool.token.as_ref().map(Secret::expose), Some("s3cret"));
        assert_eq!(settings.storage.socket_path, PathBuf::from("/run/bastion/control.sock"));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut settings = Settings::default();
        let err = settings
            .apply_vars(vars(&[("BASTION_INGEST_WORKERS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("BASTION_INGEST_WORKERS"));
    }
}
