use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::jobs::{CoordinatorPolicy, FailurePolicy};

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub datasets: DatasetsConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Capacity of the lifecycle event broadcast. Slow `/ws` clients that
    /// fall further behind skip events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct JobsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_cancel_intent_ttl")]
    pub cancel_intent_ttl_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            failure_policy: FailurePolicy::default(),
            cancel_intent_ttl_secs: default_cancel_intent_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DatasetsConfig {
    #[serde(default = "default_datasets_dir")]
    pub dir: PathBuf,
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            dir: default_datasets_dir(),
        }
    }
}

fn default_event_buffer() -> usize {
    1024
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_cancel_intent_ttl() -> u64 {
    600
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("sca.db")
}
fn default_datasets_dir() -> PathBuf {
    PathBuf::from("datasets")
}

impl Config {
    /// Read `path`. A missing file gives the defaults; so does a malformed
    /// one, with a warning.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config unreadable, using defaults");
                return Self::default();
            }
        };
        Self::parse(&content).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "config malformed, using defaults");
            Self::default()
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn policy(&self) -> CoordinatorPolicy {
        CoordinatorPolicy {
            failure_policy: self.jobs.failure_policy,
            cancel_intent_ttl: Duration::from_secs(self.jobs.cancel_intent_ttl_secs),
        }
    }
}
