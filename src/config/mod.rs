//! Node configuration file.
//!
//! One TOML file carries the engine parameters at the top level and the
//! job schedule under `[jobs]`:
//!
//! ```toml
//! transport_max_bytes_to_sync = 4194304
//!
//! [conflict]
//! missing_delete = "stop"
//!
//! [jobs]
//! route = "5s"
//! push = "10s"
//! purge = "1h"
//! ```

pub mod duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

use symmetric_sync_engine::EngineParameters;

pub use duration::{duration_arg, parse_duration};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub engine: EngineParameters,
    #[serde(default)]
    pub jobs: JobSchedule,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_duration(&text).map_err(serde::de::Error::custom)
}

fn ser_duration<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}ms", value.as_millis()))
}

/// How often `run` fires each job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSchedule {
    #[serde(deserialize_with = "de_duration", serialize_with = "ser_duration")]
    pub route: Duration,
    #[serde(deserialize_with = "de_duration", serialize_with = "ser_duration")]
    pub push: Duration,
    #[serde(deserialize_with = "de_duration", serialize_with = "ser_duration")]
    pub pull: Duration,
    #[serde(deserialize_with = "de_duration", serialize_with = "ser_duration")]
    pub ack: Duration,
    #[serde(deserialize_with = "de_duration", serialize_with = "ser_duration")]
    pub purge: Duration,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self {
            route: Duration::from_secs(10),
            push: Duration::from_secs(60),
            pull: Duration::from_secs(60),
            ack: Duration::from_secs(30),
            purge: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use symmetric_sync_engine::MissingDeletePolicy;

    #[test]
    fn test_defaults_when_empty() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.engine.num_of_ack_retries, 5);
        assert_eq!(config.jobs.route, Duration::from_secs(10));
    }

    #[test]
    fn test_engine_parameters_and_jobs() {
        let config = AppConfig::from_toml(
            r#"
            transport_max_bytes_to_sync = 4096
            cluster_lock_enabled = true

            [conflict]
            missing_delete = "stop"

            [jobs]
            route = "500ms"
            purge = "2h"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.transport_max_bytes_to_sync, 4096);
        assert!(config.engine.cluster_lock_enabled);
        assert_eq!(config.engine.conflict.missing_delete, MissingDeletePolicy::Stop);
        assert_eq!(config.jobs.route, Duration::from_millis(500));
        assert_eq!(config.jobs.purge, Duration::from_secs(7200));
        assert_eq!(config.jobs.push, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_job_interval() {
        let err = AppConfig::from_toml("[jobs]\nroute = \"soon\"").unwrap_err();
        assert!(format!("{err:#}").contains("Invalid duration value"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "num_of_ack_retries = 2\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.engine.num_of_ack_retries, 2);
        assert_eq!(AppConfig::load(None).unwrap(), AppConfig::default());
    }
}
