//! Process-wide configuration.
//!
//! Values come from an optional TOML file with environment variables
//! layered on top, so a deployment can ship a baseline file and still
//! flip individual knobs per process. Recognized environment keys:
//!
//! | Key                     | Default              |
//! |-------------------------|----------------------|
//! | `WORKFLOW_PERSIST_ROOT` | `./modernizer-state` |
//! | `WORKFLOW_CONCURRENCY`  | 4                    |
//! | `CONTAINER_CLEANUP`     | `true`               |
//! | `CONTAINER_PORT_NODE`   | 3000                 |
//! | `CONTAINER_PORT_PYTHON` | 5000                 |
//! | `REASONER_TIMEOUT`      | `30s`                |
//! | `INSTALL_TIMEOUT`       | `300s`               |
//! | `TEST_TIMEOUT`          | `120s`               |
//! | `REASONER_MAX_RETRIES`  | 3                    |
//!
//! The reasoner endpoint itself (`REASONER_URL`, `REASONER_MODEL`,
//! `REASONER_API_KEY`) is read by [`crate::reasoner::ReasonerConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::reasoner::ReasonerConfig;
use crate::validation::ValidationConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

fn default_persist_root() -> PathBuf {
    PathBuf::from("./modernizer-state")
}

fn default_concurrency() -> usize {
    4
}

fn default_cleanup() -> bool {
    true
}

fn default_port_node() -> u16 {
    3000
}

fn default_port_python() -> u16 {
    5000
}

fn default_reasoner_timeout() -> u64 {
    30
}

fn default_install_timeout() -> u64 {
    300
}

fn default_test_timeout() -> u64 {
    120
}

fn default_reasoner_max_retries() -> u32 {
    3
}

fn default_start_settle_ms() -> u64 {
    3000
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_persist_root")]
    pub persist_root: PathBuf,
    /// How many workflows may run at once; the rest queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// `false` keeps validation containers around after the run.
    #[serde(default = "default_cleanup")]
    pub container_cleanup: bool,
    #[serde(default = "default_port_node")]
    pub container_port_node: u16,
    #[serde(default = "default_port_python")]
    pub container_port_python: u16,
    #[serde(default = "default_reasoner_timeout")]
    pub reasoner_timeout_secs: u64,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_reasoner_max_retries")]
    pub reasoner_max_retries: u32,
    /// Settle delay between launching the app and probing it.
    #[serde(default = "default_start_settle_ms")]
    pub start_settle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persist_root: default_persist_root(),
            concurrency: default_concurrency(),
            container_cleanup: default_cleanup(),
            container_port_node: default_port_node(),
            container_port_python: default_port_python(),
            reasoner_timeout_secs: default_reasoner_timeout(),
            install_timeout_secs: default_install_timeout(),
            test_timeout_secs: default_test_timeout(),
            reasoner_max_retries: default_reasoner_max_retries(),
            start_settle_ms: default_start_settle_ms(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                toml::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: e,
                })?
            }
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Environment-only configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("WORKFLOW_PERSIST_ROOT") {
            self.persist_root = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<usize>("WORKFLOW_CONCURRENCY")? {
            self.concurrency = v.max(1);
        }
        if let Ok(v) = std::env::var("CONTAINER_CLEANUP") {
            self.container_cleanup = !(v == "0" || v.eq_ignore_ascii_case("false"));
        }
        if let Some(v) = env_parse::<u16>("CONTAINER_PORT_NODE")? {
            self.container_port_node = v;
        }
        if let Some(v) = env_parse::<u16>("CONTAINER_PORT_PYTHON")? {
            self.container_port_python = v;
        }
        if let Some(v) = env_duration("REASONER_TIMEOUT")? {
            self.reasoner_timeout_secs = v;
        }
        if let Some(v) = env_duration("INSTALL_TIMEOUT")? {
            self.install_timeout_secs = v;
        }
        if let Some(v) = env_duration("TEST_TIMEOUT")? {
            self.test_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u32>("REASONER_MAX_RETRIES")? {
            self.reasoner_max_retries = v;
        }
        Ok(())
    }

    /// Validation-engine view of this configuration.
    pub fn validation(&self) -> ValidationConfig {
        ValidationConfig {
            node_port: self.container_port_node,
            python_port: self.container_port_python,
            cleanup: self.container_cleanup,
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            test_timeout: Duration::from_secs(self.test_timeout_secs),
            start_settle: Duration::from_millis(self.start_settle_ms),
            ..ValidationConfig::default()
        }
    }

    /// Reasoner-client view; endpoint fields come from their own env keys.
    pub fn reasoner(&self) -> ReasonerConfig {
        ReasonerConfig {
            timeout: Duration::from_secs(self.reasoner_timeout_secs),
            max_retries: self.reasoner_max_retries,
            ..ReasonerConfig::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

/// Durations accept plain seconds ("30"), or "30s" / "5m" suffixes.
fn env_duration(key: &str) -> Result<Option<u64>, ConfigError> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    let invalid = || ConfigError::Invalid {
        key: key.to_string(),
        value: raw.clone(),
    };
    let trimmed = raw.trim();
    if let Some(mins) = trimmed.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .map(|m| Some(m * 60))
            .map_err(|_| invalid());
    }
    let secs = trimmed.strip_suffix('s').unwrap_or(trimmed).trim();
    secs.parse::<u64>().map(Some).map_err(|_| invalid())
}
