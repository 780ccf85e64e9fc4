//! Runner configuration
//!
//! Named backends and pool tuning, loaded from a YAML file such as
//! `runners.yaml`:
//!
//! ```yaml
//! output_limit: 1048576
//! binary: ./target/release/helper
//!
//! pool:
//!   idle_timeout: 300
//!   cleanup_interval: 60
//!
//! backends:
//!   build:
//!     type: docker
//!     docker:
//!       image: rust:1.80
//!       persistent: true
//!   deploy:
//!     type: ssh
//!     ssh:
//!       host: deploy.internal
//!       user: ci
//!       key_file: ~/.ssh/id_ed25519
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backend::{BackendConfig, BackendType};
use crate::error::RunnerError;
use crate::pool::{PoolSettings, RetryConfig};
use crate::runner::output::DEFAULT_OUTPUT_LIMIT;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },
}

/// A named backend declaration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendSpec {
    /// Backend tag (`host`, `docker`, `ssh`); empty means host
    #[serde(rename = "type", default)]
    pub backend: String,

    #[serde(flatten)]
    pub config: BackendConfig,
}

impl BackendSpec {
    pub fn backend_type(&self) -> Result<BackendType, RunnerError> {
        BackendType::parse_tag(&self.backend)
    }
}

/// SSH pool tuning, in seconds / milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,

    #[serde(default = "default_dial_backoff_ms")]
    pub dial_backoff_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_dial_attempts() -> u32 {
    3
}

fn default_dial_backoff_ms() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            cleanup_interval: default_cleanup_interval(),
            dial_attempts: default_dial_attempts(),
            dial_backoff_ms: default_dial_backoff_ms(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        let defaults = PoolSettings::default();
        PoolSettings {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            cleanup_interval: Duration::from_secs(self.cleanup_interval.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout.max(1)),
            dial_retry: RetryConfig {
                max_attempts: self.dial_attempts.max(1),
                initial_delay: Duration::from_millis(self.dial_backoff_ms),
                ..defaults.dial_retry
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Per-stream capture limit in bytes
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,

    /// Local binary propagated into Docker containers and SSH hosts
    pub binary: Option<PathBuf>,

    /// Directory prepended to PATH for host commands
    pub bin_dir: Option<PathBuf>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub backends: HashMap<String, BackendSpec>,
}

fn default_output_limit() -> usize {
    DEFAULT_OUTPUT_LIMIT
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_limit: default_output_limit(),
            binary: None,
            bin_dir: None,
            pool: PoolConfig::default(),
            backends: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: RunnerConfig = serde_yaml::from_str(&content).map_err(|e| LoadError::Yaml {
            file: path.display().to_string(),
            error: e,
        })?;
        Ok(config)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendSpec> {
        self.backends.get(name)
    }
}
