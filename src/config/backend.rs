//! Backend types and configurations
//!
//! This module contains the backend tag and the per-backend configuration
//! records handed to the factory:
//! - Host (no configuration)
//! - Docker (image, env, volumes, network, workdir, persistence)
//! - SSH (host, port, user, key file, password, workdir)

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

// ============================================================================
// Backend Enum
// ============================================================================

/// Where a step's command runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// The local machine (default)
    #[default]
    Host,
    /// Inside a Docker container
    Docker,
    /// On a remote machine over SSH
    Ssh,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Host => "host",
            BackendType::Docker => "docker",
            BackendType::Ssh => "ssh",
        }
    }

    /// Parse a declared backend tag. An empty tag selects the host backend.
    pub fn parse_tag(tag: &str) -> Result<Self, RunnerError> {
        match tag.trim() {
            "" => Ok(BackendType::Host),
            other => other.parse(),
        }
    }
}

impl FromStr for BackendType {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(BackendType::Host),
            "docker" => Ok(BackendType::Docker),
            "ssh" => Ok(BackendType::Ssh),
            _ => Err(RunnerError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Docker Configuration
// ============================================================================

/// Docker container configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DockerConfig {
    /// Image to run, e.g. `alpine:3.20`
    #[serde(default)]
    pub image: String,

    /// Environment variables passed with `-e`
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Volume mounts passed with `-v`, in docker's `src:dst[:opts]` form
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Network mode passed with `--network`
    pub network: Option<String>,

    /// Working directory inside the container
    pub workdir: Option<String>,

    /// Keep one container alive across `execute` calls
    #[serde(default)]
    pub persistent: bool,
}

// ============================================================================
// SSH Configuration
// ============================================================================

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Remote machine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SshConfig {
    #[serde(default)]
    pub host: String,

    /// Port, 22 when unset
    pub port: Option<u16>,

    #[serde(default)]
    pub user: String,

    /// Private key file; `~/` is expanded to the home directory
    pub key_file: Option<String>,

    pub password: Option<String>,

    /// Remote working directory, created during setup
    pub workdir: Option<String>,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        match self.port {
            Some(0) | None => DEFAULT_SSH_PORT,
            Some(port) => port,
        }
    }
}

// ============================================================================
// Combined Configuration
// ============================================================================

/// Backend configuration as produced by the workflow layer
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendConfig {
    pub docker: Option<DockerConfig>,
    pub ssh: Option<SshConfig>,
}

impl BackendConfig {
    pub fn docker(config: DockerConfig) -> Self {
        Self {
            docker: Some(config),
            ssh: None,
        }
    }

    pub fn ssh(config: SshConfig) -> Self {
        Self {
            docker: None,
            ssh: Some(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag() {
        assert_eq!(BackendType::parse_tag("").unwrap(), BackendType::Host);
        assert_eq!(BackendType::parse_tag("docker").unwrap(), BackendType::Docker);
        assert_eq!(BackendType::parse_tag("SSH").unwrap(), BackendType::Ssh);

        let err = BackendType::parse_tag("kubernetes").unwrap_err();
        assert!(matches!(err, RunnerError::UnknownBackend(ref t) if t == "kubernetes"));
    }

    #[test]
    fn test_ssh_default_port() {
        let mut config = SshConfig::new("example.com", "deploy");
        assert_eq!(config.port(), 22);
        config.port = Some(2222);
        assert_eq!(config.port(), 2222);
    }

    #[test]
    fn test_parse_docker_config() {
        let yaml = r#"
image: alpine:3.20
env:
  FOO: bar
volumes:
  - /tmp:/data
network: host
persistent: true
"#;
        let config: DockerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.image, "alpine:3.20");
        assert_eq!(config.env.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(config.volumes, vec!["/tmp:/data".to_string()]);
        assert_eq!(config.network.as_deref(), Some("host"));
        assert!(config.persistent);
        assert!(config.workdir.is_none());
    }
}
