//! Backend configuration types
//!
//! - `backend` - Backend tag and per-backend configuration records
//! - `runner_config` - Named backends and pool tuning loaded from YAML

pub mod backend;
pub mod runner_config;

pub use backend::{BackendConfig, BackendType, DockerConfig, SshConfig, DEFAULT_SSH_PORT};
pub use runner_config::{BackendSpec, LoadError, PoolConfig, RunnerConfig};
