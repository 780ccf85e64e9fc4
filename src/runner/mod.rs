//! Execution backends
//!
//! This module provides the runners a workflow step can execute on:
//! - `host`: the local machine, `sh -c` in its own process group
//! - `docker`: an ephemeral (`run --rm`) or persistent (`exec`) container
//! - `ssh`: a remote machine over a pooled SSH connection
//!
//! Shared helpers:
//! - `output`: bounded stdout/stderr capture
//! - `process`: process-group spawn and cancellation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

pub mod docker;
pub mod host;
pub mod output;
pub mod process;
pub mod ssh;

pub use docker::DockerRunner;
pub use host::HostRunner;
pub use output::{BoundedBuffer, DEFAULT_OUTPUT_LIMIT};
pub use process::{PidCallback, ProcessHooks};
pub use ssh::SshRunner;

use crate::config::{BackendConfig, BackendType};
use crate::context::ExecContext;
use crate::error::RunnerError;
use crate::pool::SshPool;
use crate::result::CommandResult;

/// Uniform contract over every execution backend.
///
/// Runners are shared across concurrently running steps, so every method
/// takes `&self`; per-runner state lives behind async locks.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `command` through a POSIX shell on this backend.
    async fn execute(&self, ctx: &ExecContext, command: &str) -> CommandResult;

    /// Prepare the backend. Calling it again after success is a no-op.
    async fn setup(&self, ctx: &ExecContext) -> Result<(), RunnerError>;

    /// Release backend resources. Safe to call more than once.
    async fn cleanup(&self, ctx: &ExecContext) -> Result<(), RunnerError>;

    fn backend_type(&self) -> BackendType;

    /// Whether commands run somewhere other than the local filesystem, i.e.
    /// whether `copy_from_remote` moves data between machines.
    fn is_remote(&self) -> bool;

    /// Copy `remote_path` on the backend to `local_path` on this machine,
    /// creating the local parent directory.
    async fn copy_from_remote(
        &self,
        ctx: &ExecContext,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RunnerError>;
}

/// Options shared by every runner the factory builds
#[derive(Clone)]
pub struct RunnerOptions {
    /// Directory prepended to PATH for host commands
    pub bin_dir: Option<PathBuf>,

    /// Local binary propagated into containers and remote hosts
    pub binary_path: Option<PathBuf>,

    /// Per-stream capture limit in bytes
    pub output_limit: usize,

    /// Pool for SSH runners; the process-wide pool when `None`
    pub pool: Option<Arc<SshPool>>,

    /// Host process callbacks
    pub hooks: ProcessHooks,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            bin_dir: None,
            binary_path: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            pool: None,
            hooks: ProcessHooks::default(),
        }
    }
}

impl std::fmt::Debug for RunnerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerOptions")
            .field("bin_dir", &self.bin_dir)
            .field("binary_path", &self.binary_path)
            .field("output_limit", &self.output_limit)
            .field("custom_pool", &self.pool.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Build the runner for a declared backend tag.
///
/// An empty tag selects the host. Unknown tags and missing required fields
/// are configuration errors raised before any process or network activity.
pub fn create_runner(
    tag: &str,
    config: Option<&BackendConfig>,
    options: RunnerOptions,
) -> Result<Arc<dyn Runner>, RunnerError> {
    let backend = BackendType::parse_tag(tag)?;
    create_runner_for(backend, config, options)
}

pub fn create_runner_for(
    backend: BackendType,
    config: Option<&BackendConfig>,
    options: RunnerOptions,
) -> Result<Arc<dyn Runner>, RunnerError> {
    match backend {
        BackendType::Host => {
            let runner = HostRunner::new()
                .with_output_limit(options.output_limit)
                .with_hooks(options.hooks);
            let runner = match options.bin_dir {
                Some(dir) => runner.with_bin_dir(dir),
                None => runner,
            };
            Ok(Arc::new(runner))
        }
        BackendType::Docker => {
            let docker = config
                .and_then(|c| c.docker.clone())
                .ok_or_else(|| {
                    RunnerError::Config("docker backend requires docker config".into())
                })?;
            let runner = DockerRunner::new(docker)?
                .with_output_limit(options.output_limit)
                .with_binary(options.binary_path);
            Ok(Arc::new(runner))
        }
        BackendType::Ssh => {
            let ssh = config
                .and_then(|c| c.ssh.clone())
                .ok_or_else(|| RunnerError::Config("ssh backend requires ssh config".into()))?;
            let pool = options.pool.unwrap_or_else(SshPool::global);
            let runner = SshRunner::new(ssh, pool)?
                .with_output_limit(options.output_limit)
                .with_binary(options.binary_path);
            Ok(Arc::new(runner))
        }
    }
}

/// Single-quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Create the parent directory of a copy destination.
pub(crate) async fn ensure_parent_dir(path: &Path) -> Result<(), RunnerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DockerConfig, SshConfig};

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/work"), "/tmp/work");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_factory_defaults_to_host() {
        let runner = create_runner("", None, RunnerOptions::default()).unwrap();
        assert_eq!(runner.backend_type(), BackendType::Host);
        assert!(!runner.is_remote());
    }

    #[test]
    fn test_factory_rejects_unknown_tag() {
        let err = create_runner("podman", None, RunnerOptions::default()).err().unwrap();
        assert!(matches!(err, RunnerError::UnknownBackend(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_factory_requires_docker_image() {
        let config = BackendConfig::docker(DockerConfig::default());
        let err = create_runner("docker", Some(&config), RunnerOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::Config(_)));

        let err = create_runner("docker", None, RunnerOptions::default()).err().unwrap();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_factory_requires_ssh_host_and_user() {
        let pool = Arc::new(SshPool::new_ssh(Default::default()));
        let options = RunnerOptions {
            pool: Some(pool),
            ..Default::default()
        };

        let config = BackendConfig::ssh(SshConfig::new("", "deploy"));
        let err = create_runner("ssh", Some(&config), options.clone()).err().unwrap();
        assert!(matches!(err, RunnerError::Config(_)));

        let config = BackendConfig::ssh(SshConfig::new("example.com", ""));
        let err = create_runner("ssh", Some(&config), options.clone()).err().unwrap();
        assert!(matches!(err, RunnerError::Config(_)));

        let config = BackendConfig::ssh(SshConfig::new("example.com", "deploy"));
        let runner = create_runner("ssh", Some(&config), options).unwrap();
        assert_eq!(runner.backend_type(), BackendType::Ssh);
        assert!(runner.is_remote());
    }
}
