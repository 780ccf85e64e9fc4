//! Host runner
//!
//! Executes commands on the local machine through `sh -c`, each in a new
//! process group so cancellation takes down the whole descendant tree.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::output::DEFAULT_OUTPUT_LIMIT;
use super::process::{run_in_process_group, ProcessHooks};
use super::{ensure_parent_dir, Runner};
use crate::config::BackendType;
use crate::context::ExecContext;
use crate::error::RunnerError;
use crate::result::CommandResult;

#[derive(Debug, Clone)]
pub struct HostRunner {
    bin_dir: Option<PathBuf>,
    output_limit: usize,
    hooks: ProcessHooks,
}

impl Default for HostRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRunner {
    pub fn new() -> Self {
        Self {
            bin_dir: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            hooks: ProcessHooks::default(),
        }
    }

    /// Prepend `dir` to PATH for every command.
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn with_hooks(mut self, hooks: ProcessHooks) -> Self {
        self.hooks = hooks;
        self
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(path) = self.bin_dir.as_deref().and_then(prefixed_path) {
            cmd.env("PATH", path);
        }
        cmd
    }
}

fn prefixed_path(dir: &Path) -> Option<OsString> {
    let mut entries = vec![dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        entries.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(entries).ok()
}

#[async_trait]
impl Runner for HostRunner {
    async fn execute(&self, ctx: &ExecContext, command: &str) -> CommandResult {
        debug!(command, "executing on host");
        let cmd = self.command(command);
        let result = run_in_process_group(cmd, ctx, self.output_limit, &self.hooks).await;
        debug!(exit_code = result.exit_code, "host command finished");
        result
    }

    async fn setup(&self, _ctx: &ExecContext) -> Result<(), RunnerError> {
        which::which("sh").map_err(|_| RunnerError::MissingTool("sh".to_string()))?;
        Ok(())
    }

    async fn cleanup(&self, _ctx: &ExecContext) -> Result<(), RunnerError> {
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Host
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn copy_from_remote(
        &self,
        _ctx: &ExecContext,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RunnerError> {
        let source = Path::new(remote_path);
        if source == local_path {
            return Ok(());
        }
        ensure_parent_dir(local_path).await?;
        tokio::fs::copy(source, local_path)
            .await
            .map_err(|e| RunnerError::Copy(format!("{}: {}", remote_path, e)))?;
        info!(from = remote_path, to = %local_path.display(), "copied file on host");
        Ok(())
    }
}
