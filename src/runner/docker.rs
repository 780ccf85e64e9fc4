//! Docker runner
//!
//! Two modes:
//! - ephemeral: every `execute` is a fresh `docker run --rm ... sh -c <cmd>`
//! - persistent: `setup` starts one long-lived container
//!   (`tail -f /dev/null`) and every `execute` is a `docker exec` into it
//!
//! The `docker` client runs locally in its own process group, so the host
//! runner's cancellation semantics apply to it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::output::DEFAULT_OUTPUT_LIMIT;
use super::process::{run_in_process_group, ProcessHooks};
use super::{ensure_parent_dir, Runner};
use crate::config::{BackendType, DockerConfig};
use crate::context::ExecContext;
use crate::error::{ExecError, RunnerError};
use crate::result::CommandResult;

/// Where a propagated binary lands inside the container.
const CONTAINER_BIN_DIR: &str = "/usr/local/bin";

/// Budget for best-effort removal of a cancelled ephemeral container.
const FORCE_REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DockerRunner {
    config: DockerConfig,
    binary: Option<PathBuf>,
    output_limit: usize,
    client: String,
    client_args: Vec<String>,
    container: Mutex<Option<String>>,
}

impl DockerRunner {
    pub fn new(config: DockerConfig) -> Result<Self, RunnerError> {
        if config.image.trim().is_empty() {
            return Err(RunnerError::Config("docker backend requires an image".into()));
        }
        Ok(Self {
            config,
            binary: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            client: "docker".to_string(),
            client_args: Vec::new(),
            container: Mutex::new(None),
        })
    }

    /// Run the docker CLI through another program, e.g. `sudo` with
    /// `["docker"]`. Defaults to plain `docker`.
    pub fn with_client(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.client = program.into();
        self.client_args = args;
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Binary copied into a persistent container during setup.
    pub fn with_binary(mut self, binary: Option<PathBuf>) -> Self {
        self.binary = binary;
        self
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.config.persistent
    }

    /// Id of the persistent container, once started.
    pub async fn container_id(&self) -> Option<String> {
        self.container.lock().await.clone()
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &self.config.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        if let Some(network) = &self.config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(workdir) = &self.config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        args
    }

    /// `docker run` arguments for one ephemeral command.
    pub fn run_args(&self, name: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        args.extend(self.common_args());
        args.push(self.config.image.clone());
        args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
        args
    }

    /// `docker run` arguments for the long-lived container.
    pub fn start_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        args.extend(self.common_args());
        args.push(self.config.image.clone());
        args.extend(["tail", "-f", "/dev/null"].map(String::from));
        args
    }

    pub fn exec_args(container: &str, command: &str) -> Vec<String> {
        ["exec", container, "sh", "-c", command]
            .map(String::from)
            .to_vec()
    }

    async fn docker(&self, ctx: &ExecContext, args: &[String]) -> CommandResult {
        let mut cmd = Command::new(&self.client);
        cmd.args(&self.client_args).args(args);
        run_in_process_group(cmd, ctx, self.output_limit, &ProcessHooks::default()).await
    }

    async fn pull_image(&self, ctx: &ExecContext) {
        let image = &self.config.image;
        info!(image = %image, "pulling image");
        let args = ["pull".to_string(), image.clone()];
        let result = self.docker(ctx, &args).await;
        if !result.success() {
            // The image may already exist locally; a later run will tell.
            warn!(
                image = %image,
                exit_code = result.exit_code,
                output = %result.output.trim(),
                "image pull failed, continuing with local image"
            );
        }
    }

    async fn start_container(&self, ctx: &ExecContext) -> Result<String, RunnerError> {
        let name = container_name();
        let result = self.docker(ctx, &self.start_args(&name)).await;
        if let Some(ExecError::Context(reason)) = &result.error {
            return Err(RunnerError::Context(*reason));
        }
        if !result.success() {
            return Err(RunnerError::Docker(format!(
                "failed to start container from {}: {}",
                self.config.image,
                result.output.trim()
            )));
        }
        let id = result
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| RunnerError::Docker("docker run -d printed no container id".into()))?;
        info!(
            container = %id,
            name = %name,
            image = %self.config.image,
            "started persistent container"
        );
        Ok(id)
    }

    /// Copy the configured binary into the container. Failure only costs
    /// the extra tooling.
    async fn propagate_binary(&self, ctx: &ExecContext, container: &str) {
        let Some(binary) = &self.binary else {
            return;
        };
        let Some(file_name) = binary.file_name() else {
            warn!(binary = %binary.display(), "binary path has no file name, skipping copy");
            return;
        };
        let target = format!(
            "{}:{}/{}",
            container,
            CONTAINER_BIN_DIR,
            file_name.to_string_lossy()
        );
        let args = [
            "cp".to_string(),
            binary.display().to_string(),
            target.clone(),
        ];
        let result = self.docker(ctx, &args).await;
        if result.success() {
            debug!(target = %target, "copied binary into container");
        } else {
            warn!(
                binary = %binary.display(),
                container,
                output = %result.output.trim(),
                "failed to copy binary into container, continuing without it"
            );
        }
    }

    async fn force_remove(&self, name: &str) {
        let ctx = ExecContext::with_timeout(FORCE_REMOVE_TIMEOUT);
        let args = ["rm".to_string(), "-f".to_string(), name.to_string()];
        let result = self.docker(&ctx, &args).await;
        if result.success() {
            debug!(container = name, "removed cancelled container");
        } else {
            debug!(
                container = name,
                output = %result.output.trim(),
                "cancelled container not removed"
            );
        }
    }
}

fn container_name() -> String {
    format!("step-runner-{}", uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl Runner for DockerRunner {
    async fn execute(&self, ctx: &ExecContext, command: &str) -> CommandResult {
        if self.config.persistent {
            let Some(container) = self.container_id().await else {
                return CommandResult::failed(
                    String::new(),
                    ExecError::NotReady(
                        "persistent container not started; call setup first".into(),
                    ),
                );
            };
            debug!(container = %container, command, "executing in persistent container");
            return self.docker(ctx, &Self::exec_args(&container, command)).await;
        }

        let name = container_name();
        debug!(
            container = %name,
            image = %self.config.image,
            command,
            "executing in ephemeral container"
        );
        let result = self.docker(ctx, &self.run_args(&name, command)).await;
        if result.is_cancelled() {
            // Killing the client does not stop the container itself.
            self.force_remove(&name).await;
        }
        result
    }

    async fn setup(&self, ctx: &ExecContext) -> Result<(), RunnerError> {
        which::which(&self.client).map_err(|_| RunnerError::MissingTool(self.client.clone()))?;

        let mut container = self.container.lock().await;
        if container.is_some() {
            return Ok(());
        }

        self.pull_image(ctx).await;
        if !self.config.persistent {
            return Ok(());
        }

        let id = self.start_container(ctx).await?;
        self.propagate_binary(ctx, &id).await;
        *container = Some(id);
        Ok(())
    }

    /// Stop the persistent container. On failure the id is kept so a later
    /// cleanup can retry.
    async fn cleanup(&self, ctx: &ExecContext) -> Result<(), RunnerError> {
        let mut container = self.container.lock().await;
        let Some(id) = container.clone() else {
            return Ok(());
        };
        info!(container = %id, "stopping persistent container");
        let args = ["stop".to_string(), id.clone()];
        let result = self.docker(ctx, &args).await;
        if !result.success() {
            return Err(RunnerError::Docker(format!(
                "failed to stop container {}: {}",
                id,
                result.output.trim()
            )));
        }
        *container = None;
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Docker
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn copy_from_remote(
        &self,
        ctx: &ExecContext,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), RunnerError> {
        let Some(container) = self.container_id().await else {
            return Err(RunnerError::NotReady(
                "copy requires a running persistent container".into(),
            ));
        };
        ensure_parent_dir(local_path).await?;

        let args = [
            "cp".to_string(),
            format!("{}:{}", container, remote_path),
            local_path.display().to_string(),
        ];
        let result = self.docker(ctx, &args).await;
        if !result.success() {
            return Err(RunnerError::Copy(format!(
                "docker cp {}:{} failed: {}",
                container,
                remote_path,
                result.output.trim()
            )));
        }
        info!(
            container = %container,
            from = remote_path,
            to = %local_path.display(),
            "copied from container"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> DockerConfig {
        DockerConfig {
            image: "alpine:3.20".to_string(),
            env: HashMap::from([
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "1".to_string()),
            ]),
            volumes: vec!["/tmp/cache:/cache".to_string()],
            network: Some("host".to_string()),
            workdir: Some("/work".to_string()),
            persistent: false,
        }
    }

    #[test]
    fn test_requires_image() {
        let err = DockerRunner::new(DockerConfig::default()).err().unwrap();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_run_args() {
        let runner = DockerRunner::new(config()).unwrap();
        let args = runner.run_args("c1", "echo hi");
        assert_eq!(
            args,
            vec![
                "run", "--rm", "--name", "c1", "-e", "A=1", "-e", "B=2", "-v",
                "/tmp/cache:/cache", "--network", "host", "-w", "/work", "alpine:3.20", "sh",
                "-c", "echo hi",
            ]
        );
    }

    #[test]
    fn test_start_args_keep_container_alive() {
        let runner = DockerRunner::new(DockerConfig {
            image: "alpine".to_string(),
            persistent: true,
            ..Default::default()
        })
        .unwrap();
        let args = runner.start_args("c2");
        assert_eq!(
            args,
            vec!["run", "-d", "--rm", "--name", "c2", "alpine", "tail", "-f", "/dev/null"]
        );
    }

    #[test]
    fn test_exec_args() {
        assert_eq!(
            DockerRunner::exec_args("abc123", "ls"),
            vec!["exec", "abc123", "sh", "-c", "ls"]
        );
    }

    #[tokio::test]
    async fn test_persistent_execute_before_setup_is_not_ready() {
        let runner = DockerRunner::new(DockerConfig {
            image: "alpine".to_string(),
            persistent: true,
            ..Default::default()
        })
        .unwrap();
        let res = runner.execute(&ExecContext::background(), "true").await;
        assert_eq!(res.exit_code, -1);
        assert!(matches!(res.error, Some(ExecError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_cleanup_without_container_is_noop() {
        let runner = DockerRunner::new(config()).unwrap();
        let ctx = ExecContext::background();
        runner.cleanup(&ctx).await.unwrap();
        runner.cleanup(&ctx).await.unwrap();
    }

    #[test]
    fn test_container_names_are_unique() {
        assert_ne!(container_name(), container_name());
        assert!(container_name().starts_with("step-runner-"));
    }
}
