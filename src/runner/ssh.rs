//! SSH runner
//!
//! Commands run on a fresh session channel over a transport borrowed from
//! the [`SshPool`]. Downloads go through `rsync` over ssh, uploads through
//! SFTP.
//!
//! Cancellation is coarser than on the host: an SSH exec channel cannot
//! signal the remote process. When the context carries a deadline the
//! command is wrapped in a remote `timeout`, which bounds it on the server.
//! A cancellation without a deadline closes the channel and returns at once,
//! but the remote command may keep running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::output::{combine, DEFAULT_OUTPUT_LIMIT};
use super::process::{run_in_process_group, ProcessHooks};
use super::{ensure_parent_dir, shell_quote, Runner};
use crate::config::{BackendType, SshConfig};
use crate::context::ExecContext;
use crate::error::{ExecError, RunnerError};
use crate::pool::{Lease, PoolKey, RemoteStatus, SshConnection, SshPool};
use crate::result::CommandResult;

/// Output limit for the runner's own housekeeping commands.
const HOUSEKEEPING_OUTPUT_LIMIT: usize = 64 * 1024;

/// Upload directory when no workdir is configured.
const DEFAULT_UPLOAD_DIR: &str = "/tmp";

enum Connection {
    Pooled(Lease<SshConnection>),
    Direct(Arc<SshConnection>),
}

impl Connection {
    fn shared(&self) -> Arc<SshConnection> {
        match self {
            Connection::Pooled(lease) => lease.connection().clone(),
            Connection::Direct(conn) => conn.clone(),
        }
    }
}

pub struct SshRunner {
    config: SshConfig,
    pool: Arc<SshPool>,
    pooled: bool,
    binary: Option<PathBuf>,
    output_limit: usize,
    conn: Mutex<Option<Connection>>,
}

impl SshRunner {
    /// A pool-managed runner. Fails when host or user is empty.
    pub fn new(config: SshConfig, pool: Arc<SshPool>) -> Result<Self, RunnerError> {
        if config.host.trim().is_empty() {
            return Err(RunnerError::Config("ssh backend requires a host".into()));
        }
        if config.user.trim().is_empty() {
            return Err(RunnerError::Config("ssh backend requires a user".into()));
        }
        Ok(Self {
            config,
            pool,
            pooled: true,
            binary: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            conn: Mutex::new(None),
        })
    }

    /// Own a dedicated connection instead of borrowing from the pool. It is
    /// closed on cleanup.
    pub fn unpooled(mut self) -> Self {
        self.pooled = false;
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Binary uploaded to the remote host during setup.
    pub fn with_binary(mut self, binary: Option<PathBuf>) -> Self {
        self.binary = binary;
        self
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey::from_config(&self.config)
    }

    async fn connection(&self) -> Option<Arc<SshConnection>> {
        self.conn.lock().await.as_ref().map(Connection::shared)
    }

    async fn acquire(&self) -> Result<Connection, RunnerError> {
        if self.pooled {
            self.pool.start_cleanup();
            Ok(Connection::Pooled(self.pool.get(&self.config).await?))
        } else {
            let conn = self.pool.dial_unpooled(&self.config).await?;
            Ok(Connection::Direct(Arc::new(conn)))
        }
    }

    async fn give_back(&self, connection: Connection) {
        match connection {
            Connection::Pooled(lease) => self.pool.release(lease).await,
            Connection::Direct(conn) => conn.disconnect().await,
        }
    }

    /// Acquire a connection unless `ctx` finishes first. Dropping the
    /// pending acquire leaves no lease behind.
    async fn acquire_within(&self, ctx: &ExecContext) -> Result<Connection, RunnerError> {
        if let Some(reason) = ctx.err() {
            return Err(RunnerError::Context(reason));
        }
        tokio::select! {
            acquired = self.acquire() => acquired,
            reason = ctx.done() => {
                warn!(key = %self.pool_key(), %reason, "ssh connect abandoned");
                Err(RunnerError::Context(reason))
            }
        }
    }

    async fn housekeeping(
        &self,
        ctx: &ExecContext,
        conn: &SshConnection,
        command: &str,
    ) -> Result<(), RunnerError> {
        let out = conn
            .exec(ctx, command, HOUSEKEEPING_OUTPUT_LIMIT)
            .await
            .map_err(|e| RunnerError::Ssh(format!("{}: {}", command, e)))?;
        if let RemoteStatus::Cancelled(reason) = &out.status {
            return Err(RunnerError::Context(*reason));
        }
        if !out.success() {
            return Err(RunnerError::Ssh(format!(
                "{} failed ({:?}): {}",
                command,
                out.status,
                combine(out.stdout.to_text(), out.stderr.to_text()).trim()
            )));
        }
        Ok(())
    }

    async fn prepare_remote(
        &self,
        ctx: &ExecContext,
        conn: &SshConnection,
    ) -> Result<(), RunnerError> {
        if let Some(workdir) = self.workdir() {
            let mkdir = format!("mkdir -p {}", shell_quote(workdir));
            self.housekeeping(ctx, conn, &mkdir).await?;
        }
        self.upload_binary(ctx, conn).await
    }

    /// Upload the configured binary and mark it executable. Failure only
    /// costs the extra tooling; only the context running out is an error.
    async fn upload_binary(
        &self,
        ctx: &ExecContext,
        conn: &SshConnection,
    ) -> Result<(), RunnerError> {
        let Some(binary) = &self.binary else {
            return Ok(());
        };
        let Some(file_name) = binary.file_name() else {
            warn!(binary = %binary.display(), "binary path has no file name, skipping upload");
            return Ok(());
        };
        let target = format!(
            "{}/{}",
            self.workdir().unwrap_or(DEFAULT_UPLOAD_DIR).trim_end_matches('/'),
            file_name.to_string_lossy()
        );

        let uploaded = tokio::select! {
            uploaded = conn.upload(binary, &target) => uploaded,
            reason = ctx.done() => return Err(RunnerError::Context(reason)),
        };
        if let Err(e) = uploaded {
            warn!(
                addr = conn.addr(),
                target = %target,
                error = %e,
                "binary upload failed, continuing without it"
            );
            return Ok(());
        }

        let chmod = format!("chmod +x {}", shell_quote(&target));
        match self.housekeeping(ctx, conn, &chmod).await {
            Ok(()) => debug!(addr = conn.addr(), target = %target, "uploaded binary"),
            Err(RunnerError::Context(reason)) => return Err(RunnerError::Context(reason)),
            Err(e) => warn!(
                addr = conn.addr(),
                target = %target,
                error = %e,
                "chmod of uploaded binary failed"
            ),
        }
        Ok(())
    }

    fn workdir(&self) -> Option<&str> {
        self.config.workdir.as_deref().filter(|w| !w.is_empty())
    }
}

/// The command line sent to the server: optional `cd <workdir> &&` prefix,
/// wrapped in `timeout <secs>` when a deadline is known.
pub fn remote_command(
    command: &str,
    workdir: Option<&str>,
    remaining: Option<Duration>,
) -> String {
    let command = match workdir.filter(|w| !w.is_empty()) {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
        None => command.to_string(),
    };
    match remaining {
        Some(remaining) => {
            let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            format!("timeout {} sh -c {}", secs.max(1), shell_quote(&command))
        }
        None => command,
    }
}

/// A ready-to-spawn rsync download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsyncInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// `rsync` over ssh for `config`. Password-only configurations run under
/// `sshpass -e`, with the password passed through the environment.
pub fn rsync_invocation(
    config: &SshConfig,
    remote_path: &str,
    local_path: &Path,
) -> RsyncInvocation {
    let mut ssh = vec![
        "ssh".to_string(),
        "-p".to_string(),
        config.port().to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
    ];

    let key_file = config.key_file.as_deref().filter(|k| !k.is_empty());
    let password = config.password.as_deref().filter(|p| !p.is_empty());
    if let Some(key) = key_file {
        let key = crate::pool::connector::expand_home(key);
        ssh.push("-i".to_string());
        ssh.push(shell_quote(&key.display().to_string()));
    } else if password.is_some() {
        ssh.push("-o".to_string());
        ssh.push("PreferredAuthentications=password".to_string());
        ssh.push("-o".to_string());
        ssh.push("PubkeyAuthentication=no".to_string());
    }

    let rsync_args = vec![
        "-az".to_string(),
        "-e".to_string(),
        ssh.join(" "),
        format!("{}@{}:{}", config.user, config.host, remote_path),
        local_path.display().to_string(),
    ];

    match (key_file, password) {
        (None, Some(password)) => {
            let mut args = vec!["-e".to_string(), "rsync".to_string()];
            args.extend(rsync_args);
            RsyncInvocation {
                program: "sshpass".to_string(),
                args,
                env: vec![("SSHPASS".to_string(), password.to_string())],
            }
        }
        _ => RsyncInvocation {
            program: "rsync".to_string(),
            args: rsync_args,
            env: Vec::new(),
        },
    }
}

#[async_trait]
impl Runner for SshRunner {
    async fn execute(&self, ctx: &ExecContext, command: &str) -> CommandResult {
        if let Some(reason) = ctx.err() {
            return CommandResult::cancelled(String::new(), reason);
        }
        let Some(conn) = self.connection().await else {
            return CommandResult::failed(
                String::new(),
                ExecError::NotReady("ssh connection not established; call setup first".into()),
            );
        };

        let remote = remote_command(command, self.workdir(), ctx.remaining());
        debug!(addr = conn.addr(), command = %remote, "executing over ssh");

        let out = match conn.exec(ctx, &remote, self.output_limit).await {
            Ok(out) => out,
            Err(e) => {
                warn!(addr = conn.addr(), error = %e, "ssh session failed");
                return CommandResult::failed(String::new(), ExecError::Session(e.to_string()));
            }
        };

        let output = combine(out.stdout.to_text(), out.stderr.to_text());
        match out.status {
            RemoteStatus::Exited(code) => CommandResult::from_exit(output, code),
            RemoteStatus::Signaled(signal) => {
                CommandResult::failed(output, ExecError::Signal(signal))
            }
            RemoteStatus::Cancelled(reason) => CommandResult::cancelled(output, reason),
            RemoteStatus::Closed => CommandResult::failed(
                output,
                ExecError::Session("channel closed without exit status".into()),
            ),
        }
    }

    async fn setup(&self, ctx: &ExecContext) -> Result<(), RunnerError> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let connection = self.acquire_within(ctx).await?;
        if let Err(e) = self.prepare_remote(ctx, &connection.shared()).await {
            self.give_back(connection).await;
            return Err(e);
        }
        info!(key = %self.pool_key(), pooled = self.pooled, "ssh runner ready");
        *slot = Some(connection);
        Ok(())
    }

    async fn cleanup(&self, _ctx: &ExecContext) -> Result<(), RunnerError> {
        let connection = self.conn.lock().await.take();
        if let Some(connection) = connection {
            debug!(key = %self.pool_key(), "releasing ssh connection");
            self.give_back(connection).await;
        }
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Ssh
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
        let invocation = rsync_invocation(&self.config, remote_path, local_path);
        which::which("rsync").map_err(|_| RunnerError::MissingTool("rsync".to_string()))?;
        if invocation.program != "rsync" {
            which::which(&invocation.program)
                .map_err(|_| RunnerError::MissingTool(invocation.program.clone()))?;
        }
        ensure_parent_dir(local_path).await?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.envs(invocation.env.iter().map(|(k, v)| (k, v)));

        let result =
            run_in_process_group(cmd, ctx, HOUSEKEEPING_OUTPUT_LIMIT, &ProcessHooks::default())
                .await;
        if let Some(ExecError::Context(reason)) = result.error {
            return Err(RunnerError::Context(reason));
        }
        if !result.success() {
            return Err(RunnerError::Copy(format!(
                "rsync from {}:{} exited with {}: {}",
                self.config.host,
                remote_path,
                result.exit_code,
                result.output.trim()
            )));
        }
        info!(
            key = %self.pool_key(),
            from = remote_path,
            to = %local_path.display(),
            "copied from remote"
        );
        Ok(())
    }
}
