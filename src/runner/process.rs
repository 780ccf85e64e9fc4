//! Local process execution in a dedicated process group
//!
//! Shared by the host runner and the Docker runner (whose `docker` client
//! runs locally). The child is started as the leader of a new process group
//! so that cancellation can signal the whole descendant tree at once.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::output::{combine, drain, shared_buffer, shared_text};
use crate::context::{ContextError, ExecContext};
use crate::error::ExecError;
use crate::result::{CommandResult, EXIT_CODE_UNAVAILABLE};

/// How long to wait for output pipes to close after the group was killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

pub type PidCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Callbacks exposing the OS process id, e.g. for a "stop run" button that
/// tracks live processes.
#[derive(Clone, Default)]
pub struct ProcessHooks {
    pub on_start: Option<PidCallback>,
    pub on_end: Option<PidCallback>,
}

impl ProcessHooks {
    pub fn new(
        on_start: impl Fn(u32) + Send + Sync + 'static,
        on_end: impl Fn(u32) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_start: Some(Arc::new(on_start)),
            on_end: Some(Arc::new(on_end)),
        }
    }
}

impl fmt::Debug for ProcessHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_end", &self.on_end.is_some())
            .finish()
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled(ContextError),
}

/// Run `cmd` to completion or until `ctx` finishes.
///
/// stdout and stderr are captured into separate buffers of `limit` bytes and
/// joined stdout-first. On cancellation every process in the group is
/// killed and the result carries exit code -1 and the context error.
pub(crate) async fn run_in_process_group(
    mut cmd: Command,
    ctx: &ExecContext,
    limit: usize,
    hooks: &ProcessHooks,
) -> CommandResult {
    if let Some(reason) = ctx.err() {
        return CommandResult::cancelled(String::new(), reason);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandResult::failed(String::new(), ExecError::Start(e.to_string()));
        }
    };
    let pid = child.id();
    if let (Some(pid), Some(on_start)) = (pid, &hooks.on_start) {
        on_start(pid);
    }

    let stdout_buf = shared_buffer(limit);
    let stderr_buf = shared_buffer(limit);

    // Each drain task holds a sender; the channel closes once both finish.
    let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);
    if let Some(stdout) = child.stdout.take() {
        let (buf, tx) = (stdout_buf.clone(), drain_tx.clone());
        tokio::spawn(async move {
            let _tx = tx;
            let _ = drain(stdout, buf).await;
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let (buf, tx) = (stderr_buf.clone(), drain_tx.clone());
        tokio::spawn(async move {
            let _tx = tx;
            let _ = drain(stderr, buf).await;
        });
    }
    drop(drain_tx);

    let mut outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        reason = ctx.done() => Outcome::Cancelled(reason),
    };

    // A finished shell can leave background jobs holding the pipes open;
    // keep honouring the context while the output drains.
    if let Outcome::Exited(_) = outcome {
        let reason = tokio::select! {
            _ = drains_finished(&mut drain_rx) => None,
            reason = ctx.done() => Some(reason),
        };
        if let Some(reason) = reason {
            outcome = Outcome::Cancelled(reason);
        }
    }

    if let Outcome::Cancelled(reason) = &outcome {
        debug!(pid = ?pid, reason = %reason, "killing process group");
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        let _ = child.kill().await;
        let _ = tokio::time::timeout(KILL_GRACE, drains_finished(&mut drain_rx)).await;
    }

    if let (Some(pid), Some(on_end)) = (pid, &hooks.on_end) {
        on_end(pid);
    }

    let output = combine(shared_text(&stdout_buf), shared_text(&stderr_buf));
    match outcome {
        Outcome::Cancelled(reason) => CommandResult::cancelled(output, reason),
        Outcome::Exited(Ok(status)) => result_from_status(output, status),
        Outcome::Exited(Err(e)) => CommandResult::failed(output, ExecError::Start(e.to_string())),
    }
}

async fn drains_finished(rx: &mut mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {}
}

fn result_from_status(output: String, status: ExitStatus) -> CommandResult {
    if let Some(code) = status.code() {
        return CommandResult::from_exit(output, code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return CommandResult::failed(output, ExecError::Signal(signal.to_string()));
        }
    }
    CommandResult {
        output,
        exit_code: EXIT_CODE_UNAVAILABLE,
        error: Some(ExecError::Signal("unknown".to_string())),
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "process group kill failed"
        );
    }
}

/// Without process groups only the direct child is killed (by the caller).
#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) {}
