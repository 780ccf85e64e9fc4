//! Error types for runner construction, setup and command execution

use crate::context::ContextError;
use crate::pool::PoolError;

/// Errors from constructing, preparing or tearing down a runner.
///
/// Command failures are not `RunnerError`s: they come back as a
/// [`CommandResult`](crate::CommandResult) carrying an [`ExecError`].
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown backend type: {0}")]
    UnknownBackend(String),

    #[error("Required tool not found on PATH: {0}")]
    MissingTool(String),

    #[error("Runner not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Copy failed: {0}")]
    Copy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl RunnerError {
    /// Whether repeating the same call could succeed. Configuration problems
    /// never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Config(_)
            | RunnerError::UnknownBackend(_)
            | RunnerError::MissingTool(_)
            | RunnerError::NotReady(_) => false,
            RunnerError::Pool(e) => e.is_retryable(),
            _ => true,
        }
    }
}

/// Why a command did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start command: {0}")]
    Start(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("exit status {0}")]
    ExitStatus(i32),

    #[error("terminated by signal {0}")]
    Signal(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("runner not ready: {0}")]
    NotReady(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_not_retryable() {
        assert!(!RunnerError::Config("image is required".into()).is_retryable());
        assert!(!RunnerError::UnknownBackend("kubernetes".into()).is_retryable());
        assert!(!RunnerError::Pool(PoolError::NoAuthMethod("u@h:22".into())).is_retryable());
        assert!(RunnerError::Docker("daemon unavailable".into()).is_retryable());
    }

    #[test]
    fn test_context_error_display() {
        let err = ExecError::from(ContextError::Canceled);
        assert_eq!(err.to_string(), "context canceled");
        assert_eq!(ExecError::ExitStatus(2).to_string(), "exit status 2");
    }
}
