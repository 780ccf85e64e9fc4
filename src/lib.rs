//! # Step Runners
//!
//! The execution backend layer of a workflow engine: one command-execution
//! contract over three backends, plus a shared SSH connection pool.
//!
//! ## Backends
//!
//! - **Host** (default): `sh -c` on the local machine, in its own process group
//! - **Docker**: ephemeral `docker run --rm` per command, or one persistent
//!   container reused through `docker exec`
//! - **SSH**: a session per command over a pooled, authenticated transport
//!
//! The workflow layer resolves a step to a backend tag, a configuration and
//! a command string; this crate runs it and hands back a [`CommandResult`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use step_runners::{create_runner, ExecContext, RunnerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = create_runner("host", None, RunnerOptions::default())?;
//!     let ctx = ExecContext::with_timeout(Duration::from_secs(30));
//!
//!     runner.setup(&ctx).await?;
//!     let result = runner.execute(&ctx, "echo hello").await;
//!     runner.cleanup(&ctx).await?;
//!
//!     println!("exit={} output={}", result.exit_code, result.output);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod result;
pub mod runner;

// Re-export main types
pub use config::{
    BackendConfig, BackendSpec, BackendType, DockerConfig, LoadError, PoolConfig, RunnerConfig,
    SshConfig,
};
pub use context::{CancelHandle, ContextError, ExecContext};
pub use error::{ExecError, RunnerError};
pub use pool::{
    ConnectionPool, Connector, DialError, Lease, PoolError, PoolKey, PoolSettings, RetryConfig,
    SshPool,
};
pub use result::{CommandResult, EXIT_CODE_UNAVAILABLE};
pub use runner::{
    create_runner, create_runner_for, DockerRunner, HostRunner, ProcessHooks, Runner,
    RunnerOptions, SshRunner,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{BackendConfig, BackendType, DockerConfig, RunnerConfig, SshConfig};
    pub use crate::context::{ContextError, ExecContext};
    pub use crate::error::{ExecError, RunnerError};
    pub use crate::pool::SshPool;
    pub use crate::result::CommandResult;
    pub use crate::runner::{create_runner, Runner, RunnerOptions};
}
