use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use step_runners::prelude::*;
use step_runners::{BackendSpec, ProcessHooks};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "step-runner")]
#[command(about = "Run a command on a host, Docker or SSH backend", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a runners.yaml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Clone)]
struct BackendArgs {
    /// Named backend from the config file, or a backend tag (host, docker, ssh)
    #[arg(short, long, default_value = "host")]
    backend: String,

    /// Docker image (docker backend)
    #[arg(long)]
    image: Option<String>,

    /// Keep one container for the whole run (docker backend)
    #[arg(long)]
    persistent: bool,

    /// Remote host (ssh backend)
    #[arg(long)]
    host: Option<String>,

    /// Remote port (ssh backend)
    #[arg(long)]
    port: Option<u16>,

    /// Remote user (ssh backend)
    #[arg(long)]
    user: Option<String>,

    /// Private key file (ssh backend)
    #[arg(long)]
    key_file: Option<String>,

    /// Working directory on the backend
    #[arg(long)]
    workdir: Option<String>,

    /// Deadline in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one command
    Exec {
        #[command(flatten)]
        backend: BackendArgs,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Command line, run through `sh -c`
        #[arg(
            value_name = "COMMAND",
            trailing_var_arg = true,
            allow_hyphen_values = true,
            required = true
        )]
        command: Vec<String>,
    },

    /// Copy a file from the backend to this machine
    Copy {
        #[command(flatten)]
        backend: BackendArgs,

        /// Path on the backend
        #[arg(value_name = "REMOTE")]
        remote: String,

        /// Local destination
        #[arg(value_name = "LOCAL")]
        local: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "step_runners=debug,step_runner=debug"
    } else {
        "step_runners=info,step_runner=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "step-runner failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = match &cli.config {
        Some(path) => RunnerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RunnerConfig::default(),
    };

    match cli.command {
        Commands::Exec {
            backend,
            json,
            command,
        } => exec(&config, &backend, json, &command.join(" ")).await,
        Commands::Copy {
            backend,
            remote,
            local,
        } => copy(&config, &backend, &remote, &local).await,
    }
}

/// Resolve the backend spec: a named entry from the config file, else a tag
/// with ad-hoc flags.
fn resolve_backend(config: &RunnerConfig, args: &BackendArgs) -> BackendSpec {
    let mut spec = config.backend(&args.backend).cloned().unwrap_or_else(|| BackendSpec {
        backend: args.backend.clone(),
        config: BackendConfig::default(),
    });

    match BackendType::parse_tag(&spec.backend) {
        Ok(BackendType::Docker) => {
            let docker = spec.config.docker.get_or_insert_with(DockerConfig::default);
            if let Some(image) = &args.image {
                docker.image = image.clone();
            }
            if args.persistent {
                docker.persistent = true;
            }
            if args.workdir.is_some() {
                docker.workdir = args.workdir.clone();
            }
        }
        Ok(BackendType::Ssh) => {
            let ssh = spec.config.ssh.get_or_insert_with(SshConfig::default);
            if let Some(host) = &args.host {
                ssh.host = host.clone();
            }
            if let Some(user) = &args.user {
                ssh.user = user.clone();
            }
            if args.port.is_some() {
                ssh.port = args.port;
            }
            if args.key_file.is_some() {
                ssh.key_file = args.key_file.clone();
            }
            if args.workdir.is_some() {
                ssh.workdir = args.workdir.clone();
            }
            if ssh.password.is_none() {
                ssh.password = std::env::var("STEP_RUNNER_SSH_PASSWORD").ok();
            }
        }
        _ => {}
    }
    spec
}

/// A runner for the requested backend, with a pool sized from the config
/// file. The caller shuts the pool down when done.
fn build_runner(
    config: &RunnerConfig,
    args: &BackendArgs,
) -> anyhow::Result<(Arc<dyn Runner>, Arc<SshPool>)> {
    let spec = resolve_backend(config, args);
    let pool = Arc::new(SshPool::new_ssh(config.pool.settings()));
    let options = RunnerOptions {
        bin_dir: config.bin_dir.clone(),
        binary_path: config.binary.clone(),
        output_limit: config.output_limit,
        pool: Some(pool.clone()),
        hooks: ProcessHooks::new(
            |pid| tracing::debug!(pid, "process started"),
            |pid| tracing::debug!(pid, "process finished"),
        ),
    };
    let runner = create_runner(&spec.backend, Some(&spec.config), options)?;
    Ok((runner, pool))
}

async fn finish(runner: &dyn Runner, pool: &SshPool) {
    if let Err(e) = runner.cleanup(&ExecContext::background()).await {
        tracing::warn!(error = %e, "backend cleanup failed");
    }
    pool.stop();
    pool.close_all().await;
}

/// A context honouring `--timeout` and Ctrl-C.
fn command_context(timeout: Option<u64>) -> ExecContext {
    let base = match timeout {
        Some(secs) => ExecContext::with_timeout(Duration::from_secs(secs)),
        None => ExecContext::background(),
    };
    let (ctx, cancel) = base.with_cancel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });
    ctx
}

async fn exec(
    config: &RunnerConfig,
    args: &BackendArgs,
    json: bool,
    command: &str,
) -> anyhow::Result<u8> {
    let (runner, pool) = build_runner(config, args)?;
    let ctx = command_context(args.timeout);

    if let Err(e) = runner.setup(&ctx).await {
        finish(runner.as_ref(), &pool).await;
        return Err(anyhow::Error::new(e).context("backend setup failed"));
    }
    let result = runner.execute(&ctx, command).await;
    finish(runner.as_ref(), &pool).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.output);
        if let Some(err) = &result.error {
            tracing::info!(exit_code = result.exit_code, error = %err, "command did not succeed");
        }
    }

    Ok(match result.exit_code {
        code @ 0..=255 => code as u8,
        _ => 1,
    })
}

async fn copy(
    config: &RunnerConfig,
    args: &BackendArgs,
    remote: &str,
    local: &std::path::Path,
) -> anyhow::Result<u8> {
    let (runner, pool) = build_runner(config, args)?;
    let ctx = command_context(args.timeout);

    if let Err(e) = runner.setup(&ctx).await {
        finish(runner.as_ref(), &pool).await;
        return Err(anyhow::Error::new(e).context("backend setup failed"));
    }
    let copied = runner.copy_from_remote(&ctx, remote, local).await;
    finish(runner.as_ref(), &pool).await;
    copied.with_context(|| format!("copying {}", remote))?;

    tracing::info!(remote, local = %local.display(), "copied");
    Ok(0)
}
