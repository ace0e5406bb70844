#![forbid(unsafe_code)]

//! `prefork-server` binary.
//!
//! Without a subcommand the process becomes the supervisor: it loads the
//! configuration, binds the public socket and boots the worker pool. The
//! hidden `worker` subcommand is what the supervisor runs for each worker.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use prefork_server::signals::shutdown_signal;
use prefork_server::supervisor::WorkerCommand;
use prefork_server::worker::process::{self, WorkerArgs};
use prefork_server::{AppError, Result, ServerConfig, Supervisor};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "prefork-server", about = "Prefork HTTP server", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to an optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Public address to listen on, overriding `host`, `port` and `PORT`.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Number of worker processes.
    #[arg(long)]
    workers: Option<u32>,

    /// Per-request timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Shutdown grace period in seconds.
    #[arg(long)]
    graceful_timeout: Option<u64>,

    /// Built-in app served by the workers.
    #[arg(long)]
    app: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run as a worker process (started by the supervisor).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    match args.command {
        Some(Command::Worker(worker_args)) => run_worker(worker_args),
        None => {
            info!("prefork-server bootstrap");
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
                .block_on(run(args))
                .inspect_err(|err| error!(%err, "server failed"))
        }
    }
}

fn run_worker(args: WorkerArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    let result = runtime.block_on(process::run(args));
    // The lifeline reader parks a blocking stdin read; do not wait for it.
    runtime.shutdown_background();
    result
}

async fn run(args: Cli) -> Result<()> {
    let config = resolve_config(&args)?;
    info!(
        bind = %config.bind_addr(),
        workers = config.workers,
        timeout_secs = config.timeout_seconds,
        app = %config.app,
        "configuration loaded"
    );

    let command = WorkerCommand::current_exe(&config)?
        .with_leading_args(["--log-format", args.log_format.as_arg()]);
    let supervisor = Supervisor::start(&config, command).await?;
    info!(addr = %supervisor.local_addr(), "server ready");

    let signal = shutdown_signal().await;
    info!(signal = signal.name(), "shutdown signal received");
    supervisor.shutdown(config.graceful_timeout()).await;
    info!("prefork-server shut down");

    Ok(())
}

/// Defaults, then the config file, then `PORT`, then CLI flags.
fn resolve_config(args: &Cli) -> Result<ServerConfig> {
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.set_bind_addr(bind);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_seconds = timeout;
    }
    if let Some(grace) = args.graceful_timeout {
        config.graceful_timeout_seconds = grace;
    }
    if let Some(app) = &args.app {
        config.app.clone_from(app);
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
