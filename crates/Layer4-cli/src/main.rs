//! fnjob CLI - Main entry point
//!
//! The same binary is both the server and every worker: the server starts
//! workers by re-running itself with the hidden `worker` subcommand.

use clap::{Parser, Subcommand};
use fnjob_cli::demo;
use fnjob_foundation::{ConfigLoader, ServerConfig, ShutdownMode, DEFAULT_FUNCTION_TIMEOUT_SECS};
use fnjob_task::{run_worker, EntryPoint, JobDispatcher, WorkerInvocation};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// fnjob - run functions as background jobs over HTTP
#[derive(Parser, Debug)]
#[command(name = "fnjob")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the registered functions
    Serve {
        /// Extra settings file, merged over the default locations
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address
        #[arg(long)]
        host: Option<String>,

        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,

        /// What happens to running workers on shutdown (join, terminate)
        #[arg(long)]
        shutdown_mode: Option<ShutdownMode>,

        /// Task database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print the registered functions
    Functions {
        /// Extra settings file, merged over the default locations
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run one task (started by the server)
    #[command(hide = true)]
    Worker,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        // Workers stay synchronous; the function body owns the process
        Command::Worker => worker(args.debug),
        Command::Functions { config } => {
            let config = load_config(config)?;
            init_logging(args.debug || config.debug);
            print!("{}", demo::registry(config.default_timeout())?.to_text());
            Ok(())
        }
        Command::Serve {
            config,
            host,
            port,
            shutdown_mode,
            db,
        } => {
            let mut config = load_config(config)?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(mode) = shutdown_mode {
                config.shutdown_mode = mode;
            }
            if let Some(db) = db {
                config.store.path = db;
            }
            config.debug |= args.debug;
            config.validate()?;

            init_logging(config.debug);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(serve(config))
        }
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    debug!("Effective config: {:?}", config);

    let registry = demo::registry(config.default_timeout())?;
    let entry_point = EntryPoint::current_exe()?;
    let dispatcher = Arc::new(JobDispatcher::open(registry, &config.store, entry_point)?);
    info!("Task store: {}", config.store.path.display());

    fnjob_server::serve(dispatcher, &config).await?;
    Ok(())
}

fn worker(debug: bool) -> anyhow::Result<()> {
    init_logging(debug);

    let invocation = WorkerInvocation::from_env()?;
    let registry = demo::registry(Duration::from_secs(DEFAULT_FUNCTION_TIMEOUT_SECS))?;

    let task_id = invocation.task_id.clone();
    if !run_worker(&registry, invocation)? {
        debug!("Task {} already finished; outcome discarded", task_id);
    }
    Ok(())
}

fn load_config(extra: Option<PathBuf>) -> anyhow::Result<ServerConfig> {
    let mut loader = ConfigLoader::new(&std::env::current_dir()?);
    if let Some(path) = extra {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        loader.add_path(path);
    }
    Ok(loader.load_all()?)
}

fn init_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
