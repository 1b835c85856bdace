//! Stowry -- self-hosted object storage server.
//!
//! `stowry serve` runs the HTTP server.  The other subcommands operate on
//! the same repository and storage directly: `init` migrates and populates
//! metadata from existing files, `add`/`remove` import and soft-delete
//! objects, and `cleanup` purges the bytes of soft-deleted objects.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stowry::commands::{self, AddOptions};
use stowry::config::{Config, DatabaseType, LogConfig};
use stowry::metadata::ListQuery;
use stowry::service::{ServiceConfig, StowryService};
use stowry::AppState;

const DEFAULT_CONFIG: &str = "config.yaml";

/// Command-line arguments for Stowry.
#[derive(Parser, Debug)]
#[command(
    name = "stowry",
    version,
    about = "Self-hosted object storage with presigned URL authentication"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Override the metadata database type (sqlite, postgres, memory).
    #[arg(long, global = true)]
    db_type: Option<DatabaseType>,

    /// Override the metadata database DSN.
    #[arg(long, global = true)]
    db_dsn: Option<String>,

    /// Override the storage root directory.
    #[arg(long, global = true)]
    storage_path: Option<String>,

    /// Override the listen port.
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve,

    /// Migrate the metadata schema and index files already in storage.
    Init,

    /// Purge stored bytes of soft-deleted objects.
    Cleanup {
        /// Objects per page.
        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// Only purge objects under this prefix.
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Import local files.
    Add {
        /// Destination path prefix.
        #[arg(short, long, default_value = "")]
        dest: String,

        /// Add directories recursively.
        #[arg(short, long)]
        recursive: bool,

        /// Skip files that already exist.
        #[arg(short = 'n', long)]
        no_clobber: bool,

        /// Only log warnings and errors.
        #[arg(short, long)]
        quiet: bool,

        /// Files or directories to add.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Soft-delete objects.
    Remove {
        /// Treat each argument as a prefix and remove everything under it.
        #[arg(short, long)]
        prefix: bool,

        /// Only log warnings and errors.
        #[arg(short, long)]
        quiet: bool,

        /// Object paths (or prefixes with -p).
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

impl Command {
    fn quiet(&self) -> bool {
        matches!(
            self,
            Command::Add { quiet: true, .. } | Command::Remove { quiet: true, .. }
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load(&cli)?;
    init_tracing(&config.log, cli.command.quiet())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Init => {
            let svc = open_service(&config).await?;
            let ctx = cancel_on_signal();
            let count = svc.populate(&ctx).await.context("populate metadata")?;
            info!(count, "init complete");
            Ok(())
        }
        Command::Cleanup { limit, prefix } => {
            let svc = open_service(&config).await?;
            let ctx = cancel_on_signal();
            match svc.tombstone(&ctx, ListQuery::new(prefix, limit, "")).await {
                Ok(purged) => {
                    info!(purged, "cleanup complete");
                    Ok(())
                }
                Err(e) => {
                    error!(purged = e.purged, error = %e.source, "cleanup failed");
                    Err(e.into())
                }
            }
        }
        Command::Add {
            dest,
            recursive,
            no_clobber,
            files,
            ..
        } => {
            let svc = open_service(&config).await?;
            let ctx = cancel_on_signal();
            let opts = AddOptions {
                dest,
                recursive,
                no_clobber,
            };
            commands::add_files(&svc, &ctx, &files, &opts).await?;
            Ok(())
        }
        Command::Remove { prefix, paths, .. } => {
            let svc = open_service(&config).await?;
            let ctx = cancel_on_signal();
            commands::remove_paths(&svc, &ctx, &paths, prefix).await?;
            Ok(())
        }
    }
}

/// File, then `STOWRY_*` environment, then command-line flags.
fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = stowry::config::load_config(&cli.config, cli.config != DEFAULT_CONFIG)?;
    config.apply_env()?;

    if let Some(t) = cli.db_type {
        config.database.db_type = t;
    }
    if let Some(dsn) = &cli.db_dsn {
        config.database.dsn = dsn.clone();
    }
    if let Some(path) = &cli.storage_path {
        config.storage.path = path.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing(log: &LogConfig, quiet: bool) -> anyhow::Result<()> {
    let fallback = if quiet { "warn" } else { log.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback))
        .with_context(|| format!("invalid log level {fallback:?}"))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = if log.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    res.map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}

async fn open_service(config: &Config) -> anyhow::Result<StowryService> {
    let repo = stowry::metadata::connect(&config.database)
        .await
        .context("open metadata repository")?;
    let storage = stowry::storage::open(&config.storage).context("open storage")?;
    Ok(StowryService::new(
        repo,
        storage,
        ServiceConfig::new(config.server.mode, config.service.cleanup_timeout),
    ))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    if config.observability.metrics && stowry::metrics::init_metrics().is_some() {
        info!("Prometheus metrics initialized");
    }

    let service = open_service(&config).await?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let drain = Duration::from_secs(config.server.shutdown_timeout);
    let mode = config.server.mode;
    let state = Arc::new(AppState::new(config, service)?);
    let app = stowry::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    info!(addr = %bind_addr, mode = %mode, "stowry listening");

    // Stop accepting on SIGTERM/SIGINT, then give in-flight requests at most
    // `shutdown_timeout` to finish.
    let stop = CancellationToken::new();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => return res.context("server error"),
        _ = shutdown_signal() => {}
    }
    stop.cancel();

    match tokio::time::timeout(drain, server).await {
        Ok(res) => res.context("server error")?,
        Err(_) => warn!(timeout_secs = drain.as_secs(), "graceful shutdown timed out"),
    }

    info!("stowry shut down");
    Ok(())
}

/// A token cancelled when the process receives SIGINT or SIGTERM.
fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        child.cancel();
    });
    token
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
