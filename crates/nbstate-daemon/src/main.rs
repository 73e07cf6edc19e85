//! nbstate-daemon - notebook state server
//!
//! Discovers documents, loads them into the engine in the background and
//! serves bond updates over HTTP as each one becomes ready. With
//! `--export-only` it writes static artifacts and exits without serving.
//!
//! The runtime is created by hand in a synchronous `main` so that argument
//! errors are reported before any worker threads exist.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nbstate_core::cache::{DirectoryCache, NoCache, StateCache};
use nbstate_core::config::NbstateConfig;
use nbstate_core::engine::{NotebookEngine, ProcessEngine};
use nbstate_daemon::discovery::discover;
use nbstate_daemon::export::{Exporter, check_page_names};
use nbstate_daemon::loader::Loader;
use nbstate_daemon::{ServerContext, router};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long each live session gets to stop after the listener closes.
/// Longer than the engine's own grace for a worker to exit.
const SESSION_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "nbstate-daemon")]
#[command(about = "Serves interactive notebook state over HTTP")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Notebooks directory (overrides `notebooks.dir`)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Interface to bind (overrides `server.host`)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides `server.port`)
    #[arg(long)]
    port: Option<u16>,

    /// Write static export artifacts and exit without serving
    #[arg(long)]
    export_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => NbstateConfig::from_file(path).context("failed to load configuration")?,
        None => NbstateConfig::default(),
    };
    if let Some(dir) = &args.dir {
        config.notebooks.dir.clone_from(dir);
    }
    if let Some(host) = &args.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let cache: Arc<dyn StateCache> = if config.cache.enabled {
        info!(dir = %config.cache.dir.display(), "state cache enabled");
        Arc::new(DirectoryCache::new(config.cache.dir.clone()))
    } else {
        Arc::new(NoCache)
    };
    let exporter = config
        .export
        .enabled
        .then(|| Exporter::new(config.export.clone(), config.server.public_url.clone()));
    let engine: Arc<dyn NotebookEngine> = Arc::new(ProcessEngine::new((&config.engine).into()));

    let skip_dirs = [config.export.output_dir.clone(), config.cache.dir.clone()];
    let documents = discover(&config.notebooks, &skip_dirs).with_context(|| {
        format!(
            "failed to discover notebooks in {}",
            config.notebooks.dir.display()
        )
    })?;
    info!(
        dir = %config.notebooks.dir.display(),
        count = documents.len(),
        "discovered notebooks"
    );

    if exporter.is_some() {
        check_page_names(&documents).context("cannot export notebooks")?;
    }

    if args.export_only {
        if exporter.is_none() {
            bail!("--export-only requires export.enabled = true");
        }
        let loader = Loader::new(engine, cache, exporter);
        let summary = loader.export_all(&documents).await;
        if summary.failed > 0 || summary.export_failed > 0 {
            bail!(
                "export incomplete: {} notebooks failed to run, {} failed to write",
                summary.failed,
                summary.export_failed
            );
        }
        return Ok(());
    }

    let ctx = Arc::new(ServerContext::new(documents, config.server.simulated_lag()));
    if let Some(lag) = ctx.simulated_lag() {
        warn!(lag_ms = lag.as_millis(), "simulated lag enabled");
    }

    // Bind before loading so a port conflict fails fast.
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            bail!(
                "port {} is already in use, is another server running? \
                 Pick a different port with --port",
                config.server.port
            );
        },
        Err(e) => return Err(e).with_context(|| format!("failed to bind {addr}")),
    };
    info!(addr = %addr, "nbstate server listening");

    let loader = Loader::new(engine, cache, exporter);
    let loader_task = tokio::spawn({
        let ctx = Arc::clone(&ctx);
        async move { loader.run(&ctx).await }
    });

    axum::serve(listener, router(Arc::clone(&ctx)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    loader_task.abort();
    ctx.shutdown_sessions(SESSION_SHUTDOWN_GRACE).await;
    info!("nbstate server stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
