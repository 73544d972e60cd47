//! HTTP query server entry point.
//!
//! Loads the persisted snapshot (rebuilding it when it disagrees with the
//! record store or the configured model) and serves `POST /query`. While
//! running it polls `snapshots/CURRENT` so that generations published by a
//! separate `build-index` run are picked up without a restart.
//!
//! ```bash
//! serve
//! PAPER_SEARCH_SERVER__PORT=9000 serve --config paper-search.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use paper_search::{
    app::{Freshness, SearchContext},
    config::ConfigLoader,
    logging::init_logging,
    server::{SearchServer, ServerConfig},
};
use tracing::{info, warn};

/// Semantic paper search HTTP server
#[derive(Parser, Debug)]
#[command(name = "serve", version, about = "Serve semantic paper search over HTTP")]
struct Args {
    /// Configuration file (defaults to ./paper-search.yaml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the listen port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Serve a stale snapshot instead of rebuilding it at startup
    #[arg(long)]
    no_rebuild: bool,

    /// Seconds between checks for a newer snapshot (0 disables)
    #[arg(long, value_name = "SECS")]
    reload_interval: Option<u64>,

    /// Override the configured log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.no_rebuild {
        config.server.rebuild_on_mismatch = false;
    }
    if let Some(secs) = args.reload_interval {
        config.server.reload_interval_secs = secs;
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!(version = paper_search::VERSION, data_dir = %config.data_dir.display(), "starting paper search server");

    let ctx = SearchContext::open(config)
        .await
        .context("Failed to open search context")?;

    match ctx
        .ensure_fresh(ctx.config.server.rebuild_on_mismatch)
        .await
        .context("Failed to prepare index snapshot")?
    {
        Freshness::Fresh => info!("snapshot is up to date"),
        Freshness::Stale => warn!("serving a stale snapshot"),
        Freshness::Rebuilt(report) => info!(
            generation = %report.generation,
            indexed = report.indexed,
            failed = report.failed.len(),
            "snapshot rebuilt"
        ),
    }

    let reloader = ctx.reloader();
    let watcher = match ctx.config.server.reload_interval_secs {
        0 => None,
        secs => {
            info!(interval_secs = secs, "watching for new snapshots");
            Some(reloader.clone().spawn_watch(Duration::from_secs(secs)))
        }
    };

    let server = SearchServer::new(
        Arc::new(ctx.query_service()),
        ServerConfig::from(&ctx.config.server),
    )
    .with_reloader(reloader);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    served.context("Server error")?;

    Ok(())
}
