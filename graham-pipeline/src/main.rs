//! Graham Pipeline - value a batch of securities from the command line.
//!
//! Prints the batch report as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use graham_common::logging::init_logging;
use graham_pipeline::{cancel_channel, Fetcher, HttpFetcher, Orchestrator, PipelineConfig, ProxyPool};

/// Fetch fundamentals through a scored relay pool and score them Graham-style.
#[derive(Parser, Debug)]
#[command(name = "graham-pipeline")]
#[command(version)]
#[command(about = "Concurrent financial-data acquisition and Graham valuation scoring", long_about = None)]
struct Cli {
    /// Security identifiers to value
    #[arg(required = true)]
    ids: Vec<String>,

    /// Config file (defaults to ~/.graham/pipeline.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra relays, one `[scheme://]host:port` per line
    #[arg(long)]
    proxy_file: Option<PathBuf>,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,

    /// Skip the startup health sweep of registered relays
    #[arg(long)]
    skip_proxy_check: bool,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load_from(path)?,
        None => PipelineConfig::load()?,
    };
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );
    info!("Graham Pipeline v{}", env!("CARGO_PKG_VERSION"));

    let proxies = Arc::new(ProxyPool::new(&config.proxy));
    proxies.add_many(&config.proxy.endpoints);
    if let Some(path) = &cli.proxy_file {
        proxies
            .add_from_file(path)
            .with_context(|| format!("Failed to load proxy list {}", path.display()))?;
    }

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::default());
    if !proxies.is_empty() && !cli.skip_proxy_check {
        let summary = proxies
            .test_all(
                fetcher.as_ref(),
                &config.proxy.canary_url,
                config.proxy.check_timeout(),
            )
            .await;
        if summary.healthy == 0 {
            warn!(checked = summary.checked, "No relay passed the health sweep");
        }
    }

    let orchestrator = Orchestrator::new(config, proxies, fetcher).context("Invalid pipeline configuration")?;

    let (cancel, signal) = cancel_channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, cancelling batch");
        cancel.cancel();
    });

    let report = orchestrator.run_batch_with_cancel(&cli.ids, signal).await;

    if !report.failed.is_empty() {
        info!(failures = ?report.failure_counts(), "Failure breakdown");
    }
    let stats = orchestrator.proxies().stats();
    if stats.total > 0 {
        info!(
            active = stats.active,
            degraded = stats.degraded,
            banned = stats.banned,
            "Proxy pool after batch"
        );
    }

    let json = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
