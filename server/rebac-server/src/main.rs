use anyhow::Context;
use clap::Parser;
use config_engine::ConfigLoader;
use rebac_server::{metrics_registry, Server};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use zanzibar_storage::RequestContext;

/// Upper bound on draining in-flight requests at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// ReBAC engine datastore server
#[derive(Parser, Debug)]
#[command(name = "rebac-server")]
#[command(about = "Relationship-based access control datastore server")]
struct Args {
    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long, env = "REBAC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.file(path);
    }
    let config = loader.load().context("failed to load configuration")?;

    let mut log_settings = config.log_settings();
    if args.verbose {
        log_settings.level = "debug".to_string();
    }
    telemetry::init_tracing(&log_settings)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rebac-server");

    let metrics = metrics_registry()?;
    let server = Arc::new(Server::new(config, metrics).await?);

    let mut serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run(&RequestContext::background()).await }
    });

    let finished_early = tokio::select! {
        joined = &mut serving => Some(joined),
        () = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
    };

    let close_result = server
        .close(&RequestContext::with_timeout(SHUTDOWN_TIMEOUT))
        .await;

    let joined = match finished_early {
        Some(joined) => joined,
        None => {
            if !serving.is_finished() {
                serving.abort();
            }
            serving.await
        }
    };

    match joined {
        Ok(run_result) => run_result?,
        Err(e) if e.is_cancelled() => warn!("HTTP server aborted after shutdown deadline"),
        Err(e) => return Err(e).context("HTTP server task failed"),
    }

    if let Err(e) = &close_result {
        error!("Shutdown incomplete: {}", e);
    }
    close_result?;
    info!("rebac-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
