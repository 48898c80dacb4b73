//! Packline worker: runs the post-processing pipeline until signalled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use packline_db::Store;
use packline_pipeline::{
    shared_sampler, CommandDetector, Coordinator, DiscoveryMode, FfprobeProbe, PipelineConfig,
    SystemLoadSampler,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packline_worker=info,packline_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = PipelineConfig::from_env().context("Invalid configuration")?;
    let mode = startup_mode(
        std::env::var("PACKLINE_MODE").ok().as_deref(),
        std::env::var("PACKLINE_CUSTOM_PATHS").ok().as_deref(),
        config.discovery.first_run_days,
    )?;
    tracing::info!(
        node = %config.node_name,
        sources = config.discovery.sources.len(),
        mode = mode.label(),
        "Loaded pipeline configuration",
    );

    // --- Store ---
    let store = Store::open(&config.database_url)
        .await
        .with_context(|| format!("Failed to open store at {}", config.database_url))?;
    tracing::info!("Store opened and migrated");

    // --- Pipeline ---
    let detector = Arc::new(CommandDetector::new(config.detector_command.clone()));
    let coordinator = Coordinator::new(
        Arc::new(store),
        detector,
        Arc::new(FfprobeProbe),
        shared_sampler(SystemLoadSampler::new()),
        config,
    )?;
    coordinator.start(mode).await?;

    shutdown_signal().await;

    coordinator.stop().await?;
    coordinator.store().close().await;
    tracing::info!("Worker stopped");
    Ok(())
}

/// Discovery mode from `PACKLINE_MODE` (`default`, `first_run`, `custom`).
fn startup_mode(
    mode: Option<&str>,
    custom_paths: Option<&str>,
    first_run_days: u32,
) -> anyhow::Result<DiscoveryMode> {
    match mode.map(str::trim).unwrap_or("default") {
        "" | "default" => Ok(DiscoveryMode::Default),
        "first_run" => Ok(DiscoveryMode::FirstRun {
            days_back: first_run_days,
        }),
        "custom" => {
            let paths: Vec<PathBuf> = custom_paths
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
            anyhow::ensure!(
                !paths.is_empty(),
                "PACKLINE_MODE=custom requires PACKLINE_CUSTOM_PATHS"
            );
            Ok(DiscoveryMode::Custom { paths })
        }
        other => anyhow::bail!("Unknown PACKLINE_MODE {other:?}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
