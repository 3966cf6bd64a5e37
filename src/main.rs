mod aggregate;
mod api;
mod cli;
mod config;
mod control;
mod error;
mod extract;
mod notify;
mod pipeline;
mod retention;
mod scheduler;
mod session;
mod store;
mod types;
mod values;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::StatusBoard;
use crate::api::routes::{router, ApiState};
use crate::cli::{Cli, Commands};
use crate::config::{Config, Env, StoragePaths};
use crate::control::Control;
use crate::error::Result;
use crate::notify::Notifier;
use crate::pipeline::{CaptureDepth, CapturePipeline, PipelineSettings};
use crate::retention::RetentionManager;
use crate::scheduler::{RunOutcome, Scheduler};
use crate::store::CaptureStore;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let env = Env::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&env.log_level))
        .init();

    let cfg = match Config::load(&env.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    let command = args.command.unwrap_or(Commands::Daemon);
    match run(command, env, cfg).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Fatal error: {e}");
            std::process::exit(1);
        }
    }
}

/// `Ok(false)` when a one-shot command ran but did not succeed.
async fn run(command: Commands, env: Env, cfg: Config) -> Result<bool> {
    // --- Storage ---
    let paths = StoragePaths::new(&env.data_root, &env.config_path);
    paths.ensure()?;
    info!("Data root {}", paths.root.display());

    // --- Pipeline, retention, scheduler ---
    let pipeline = Arc::new(CapturePipeline::new(
        PipelineSettings::from_config(&cfg),
        paths.clone(),
    ));
    let retention = Arc::new(RetentionManager::new(Arc::clone(&pipeline), cfg.retention()));
    let status = Arc::new(StatusBoard::new());
    let schedule = cfg.schedule()?;
    if !schedule.headless {
        warn!("automation.use_headless=false has no effect on an HTTP session");
    }
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&pipeline),
        Arc::clone(&retention),
        Arc::clone(&status),
        Notifier::new(cfg.notifications.clone()),
        schedule,
    )?);

    match command {
        Commands::Capture { no_details } => {
            let depth = if no_details {
                CaptureDepth::ListOnly
            } else {
                pipeline.settings().default_depth
            };
            let outcome = scheduler.run_capture(depth, "cli").await;
            if let RunOutcome::Completed { path, .. } = &outcome {
                info!("Capture written to {}", path.display());
            }
            Ok(outcome.is_completed())
        }
        Commands::Cleanup => {
            let report = retention.cleanup().await?;
            info!(
                "Cleanup done: {} archived, {} deleted, {} failed",
                report.archived, report.deleted, report.failed
            );
            Ok(report.failed == 0)
        }
        Commands::Backup => {
            let path = retention.create_backup().await?;
            info!("Backup written to {}", path.display());
            Ok(true)
        }
        Commands::Daemon => {
            let api_port = cfg.automation.api_port;
            let control = Arc::new(Control::new(
                Arc::clone(&scheduler),
                CaptureStore::new(paths),
                env.config_path.clone(),
            ));

            // Scheduler loop (background, every 30s)
            let loop_handle = tokio::spawn(Arc::clone(&scheduler).run());

            // HTTP API server
            let app = router(ApiState { control });
            let bind_addr = format!("0.0.0.0:{api_port}");
            let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
            info!("HTTP API listening on {bind_addr}");

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            info!("Shutting down");
            scheduler.stop();
            loop_handle.abort();
            Ok(true)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
