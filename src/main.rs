/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file main.rs
 * @brief Operator command line for a HybridDB deployment
 */

use anyhow::Context;
use clap::{Parser, Subcommand};
use hybriddb::connection::redact_uri;
use hybriddb::shutdown::{ShutdownManager, ShutdownReason};
use hybriddb::{init_tracing_logger, Database, HybridConfig, LogLevel};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// HybridDB - primary/replica document database access layer
#[derive(Parser, Debug)]
#[command(name = "hybriddb")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (toml, yaml or json); HYBRIDDB_* variables otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Include level and source location in log lines
    #[arg(long, global = true)]
    detailed_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare every collection and resync the ones that drifted
    Sync {
        /// Seconds to wait for queued replication before exiting
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },

    /// Report store health and replication statistics
    Status,

    /// Validate the configuration and print it
    CheckConfig,

    /// Keep running drift checks until interrupted
    Watch {
        /// Seconds between checks; defaults to the configured drift interval
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<HybridConfig> {
    let config = match path {
        Some(path) => HybridConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => HybridConfig::from_env().context("reading HYBRIDDB_* environment")?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level: LogLevel = cli.log_level.parse()?;
    init_tracing_logger(level, cli.detailed_logs)?;

    let config = load_config(cli.config.as_ref()).await?;

    match cli.command {
        Command::CheckConfig => {
            let mut shown = config.clone();
            shown.primary_uri = shown.primary_uri.as_deref().map(redact_uri);
            shown.secondary_uri = redact_uri(&shown.secondary_uri);
            println!("{}", toml::to_string_pretty(&shown)?);
            println!("Configuration is valid");
        }
        Command::Status => {
            let database = Database::connect(config).await?;
            let report = database.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            database.shutdown().await?;
            std::process::exit(report.status.exit_code());
        }
        Command::Sync { wait_secs } => {
            let database = Database::connect(config).await?;
            let outcome = database.force_sync().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let Err(e) = database.wait_for_replication(Duration::from_secs(wait_secs)).await {
                warn!("Replication still pending: {}", e);
            }
            database.shutdown().await?;
        }
        Command::Watch { interval_secs } => {
            let interval = interval_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.drift_check_interval())
                .max(Duration::from_secs(1));
            let database = Database::connect(config).await?;
            let shutdown = ShutdownManager::new();
            let mut stop = shutdown.subscribe();
            shutdown.start_signal_handling();

            info!("Watching for drift every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = database.force_sync().await?;
                        if let Some(report) = outcome.report() {
                            info!("Drift pass resynced {} collections", report.resynced.len());
                        }
                    }
                    reason = stop.recv() => {
                        let reason = reason.unwrap_or(ShutdownReason::Request);
                        shutdown.initiate_shutdown(reason.clone());
                        info!("Stopping watch ({})", reason.as_str());
                        break;
                    }
                }
            }
            database.shutdown().await?;
        }
    }

    Ok(())
}
