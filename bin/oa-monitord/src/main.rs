//! ---
//! oa_section: "01-core-functionality"
//! oa_subsection: "binary"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Binary entrypoint for the OA redundancy monitor daemon."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use oa_common::{init_tracing, new_registry, render, AppConfig, SharedRegistry};
use oa_redundancy::{RedundancyCoordinator, RedundancyMetrics, RedundancySettings};
use oa_session::SimulatedEnclosure;
use tokio::signal;
use tracing::{info, warn};

mod simulation;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Onboard Administrator redundancy monitor",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Discover the controllers and keep monitoring them")]
    Run {
        #[arg(
            long,
            value_name = "SECONDS",
            help = "Stop after this many seconds instead of waiting for ctrl-c"
        )]
        duration: Option<u64>,
    },
    #[command(about = "Discover once and print the controller snapshots as JSON")]
    Discover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("oa-monitord {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/oa-monitord.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("oa-monitord", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let enclosure = simulation::build_enclosure(&config)?;
    let registry = config.metrics.enabled.then(new_registry);
    let coordinator = Arc::new(build_coordinator(&config, &enclosure, registry.clone())?);

    let outcome = match cli.command.unwrap_or(Commands::Run { duration: None }) {
        Commands::Run { duration } => {
            run(&config, &enclosure, Arc::clone(&coordinator), duration).await
        }
        Commands::Discover => discover_once(&config, Arc::clone(&coordinator)).await,
    };

    let report = tokio::task::spawn_blocking({
        let coordinator = Arc::clone(&coordinator);
        move || coordinator.shutdown()
    })
    .await?;
    if report.is_clean() {
        info!(joined = ?report.joined, sessions_closed = report.sessions_closed, "monitor stopped");
    } else {
        warn!(?report, "monitor stopped with defects");
    }

    if config.metrics.dump_on_exit {
        if let Some(registry) = &registry {
            print!("{}", render(registry)?);
        }
    }
    outcome
}

fn build_coordinator(
    config: &AppConfig,
    enclosure: &SimulatedEnclosure,
    registry: Option<SharedRegistry>,
) -> Result<RedundancyCoordinator> {
    let provider = Arc::new(enclosure.clone());
    let settings = RedundancySettings::from_config(config);
    match registry {
        Some(registry) => {
            let metrics = RedundancyMetrics::new(registry)?;
            Ok(RedundancyCoordinator::with_metrics(provider, settings, metrics))
        }
        None => {
            info!("metrics disabled by configuration");
            Ok(RedundancyCoordinator::new(provider, settings))
        }
    }
}

async fn discover(config: &AppConfig, coordinator: Arc<RedundancyCoordinator>) -> Result<()> {
    let enclosure = &config.enclosure;
    info!(
        active = %enclosure.active_oa,
        standby = %enclosure.standby_oa,
        "discovering controllers"
    );
    let preferred = enclosure.active_oa.clone();
    let secondary = enclosure.standby_oa.clone();
    tokio::task::spawn_blocking(move || coordinator.discover(&preferred, &secondary))
        .await?
        .context("controller discovery failed")
}

async fn run(
    config: &AppConfig,
    enclosure: &SimulatedEnclosure,
    coordinator: Arc<RedundancyCoordinator>,
    duration: Option<u64>,
) -> Result<()> {
    discover(config, Arc::clone(&coordinator)).await?;
    info!(
        active_bay = ?coordinator.active_bay(),
        firmware = coordinator.active_firmware_version(),
        "monitoring controllers"
    );

    if let Some(after) = config.simulation.switchover_after {
        let enclosure = enclosure.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            info!("simulated switchover");
            enclosure.switch_over();
        });
    }

    match duration {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                    info!(seconds, "run duration elapsed; shutting down");
                }
                result = signal::ctrl_c() => {
                    result?;
                    info!("ctrl-c received; shutting down");
                }
            }
        }
        None => {
            signal::ctrl_c().await?;
            info!("ctrl-c received; shutting down");
        }
    }

    for event in coordinator.failover_history() {
        info!(
            bay = event.bay,
            address = %event.address,
            previous_bay = ?event.previous_bay,
            reason = ?event.reason,
            at = %event.triggered_at,
            "failover history"
        );
    }
    Ok(())
}

async fn discover_once(config: &AppConfig, coordinator: Arc<RedundancyCoordinator>) -> Result<()> {
    discover(config, Arc::clone(&coordinator)).await?;
    let snapshots = coordinator.controllers();
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}
