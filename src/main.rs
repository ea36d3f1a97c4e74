//! warden - An orchestration daemon for scheduled jobs and supervised
//! services.
//!
//! Usage:
//!   warden run <config.yaml>       Run the daemon with the given config
//!   warden validate <config.yaml>  Validate a config without running

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use warden::{Config, Event, EventHandler, LocalRunner, MasterControlProgram};

/// warden - An orchestration daemon for jobs and services
#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Working directory for state and output (overrides config)
        #[arg(short = 'w', long)]
        working_dir: Option<PathBuf>,

        /// Seconds between state snapshots (overrides config)
        #[arg(long)]
        snapshot_interval: Option<u64>,
    },

    /// Validate a configuration file without running
    Validate {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

/// Logging event handler that prints lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobScheduled { job, run_time, .. } => {
                info!("Job '{}' scheduled for {}", job, run_time);
            }
            Event::RunStarted { job, run } => {
                info!("Job '{}' run started (run: {})", job, run);
            }
            Event::RunCompleted { job, run, success } => {
                if *success {
                    info!("Job '{}' run succeeded (run: {})", job, run);
                } else {
                    error!("Job '{}' run failed (run: {})", job, run);
                }
            }
            Event::ServiceStateChanged { service, state } => {
                info!("Service '{}' is now {}", service, state);
            }
            Event::InstanceStateChanged {
                service,
                instance,
                state,
            } => {
                info!("  Instance {}.{} is now {}", service, instance, state);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            working_dir,
            snapshot_interval,
        } => {
            run_daemon(config, working_dir, snapshot_interval).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
    }

    Ok(())
}

/// Load the config and run the daemon until interrupted.
async fn run_daemon(
    config_path: PathBuf,
    working_dir: Option<PathBuf>,
    snapshot_interval: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&config_path)?;

    let working_dir = working_dir
        .or_else(|| config.working_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&working_dir)?;

    let snapshot_interval = snapshot_interval.or(config.snapshot_interval_secs);

    let mut mcp = MasterControlProgram::new(&working_dir, Arc::new(LocalRunner::new()));
    if let Some(secs) = snapshot_interval {
        mcp = mcp.with_snapshot_interval(Duration::from_secs(secs));
    }
    config.apply(&mut mcp)?;

    mcp.events().register(Arc::new(LoggingHandler)).await;

    // A corrupt snapshot is not fatal; start cold and log it.
    if let Err(e) = mcp.try_restore() {
        warn!("Could not restore state snapshot: {}", e);
    }

    for service in mcp.services() {
        info!(
            "  - service {} (count: {}, state: {})",
            service.name(),
            service.count(),
            service.state()
        );
    }

    mcp.run_jobs();
    mcp.start_services();

    let (handle, task) = mcp.start();

    info!("warden running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    handle.shutdown().await?;
    task.await?;

    Ok(())
}

/// Validate a configuration file and report what it declares.
fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&config_path)?;
    println!(
        "OK: {} node(s), {} job(s), {} service(s)",
        config.nodes.len(),
        config.jobs.len(),
        config.services.len()
    );
    for job in &config.jobs {
        let enabled = if job.enabled { "" } else { " (disabled)" };
        println!("  job {} [{}]{}", job.name, job.schedule, enabled);
    }
    for service in &config.services {
        println!("  service {} x{}", service.name, service.count);
    }
    Ok(())
}
