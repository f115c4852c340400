//! CLI entry point for fleet-io.
//!
//! Two modes share one binary:
//!
//! - `fleet-io serve` runs the supervisor: load configuration, build
//!   the fleet, optionally auto-start it, then run until Ctrl+C.
//! - `fleet-io worker` runs the worker process the supervisor forks for each
//!   device. Driven entirely by the environment contract; never invoked by
//!   hand except when debugging a board in isolation.

use clap::{Parser, Subcommand};
use fleet_io::board::sim::sim_registry;
use fleet_io::bus::FsqBus;
use fleet_io::config::FleetSettings;
use fleet_io::error::FleetResult;
use fleet_io::fleet::Fleet;
use fleet_io::supervisor::ProcessLauncher;
use fleet_io::telemetry::{self, OutputFormat};
use fleet_io::worker::{WorkerEnv, WorkerRuntime};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleet-io")]
#[command(about = "Supervisory control plane for fleets of hardware workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor.
    Serve {
        /// Config file (without extension, resolved by the config loader).
        #[arg(long, default_value = "config/default")]
        config: String,

        /// Emit logs as JSON.
        #[arg(long)]
        json_logs: bool,
    },

    /// Run a device worker (forked by the supervisor).
    Worker,
}

#[tokio::main]
async fn main() -> FleetResult<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, json_logs } => serve(&config, json_logs).await,
        Commands::Worker => worker().await,
    }
}

async fn serve(config: &str, json_logs: bool) -> FleetResult<()> {
    let settings = FleetSettings::load(config)?;
    let format = if json_logs {
        OutputFormat::Json
    } else {
        OutputFormat::Pretty
    };
    telemetry::init(&settings, format)?;

    let bus = Arc::new(FsqBus::open(&settings.bus.dir)?);
    let mut launcher = ProcessLauncher::new();
    if let Some(program) = &settings.worker_program {
        launcher = launcher.with_program(program);
    }
    let fleet = Fleet::new(&settings, bus, Arc::new(launcher))?;

    if settings.auto_start {
        match fleet.start(None).await {
            Ok(report) => info!(
                started = report.started.len(),
                failed = report.failed.len(),
                "auto-start complete"
            ),
            Err(err) => error!(error = %err, "auto-start failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    fleet.stop().await?;
    Ok(())
}

async fn worker() -> FleetResult<()> {
    // Worker logs go to stderr in compact form; the supervisor owns pretty
    // output.
    telemetry::init_quietly(&FleetSettings::default(), OutputFormat::Compact);

    let env = match WorkerEnv::from_env() {
        Ok(env) => env,
        Err(err) => {
            error!(error = %err, "invalid worker environment");
            std::process::exit(1);
        }
    };
    let bus = Arc::new(FsqBus::open(&env.bus_dir)?);
    let runtime = WorkerRuntime::new(&env.device_id, bus, sim_registry());

    // An unrecoverable runtime fault terminates the worker after it has
    // signalled its supervisor; a hung unresponsive worker is worse than a
    // dead one.
    if let Err(err) = runtime.run(env.board_config.clone(), CancellationToken::new()).await {
        error!(device = %env.device_id, error = %err, "worker runtime failed");
        std::process::exit(1);
    }
    Ok(())
}
