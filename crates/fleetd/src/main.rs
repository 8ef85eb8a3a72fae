//! fleetd: the fleetgrid daemon.
//!
//! One process is one orchestrator replica. Replicas sharing a Redis store
//! and bus elect a leader through a lease; the leader reconciles, the
//! others keep their registries current and take over when it goes away.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetgrid/fleet.toml --replica-id fleetd-0
//! fleetd check-config --config /etc/fleetgrid/fleet.toml
//! ```

mod run;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fleet_core::config::FleetConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid game-server fleet orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a replica until interrupted.
    Run {
        /// Path to the fleet configuration (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Identity of this replica in the lease and on the bus.
        /// Defaults to `$HOSTNAME`, which is the pod name in a cluster.
        #[arg(long)]
        replica_id: Option<String>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print the templates it declares.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            replica_id,
            log_json,
        } => {
            init_tracing(log_json);
            let replica_id = replica_id.unwrap_or_else(default_replica_id);
            run::run(&config, replica_id).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn default_replica_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("fleetd-{}", std::process::id()))
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)?;
    println!("configuration ok: {}", path.display());
    println!("  namespace: {}", config.cluster_namespace);
    println!("  store:     {}", config.store_endpoint);
    println!("  bus:       {}", config.event_bus_endpoint);
    for t in &config.fleet_templates {
        println!(
            "  template {}: image={} min={} max={} maxLoad={}",
            t.id,
            t.image,
            t.min_ready,
            t.max_instances,
            t.max_load.map_or_else(|| "-".to_string(), |l| l.to_string()),
        );
    }
    println!("{}", serde_json::to_string_pretty(&config.policy)?);
    Ok(())
}
