//! fleetd: the fleet control plane daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml --data-dir /var/lib/fleet
//! fleetd check-config --config /etc/fleet/fleet.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use fleet_core::{FleetConfig, format_duration};

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to fleet.toml; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        json_logs: bool,
    },

    /// Validate a config file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            json_logs,
        } => {
            init_tracing(json_logs);
            let mut config = match config {
                Some(path) => {
                    let loaded = FleetConfig::from_file(&path)?;
                    info!(path = ?path, "configuration loaded");
                    loaded
                }
                None => FleetConfig::default(),
            };
            if let Some(dir) = data_dir {
                config.daemon.data_dir = dir;
            }
            fleetd::run(config).await
        }
        Command::CheckConfig { config } => {
            let loaded = FleetConfig::from_file(&config)?;
            println!("{}", loaded.to_toml_string()?);
            println!(
                "# ok: rollout every {}, approval checked every {}",
                format_duration(loaded.rollout.poll_interval),
                format_duration(loaded.operations.approval_poll_interval)
            );
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "info,fleetd=debug,fleet_orchestrator=debug,fleet_rollout=debug",
        )
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
