//! CLI entry point for the PFC supervisor.
//!
//! ```bash
//! pfc-supervisor run --config config/pfc.toml
//! pfc-supervisor run --host 10.0.0.5 --command-port 9000 --event-port 10000
//! pfc-supervisor check-config --config config/pfc.toml
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pfc_supervisor::config::SupervisorConfig;
use pfc_supervisor::{logging, Supervisor};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pfc-supervisor")]
#[command(
    about = "Filter-changer supervisor: status polling, state mirroring and attenuation recording",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the device and supervise it until Ctrl-C
    Run {
        /// Configuration file
        #[arg(long, default_value = "config/pfc.toml")]
        config: PathBuf,

        /// Device host, overriding the configuration
        #[arg(long)]
        host: Option<String>,

        /// Command stream port
        #[arg(long)]
        command_port: Option<u16>,

        /// Event stream port
        #[arg(long)]
        event_port: Option<u16>,

        /// Control endpoint `host:port` for process-variable writes
        #[arg(long)]
        control_address: Option<String>,
    },

    /// Load and validate a configuration, then print it
    CheckConfig {
        #[arg(long, default_value = "config/pfc.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            host,
            command_port,
            event_port,
            control_address,
        } => {
            let mut config = SupervisorConfig::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            if let Some(host) = host {
                config.device.host = host;
            }
            if let Some(port) = command_port {
                config.device.command_port = port;
            }
            if let Some(port) = event_port {
                config.device.event_port = port;
            }
            if let Some(address) = control_address {
                config.control.address = address;
            }
            config.validate()?;

            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
            tracing::info!(
                device = %config.device.name,
                host = %config.device.host,
                "Starting PFC supervisor"
            );

            Supervisor::new(&config)?.run().await?;
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let loaded = SupervisorConfig::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!("{} is valid", config.display());
            println!("{}", toml::to_string_pretty(&loaded)?);
            Ok(())
        }
    }
}
