use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fab_sim::{SimConfig, Simulation};

/// Bakery production facility simulation.
#[derive(Parser, Debug)]
#[command(name = "fab-sim", version, about)]
struct Cli {
    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the simulation and print a report.
    Run {
        /// Path to a TOML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the number of ticks.
        #[arg(long)]
        ticks: Option<u64>,

        /// Override the random seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Override the wall-clock delay between ticks.
        #[arg(long)]
        tick_interval_ms: Option<u64>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML.
    PrintConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Run {
            config,
            ticks,
            seed,
            tick_interval_ms,
            json,
        } => {
            let mut config = SimConfig::resolve(config.as_deref()).context("Failed to load config")?;
            if let Some(ticks) = ticks {
                config.simulation.ticks = ticks;
            }
            if seed.is_some() {
                config.simulation.seed = seed;
            }
            if let Some(ms) = tick_interval_ms {
                config.simulation.tick_interval_ms = ms;
            }

            tracing::info!(
                ticks = config.simulation.ticks,
                seed = ?config.simulation.seed,
                "Starting simulation"
            );
            let simulation = Simulation::build(config).context("Failed to build simulation")?;
            let report = simulation.run().await.context("Simulation aborted")?;

            if json {
                println!("{}", report.to_json().context("Failed to encode report")?);
            } else {
                print!("{}", report.render());
            }
        }
        Command::PrintConfig { config } => {
            let config = SimConfig::resolve(config.as_deref()).context("Failed to load config")?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
