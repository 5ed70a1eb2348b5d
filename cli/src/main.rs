//! Velostream CLI

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use common::{ConfigError, CoreConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod pipeline;
mod sim;

use pipeline::{run_live, run_replay, run_sim};

const EXIT_CONFIG: u8 = 2;
const EXIT_BROKER_AUTH: u8 = 3;
const EXIT_FATAL: u8 = 4;

#[derive(Parser)]
#[command(name = "velostream")]
#[command(about = "Velostream - low-latency event pipeline for event-driven trading")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON); defaults plus env switches when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Synthetic feed and broker
    Sim,
    /// Broker SDK callbacks
    Live,
    /// Re-drive recorded WAL market data
    Replay,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        #[arg(value_enum)]
        mode: Mode,
        /// Sim session length in seconds
        #[arg(long, default_value = "5")]
        duration_secs: u64,
        /// Sim feed RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Inspect or validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigCommands,
    },
    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        subcommand: DlqCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration after env overrides
    Preview,
    /// Validate and exit
    Validate,
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead letters persisted by the last run
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Run {
            mode,
            duration_secs,
            seed,
        } => {
            if let Err(e) = install_metrics(&config) {
                error!("metrics exporter failed: {e}");
                return ExitCode::from(EXIT_FATAL);
            }
            let result = match mode {
                Mode::Sim => run_sim(&config, Duration::from_secs(duration_secs), seed),
                Mode::Replay => run_replay(&config),
                Mode::Live => {
                    // Credentials are opaque to the core; their absence is an
                    // auth failure before anything starts
                    if std::env::var("BROKER_API_KEY").is_err()
                        || std::env::var("BROKER_API_SECRET").is_err()
                    {
                        error!("BROKER_API_KEY / BROKER_API_SECRET not set");
                        return ExitCode::from(EXIT_BROKER_AUTH);
                    }
                    run_live(&config).await
                }
            };
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("fatal: {e}");
                    ExitCode::from(EXIT_FATAL)
                }
            }
        }
        Commands::Config { subcommand } => match subcommand {
            ConfigCommands::Preview => match serde_json::to_string_pretty(&config) {
                Ok(rendered) => {
                    println!("{rendered}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("could not render config: {e}");
                    ExitCode::from(EXIT_FATAL)
                }
            },
            ConfigCommands::Validate => {
                info!("configuration valid");
                ExitCode::SUCCESS
            }
        },
        Commands::Dlq { subcommand } => match subcommand {
            DlqCommands::List => dlq_list(),
        },
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<CoreConfig, ConfigError> {
    match path {
        Some(path) => CoreConfig::load(path),
        None => CoreConfig::from_env(),
    }
}

fn install_metrics(config: &CoreConfig) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics_port, "metrics exporter listening");
    Ok(())
}

fn dlq_list() -> ExitCode {
    let path = pipeline::dlq_path();
    let entries: Vec<adapter::DeadLetter> = match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                error!("unreadable DLQ dump {}: {e}", path.display());
                return ExitCode::from(EXIT_FATAL);
            }
        },
        Err(_) => Vec::new(),
    };

    if entries.is_empty() {
        println!("dead-letter queue is empty");
        return ExitCode::SUCCESS;
    }
    println!("{:<10} {:<10} {:<20} {:<8} {:<12} {:<8}", "intent", "strategy", "reason", "side", "price", "qty");
    for entry in entries {
        let intent = entry.command.intent;
        println!(
            "{:<10} {:<10} {:<20} {:<8} {:<12} {:<8}",
            intent.intent_id,
            intent.strategy.to_string(),
            entry.reason.to_string(),
            intent.side.to_string(),
            intent.price.as_i64(),
            intent.qty.as_i64(),
        );
    }
    ExitCode::SUCCESS
}
