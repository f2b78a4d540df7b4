use btp_monitor::{merge_status, Links, MonitorConfig, MonitorService, Storage};

use clap::{Parser, Subcommand};
use log::{error, info};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "btp-monitor")]
#[command(version, about = "BTP Bridge Monitor - Tracks cross-chain link health")]
struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', env = "MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Generate default configuration file
    #[arg(long)]
    generate_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitoring service
    Monitor {
        /// Seconds between polling rounds (overrides config file)
        #[arg(long, env = "REFRESH_INTERVAL")]
        interval: Option<u64>,
    },
    /// Query all endpoints once and print pending counts
    Status,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    if args.generate_config {
        let path = PathBuf::from("btp-monitor.toml");
        match MonitorConfig::create_default_config_file(&path) {
            Ok(_) => {
                info!("Generated default configuration at {:?}", path);
                return;
            }
            Err(e) => {
                error!("Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match &args.config {
        Some(path) => match MonitorConfig::from_file(path) {
            Ok(cfg) => {
                info!("Loaded configuration from {:?}", path);
                cfg
            }
            Err(e) => {
                error!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No config file specified, using defaults");
            MonitorConfig::default()
        }
    };

    match args.command.unwrap_or(Command::Monitor { interval: None }) {
        Command::Monitor { interval } => run_monitor(config, interval).await,
        Command::Status => run_status(config).await,
    }
}

async fn run_monitor(mut config: MonitorConfig, interval: Option<u64>) {
    if let Some(interval) = interval {
        config.monitor.interval_secs = interval;
    }

    info!("=== BTP Bridge Monitor Starting ===");
    info!("Networks: {}", config.networks.len());
    for network in &config.networks {
        info!("  {} ({})", network.display_name(), network.address());
    }
    info!("Database: {:?}", config.database.path);
    info!("Interval: {}s", config.monitor.interval_secs);

    let mut service = match MonitorService::new(config) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to initialize monitor: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = service.start().await {
        error!("Failed to start monitor: {}", e);
        std::process::exit(1);
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    service.shutdown().await;
}

/// One strict polling round printing a pending-count table for every pair
/// of endpoints connected in both directions.
async fn run_status(config: MonitorConfig) {
    let storage = match Storage::in_memory() {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };
    let mut links = match Links::new(&config.networks, storage) {
        Ok(links) => links,
        Err(e) => {
            error!("Failed to initialize networks: {}", e);
            std::process::exit(1);
        }
    };

    let status = match links.query_status(true).await {
        Ok(status) => status,
        Err(e) => {
            error!("Status query failed: {}", e);
            std::process::exit(1);
        }
    };

    let updates: HashMap<(String, String), btp_monitor::LinkUpdate> = status
        .get_known_links()
        .into_iter()
        .map(|(src, dst)| {
            let update = status.get_link_update(&src, &dst);
            ((src, dst), update)
        })
        .collect();
    let mut merged: Vec<_> = merge_status(updates).into_iter().collect();
    merged.sort_by(|a, b| a.0.cmp(&b.0));

    println!("| {:^44} | {:^10} | {:^10} |", "Network", "FW Pending", "BW Pending");
    for ((src, dst), directions) in merged {
        // one row per pair routed in both directions
        let [Some(forward), Some(backward)] = directions else {
            continue;
        };
        println!(
            "| {:>20} -> {:<20} | {:>10} | {:>10} |",
            links.name_of(&src),
            links.name_of(&dst),
            pending_of(&forward),
            pending_of(&backward)
        );
    }
}

fn pending_of(update: &btp_monitor::LinkUpdate) -> u64 {
    let tx_seq = update.tx.and_then(|e| e.seq()).unwrap_or(0);
    let rx_seq = update.rx.and_then(|e| e.seq()).unwrap_or(0);
    tx_seq.saturating_sub(rx_seq)
}
