use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rangelease::{Config, RangePlugin, Result, StoredLease};

#[derive(Parser)]
#[command(name = "rangelease")]
#[command(author, version, about = "DHCPv4 range allocator backed by Redis", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the allocator from the store and release expiring leases until Ctrl-C.
    Run,
    ShowConfig,
    /// Validate the configuration without connecting to the store.
    CheckConfig,
    ListLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting range allocator with config: {:?}", cli.config);
            let plugin = RangePlugin::setup(&config).await?;

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping...");
            plugin.shutdown().await;
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::CheckConfig => {
            config.validate()?;
            let uri = config.store_uri()?;
            println!(
                "Configuration OK: {} - {} ({} addresses), lease {}s, store {}",
                config.range_start,
                config.range_end,
                config.pool_size(),
                config.lease_duration_seconds,
                uri
            );
            Ok(())
        }
        Commands::ListLeases => {
            let uri = config.store_uri()?;
            let store = uri.backend.open(&uri, false).await?;
            let mut leases = store.get_all().await?;
            leases.sort_by_key(|lease| lease.record.ip);
            print_leases(&config, &leases, Utc::now());
            Ok(())
        }
    }
}

fn print_leases(config: &Config, leases: &[StoredLease], now: DateTime<Utc>) {
    println!(
        "{:<20} {:<16} {:<22} {:>9}  {}",
        "MAC", "Address", "Expires (UTC)", "Remaining", "Note"
    );
    for lease in leases {
        let record = &lease.record;
        let note = if !config.ip_in_range(record.ip) {
            "outside range"
        } else if record.is_expired_at(now) {
            "awaiting release"
        } else {
            ""
        };
        println!(
            "{:<20} {:<16} {:<22} {:>8}s  {}",
            lease.client_id,
            record.ip,
            record.expires.format("%Y-%m-%d %H:%M:%S"),
            record.remaining_seconds(now),
            note
        );
    }
    println!(
        "{} of {} addresses leased ({} - {})",
        leases.len(),
        config.pool_size(),
        config.range_start,
        config.range_end
    );
}
