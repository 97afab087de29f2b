use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod normalize;
mod scheduler;
mod setup;
mod sheets;
mod show;
mod store;
mod sync;
mod types;
mod utils;

use config::{SyncConfig, DEFAULT_CONFIG_PATH};
use scheduler::{DailyTicks, LocalClock, Scheduler};
use sheets::GoogleSheetsClient;
use store::PriceStore;

#[derive(Parser)]
#[command(name = "price-sync")]
#[command(about = "Sync pricing and shipping tables from Google Sheets into SQLite")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daily scheduler until interrupted (default)
    Run,
    /// Run a single sync cycle and exit
    Sync,
    /// Interactively create or update the configuration file
    Setup,
    /// Print the synced tables and the last sync result
    Show {
        /// Write CSV instead of aligned tables
        #[arg(long, conflicts_with_all = ["item", "zone"])]
        csv: bool,
        /// Only print the price of this item
        #[arg(long, conflicts_with = "zone")]
        item: Option<String>,
        /// Only print the shipping cost for this zone
        #[arg(long)]
        zone: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        bail!(
            "no configuration at {}; run `price-sync setup` first",
            path.display()
        );
    }
    SyncConfig::load(path)
}

fn run_service(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let schedule = config.daily_schedule()?;
    let client = GoogleSheetsClient::new(&config.spreadsheet.credentials_path)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        warn!("Shutdown requested, stopping after the current cycle (Ctrl-C again to force)");
    })
    .context("failed to install Ctrl-C handler")?;

    let mut ticks = DailyTicks::new(schedule, LocalClock, shutdown);
    info!(
        "price-sync started, daily sync at {}, first at {} (database {})",
        schedule.at().format("%H:%M:%S"),
        ticks.next_due().format("%Y-%m-%d %H:%M:%S"),
        config.database.path.display()
    );

    let scheduler = Scheduler::new(LocalClock);
    scheduler.serve(&mut ticks, config.schedule.run_on_start, || {
        sync::run_sync(&config, &client)
    });
    Ok(())
}

fn run_once(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let client = GoogleSheetsClient::new(&config.spreadsheet.credentials_path)?;
    let report = sync::run_sync(&config, &client)?;
    info!(
        "Sync complete: {} pricing rows, {} shipping rows",
        report.pricing.summary.total(),
        report.shipping.summary.total()
    );
    Ok(())
}

fn run_show(
    config_path: &Path,
    csv: bool,
    item: Option<String>,
    zone: Option<String>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let store = PriceStore::open(&config.database)?;

    if let Some(item) = item {
        return match store.price(&item)? {
            Some(record) => show::write_price(io::stdout().lock(), &record),
            None => bail!("no price for item '{}'", item),
        };
    }
    if let Some(zone) = zone {
        return match store.shipping_cost(&zone)? {
            Some(record) => show::write_shipping_cost(io::stdout().lock(), &record),
            None => bail!("no shipping cost for zone '{}'", zone),
        };
    }

    let prices = store.prices()?;
    let shipping = store.shipping()?;

    let stdout = io::stdout();
    if csv {
        show::write_csv(stdout.lock(), &prices, &shipping)
    } else {
        let last_run = store.last_run()?;
        show::write_tables(stdout.lock(), &prices, &shipping, last_run.as_ref())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&cli.config),
        Commands::Sync => run_once(&cli.config),
        Commands::Setup => setup::run_setup(&cli.config),
        Commands::Show { csv, item, zone } => run_show(&cli.config, csv, item, zone),
    }
}
