use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use materials_geosearch::geocoder::MapboxGeocoder;
use materials_geosearch::migration::MigrationProgress;
use materials_geosearch::{
    init_tracing, server, AppConfig, Geocoder, MigrationOptions, MigrationRunner, ProductStore,
};

/// Location-aware product search backend for a construction materials
/// marketplace. Configuration is read from the environment (and `.env` in
/// development builds).
#[derive(Parser)]
#[command(name = "geosearch", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API on `BIND_ADDR`.
    Serve,

    /// Geocode every product that has no usable location.
    ///
    /// Safe to interrupt and re-run: products located by an earlier run are
    /// not selected again.
    Migrate {
        /// Geocode and report without writing locations.
        #[arg(long)]
        dry_run: bool,

        /// Products fetched per page (defaults to `MIGRATION_BATCH_SIZE`).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Pause between provider calls in milliseconds (defaults to `MIGRATION_DELAY_MS`).
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Write the failed products to this CSV file.
        #[arg(long)]
        failures_csv: Option<PathBuf>,
    },

    /// Geocode a single address and print the result as JSON.
    Geocode {
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Serve => server::run_server(&config).await?,
        Commands::Migrate {
            dry_run,
            batch_size,
            delay_ms,
            failures_csv,
        } => {
            let mut options = MigrationOptions::from_config(&config);
            options.dry_run = dry_run;
            if let Some(batch_size) = batch_size {
                options.batch_size = batch_size.max(1);
            }
            if let Some(delay_ms) = delay_ms {
                options.call_delay = Duration::from_millis(delay_ms);
            }
            migrate(&config, options, failures_csv).await?;
        }
        Commands::Geocode { address } => {
            let geocoder = require_geocoder(&config)?;
            let result = geocoder.geocode(&address).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn require_geocoder(config: &AppConfig) -> anyhow::Result<MapboxGeocoder> {
    match MapboxGeocoder::from_config(config)? {
        Some(geocoder) => Ok(geocoder),
        None => bail!("MAPBOX_ACCESS_TOKEN must be set to geocode addresses"),
    }
}

async fn migrate(
    config: &AppConfig,
    options: MigrationOptions,
    failures_csv: Option<PathBuf>,
) -> anyhow::Result<()> {
    let store = ProductStore::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path))?;
    let geocoder: Arc<dyn Geocoder> = Arc::new(require_geocoder(config)?);
    let runner = MigrationRunner::new(store, geocoder, options);

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "migration", "interrupt received; stopping after the current product");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let observer: Arc<dyn Fn(MigrationProgress) + Send + Sync> = Arc::new(|progress| {
        if progress.processed % 25 == 0 {
            info!(
                target: "migration",
                processed = progress.processed,
                of = progress.needing_geocode,
                succeeded = progress.succeeded,
                failed = progress.failed,
                "progress"
            );
        }
    });

    let summary = runner.run(Some(observer), Some(cancel)).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(path) = failures_csv {
        summary
            .write_failures_csv(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(target: "migration", path = %path.display(), count = summary.failures.len(), "failure report written");
    }
    if runner.options().dry_run {
        info!(target: "migration", "dry run: no locations were written");
    }
    Ok(())
}
