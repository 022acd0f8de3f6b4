mod commands;
mod config;
mod dataset;
mod openfoodfacts;
mod server;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::commands::{cmd_classify, cmd_history, cmd_lookup, cmd_stats, cmd_sync};
use crate::config::Config;
use crate::dataset::HttpDatasetSource;
use crate::openfoodfacts::OpenFoodFactsClient;
use foodscan_core::service::{CatalogService, ProductLookupProvider};
use foodscan_core::sync::{
    DEFAULT_MAX_SKIP_RATIO, DEFAULT_SYNC_BATCH_SIZE, DatasetSource, SyncOptions,
};

#[derive(Parser)]
#[command(
    name = "foodscan",
    version,
    about = "Offline barcode catalog with palm oil detection"
)]
struct Cli {
    /// Base URL of the published dataset (serves version.json and products.jsonl.gz)
    #[arg(long, global = true, env = "FOODSCAN_DATA_URL")]
    data_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the latest dataset if it is newer than the local catalog
    Sync {
        /// Re-import even if the local catalog is current
        #[arg(long)]
        force: bool,
        /// Records committed per batch
        #[arg(long, default_value_t = DEFAULT_SYNC_BATCH_SIZE)]
        batch_size: usize,
        /// Share of undecodable lines tolerated before the dataset is rejected
        #[arg(long, default_value_t = DEFAULT_MAX_SKIP_RATIO, value_parser = parse_ratio)]
        max_skip_ratio: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Look up a product by barcode (local catalog, then `OpenFoodFacts`)
    Lookup {
        /// Barcode number
        code: String,
        /// Never query `OpenFoodFacts`
        #[arg(long)]
        offline: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check an ingredient list for palm oil
    Classify {
        /// Ingredient text
        #[arg(required = true)]
        text: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show catalog size and dataset version
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent scans
    History {
        /// Number of scans to show
        #[arg(short, long, default_value = "20", value_parser = clap::value_parser!(i64).range(1..=1000))]
        limit: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
        /// Never query `OpenFoodFacts` for unknown barcodes
        #[arg(long)]
        offline: bool,
    },
}

fn parse_ratio(s: &str) -> Result<f64, String> {
    let ratio: f64 = s.parse().map_err(|e| format!("invalid ratio '{s}': {e}"))?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("ratio must be between 0 and 1, got {ratio}"))
    }
}

/// Logs go to stderr. The server logs at info by default; one-shot commands
/// only surface warnings unless `RUST_LOG` says otherwise.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "foodscan=info,foodscan_core=info"
    } else {
        "foodscan=warn,foodscan_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Commands::Serve { .. }));

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.data_url)?;

    let options = match &cli.command {
        Commands::Sync {
            force,
            batch_size,
            max_skip_ratio,
            ..
        } => {
            if *batch_size == 0 {
                bail!("--batch-size must be at least 1");
            }
            SyncOptions {
                batch_size: *batch_size,
                max_skip_ratio: *max_skip_ratio,
                force: *force,
            }
        }
        _ => SyncOptions::default(),
    };
    let svc = Arc::new(CatalogService::open(&config.db_path, options)?);

    match cli.command {
        Commands::Sync { json, .. } => cmd_sync(svc, config.data_url.as_deref(), json).await,
        Commands::Lookup {
            code,
            offline,
            json,
        } => cmd_lookup(svc, &code, offline, json).await,
        Commands::Classify { text, json } => cmd_classify(&svc, &text.join(" "), json),
        Commands::Stats { json } => cmd_stats(&svc, json),
        Commands::History { limit, json } => cmd_history(&svc, limit, json),
        Commands::Serve {
            port,
            bind,
            no_auth,
            offline,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            let off: Option<Arc<dyn ProductLookupProvider>> = if offline {
                None
            } else {
                Some(Arc::new(OpenFoodFactsClient::new()?))
            };
            let dataset: Option<Arc<dyn DatasetSource>> = match config.data_url.as_deref() {
                Some(url) => Some(Arc::new(HttpDatasetSource::new(
                    url,
                    tokio::runtime::Handle::current(),
                )?)),
                None => None,
            };
            server::start_server(svc, off, dataset, port, &bind, api_key).await
        }
    }
}
