use anyhow::Result;
use clap::Parser;
use gas_tracker::config::Config;
use gas_tracker::coordinator::{GasTracker, TrackerSettings};
use gas_tracker::prices::HttpQuoteSource;
use gas_tracker::repository::open_sink;
use gas_tracker::rpc::RpcClient;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tracker")]
#[command(about = "Track gas fees paid for token transfers", long_about = None)]
struct Cli {
    /// Overrides JSON_RPC_URLS (may be repeated)
    #[arg(long = "rpc-url")]
    rpc_urls: Vec<String>,

    /// Overrides STORAGE_URL
    #[arg(long)]
    storage_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting gas tracker");

    let mut config = Config::from_env()?;
    if !cli.rpc_urls.is_empty() {
        config.json_rpc_urls = cli.rpc_urls;
    }
    if let Some(storage_url) = cli.storage_url {
        config.storage_url = storage_url;
    }
    info!("Configuration loaded");
    info!("Tracking {} token(s)", config.tokens.len());
    for token in config.tokens.iter() {
        info!("  {} at {:?}", token.name, token.address);
    }
    info!(
        "RPC URLs: {} endpoint(s) configured",
        config.json_rpc_urls.len()
    );

    let client = Arc::new(RpcClient::new(&config.json_rpc_urls)?);
    let sink = open_sink(&config)?;
    let quotes = HttpQuoteSource::new(&config.price_api_url, &config.currencies)?;

    let mut tracker = match GasTracker::start(
        TrackerSettings::from(&config),
        client,
        Arc::new(config.tokens.clone()),
        sink,
        Box::new(quotes),
    )
    .await
    {
        Ok(tracker) => tracker,
        Err(e) => {
            error!("Could not start gas tracker: {:#}", e);
            return Err(e);
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Closing down...");
    tracker.stop().await;

    Ok(())
}
