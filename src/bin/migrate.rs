use anyhow::Result;
use gas_tracker::config::Config;
use gas_tracker::repository::open_sink;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = Config::from_env()?;

    println!("Initializing storage at: {}", config.storage_url);

    let sink = open_sink(&config)?;
    sink.init().await?;
    sink.close().await?;

    println!("Storage initialized successfully!");

    Ok(())
}
