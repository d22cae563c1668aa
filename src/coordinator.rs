use crate::config::Config;
use crate::fees::FeeAttributor;
use crate::models::TokenTransfer;
use crate::prices::{DEFAULT_PRICE_INTERVAL, PriceTracker, QuoteSource};
use crate::repository::StorageSink;
use crate::rpc::ChainClient;
use crate::scanner::{ChainScanner, ScannerConfig, ScannerHandle};
use crate::tokens::TokenSet;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Cursor used when the store has nothing recorded.
    pub start_block: u64,
    /// Currencies every point carries, even before they are quoted.
    pub currencies: Vec<String>,
    pub price_interval: Duration,
    pub scanner: ScannerConfig,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            start_block: 0,
            currencies: Vec::new(),
            price_interval: DEFAULT_PRICE_INTERVAL,
            scanner: ScannerConfig::default(),
        }
    }
}

impl From<&Config> for TrackerSettings {
    fn from(config: &Config) -> Self {
        Self {
            start_block: config.start_block,
            currencies: config.currencies.clone(),
            price_interval: config.price_interval,
            scanner: config.scanner(),
        }
    }
}

/// Runs the price feed, the chain scanner and the dispatch loop that prices
/// scanned transfers and stores them.
pub struct GasTracker {
    prices: Arc<PriceTracker>,
    prices_cancel: CancellationToken,
    prices_task: Option<JoinHandle<()>>,
    scanner: ScannerHandle,
    dispatch_task: Option<JoinHandle<()>>,
    sink: Arc<dyn StorageSink>,
    stopped: bool,
}

impl GasTracker {
    /// Fails only when the store or the chain cannot be reached.
    pub async fn start<C>(
        settings: TrackerSettings,
        client: Arc<C>,
        tokens: Arc<TokenSet>,
        sink: Arc<dyn StorageSink>,
        quotes: Box<dyn QuoteSource>,
    ) -> Result<Self>
    where
        C: ChainClient + ?Sized + 'static,
    {
        sink.init().await.context("Could not initialize storage")?;

        let head = client
            .head_block()
            .await
            .context("Could not reach chain client")?;
        info!("Connected to chain, latest block {}", head);

        let cursor = resolve_start_block(sink.as_ref(), settings.start_block).await;

        let prices = Arc::new(PriceTracker::new(quotes));
        prices.update().await;
        let prices_cancel = CancellationToken::new();
        let prices_task = prices.spawn(settings.price_interval, prices_cancel.clone());

        let (scanner, batches) = ChainScanner::new(client, tokens, settings.scanner)
            .start(cursor, CancellationToken::new());

        let dispatch_task = tokio::spawn(dispatch(
            batches,
            FeeAttributor::new(&settings.currencies),
            Arc::clone(&prices),
            Arc::clone(&sink),
        ));

        Ok(GasTracker {
            prices,
            prices_cancel,
            prices_task: Some(prices_task),
            scanner,
            dispatch_task: Some(dispatch_task),
            sink,
            stopped: false,
        })
    }

    pub fn cursor(&self) -> u64 {
        self.scanner.cursor()
    }

    pub fn prices(&self) -> &Arc<PriceTracker> {
        &self.prices
    }

    /// Stops the price feed, then the scanner, lets the dispatch loop drain
    /// whatever was already handed over, and closes the store.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Gas tracker is closing...");

        self.prices_cancel.cancel();
        if let Some(task) = self.prices_task.take() {
            if let Err(e) = task.await {
                error!("Price tracker task failed: {}", e);
            }
        }

        self.scanner.stop().await;

        if let Some(task) = self.dispatch_task.take() {
            if let Err(e) = task.await {
                error!("Dispatch task failed: {}", e);
            }
        }

        if let Err(e) = self.sink.close().await {
            error!("Failed to close storage: {:#}", e);
        }
    }
}

/// The store's last block, or `default` when it has none or cannot answer.
pub async fn resolve_start_block(sink: &dyn StorageSink, default: u64) -> u64 {
    match sink.last_recorded_block().await {
        Ok(Some(block)) if block > 0 => {
            info!("Latest block in store: {}", block);
            block
        }
        Ok(_) => {
            info!("No recorded blocks, starting after block {}", default);
            default
        }
        Err(e) => {
            warn!("Failed to retrieve last block number: {:#}", e);
            default
        }
    }
}

async fn dispatch(
    mut batches: mpsc::Receiver<Vec<TokenTransfer>>,
    attributor: FeeAttributor,
    prices: Arc<PriceTracker>,
    sink: Arc<dyn StorageSink>,
) {
    while let Some(transfers) = batches.recv().await {
        let snapshot = prices.get_all();
        let points = attributor.attribute(&transfers, &snapshot);
        if points.is_empty() {
            continue;
        }

        match sink.write_batch(&points).await {
            Ok(written) => info!(
                "Stored {} points for {} transfers",
                written,
                transfers.len()
            ),
            Err(e) => error!("Failed to store {} points: {:#}", points.len(), e),
        }
    }

    info!("Dispatch loop finished");
}
