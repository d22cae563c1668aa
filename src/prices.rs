//! Periodically refreshed ether quotes.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_PRICE_INTERVAL: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Price of one ether per currency code.
pub type Prices = BTreeMap<String, f64>;

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch(&self) -> Result<Prices>;
}

/// Quotes from an HTTP endpoint answering with a flat `{"USD": 2000.0, ...}`
/// object, such as CryptoCompare's `data/price?fsym=ETH&tsyms=USD,EUR`.
pub struct HttpQuoteSource {
    client: Client,
    url: String,
    currencies: Vec<String>,
}

impl HttpQuoteSource {
    pub fn new(base_url: &str, currencies: &[String]) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let separator = if base_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}tsyms={}", base_url, separator, currencies.join(","));
        Ok(Self {
            client,
            url,
            currencies: currencies.to_vec(),
        })
    }

    /// Keeps the configured currencies, matching keys case-insensitively.
    fn select(&self, quotes: HashMap<String, f64>) -> Prices {
        let quotes: HashMap<String, f64> = quotes
            .into_iter()
            .map(|(currency, price)| (currency.to_uppercase(), price))
            .collect();

        let mut prices = Prices::new();
        for currency in &self.currencies {
            match quotes.get(currency) {
                Some(price) if price.is_finite() => {
                    info!("New price for {}: {:.4}", currency, price);
                    prices.insert(currency.clone(), *price);
                }
                _ => warn!("No usable quote for {}", currency),
            }
        }
        prices
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch(&self) -> Result<Prices> {
        let quotes: HashMap<String, f64> = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Price request failed")?
            .error_for_status()
            .context("Price endpoint returned an error")?
            .json()
            .await
            .context("Invalid price response")?;
        Ok(self.select(quotes))
    }
}

/// Holds the latest quotes. Refreshes swap in a whole new map, so readers
/// always see one consistent snapshot.
pub struct PriceTracker {
    source: Box<dyn QuoteSource>,
    prices: ArcSwap<Prices>,
}

impl PriceTracker {
    pub fn new(source: Box<dyn QuoteSource>) -> Self {
        Self {
            source,
            prices: ArcSwap::from_pointee(Prices::new()),
        }
    }

    /// Price for `currency`, zero until the first successful fetch.
    pub fn get(&self, currency: &str) -> f64 {
        self.prices.load().get(currency).copied().unwrap_or(0.0)
    }

    pub fn get_all(&self) -> Arc<Prices> {
        self.prices.load_full()
    }

    pub fn install(&self, prices: Prices) {
        self.prices.store(Arc::new(prices));
    }

    /// Fetches fresh quotes. On failure the previous snapshot stays in place.
    pub async fn update(&self) -> bool {
        match self.source.fetch().await {
            Ok(prices) => {
                self.install(prices);
                true
            }
            Err(e) => {
                error!("Failed to fetch prices: {:#}", e);
                false
            }
        }
    }

    /// Refreshes every `period` until cancelled. The first refresh is left to
    /// the caller. A zero period falls back to [`DEFAULT_PRICE_INTERVAL`].
    pub fn spawn(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let period = if period.is_zero() {
            warn!(
                "Price refresh interval must be non-zero, using {:?}",
                DEFAULT_PRICE_INTERVAL
            );
            DEFAULT_PRICE_INTERVAL
        } else {
            period
        };
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.update().await;
                    }
                }
            }
            info!("Price tracker is closing...");
        })
    }
}

/// Fixed quotes, for tests and offline runs.
pub struct StaticQuotes(pub Prices);

#[async_trait]
impl QuoteSource for StaticQuotes {
    async fn fetch(&self) -> Result<Prices> {
        Ok(self.0.clone())
    }
}
