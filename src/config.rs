use crate::scanner::ScannerConfig;
use crate::tokens::TokenSet;
use anyhow::{Context, Result, bail};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_RPC_URL: &str = "http://localhost:8545";
const DEFAULT_STORAGE_URL: &str = "http://localhost:8086";
const DEFAULT_PRICE_API_URL: &str = "https://min-api.cryptocompare.com/data/price?fsym=ETH";

#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub storage_url: String,
    pub influx_database: String,
    pub influx_username: String,
    pub influx_password: String,
    pub tokens: TokenSet,
    pub currencies: Vec<String>,
    pub price_api_url: String,
    pub price_interval: Duration,
    /// Cursor used when the store has no recorded block yet.
    pub start_block: u64,
    pub scan_step: u64,
    pub idle_interval: Duration,
    pub block_cache_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let json_rpc_urls = std::env::var("JSON_RPC_URLS")
            .or_else(|_| std::env::var("JSON_RPC_URL"))
            .map(|urls| split_list(&urls))
            .unwrap_or_else(|_| vec![DEFAULT_RPC_URL.to_string()]);

        let storage_url =
            std::env::var("STORAGE_URL").unwrap_or_else(|_| DEFAULT_STORAGE_URL.to_string());

        let tokens = match std::env::var("TOKENS") {
            Ok(list) => TokenSet::parse(&list).context("Invalid TOKENS")?,
            Err(_) => TokenSet::defaults()?,
        };

        let currencies = std::env::var("CURRENCIES")
            .map(|list| split_list(&list.to_uppercase()))
            .unwrap_or_else(|_| vec!["USD".to_string(), "EUR".to_string()]);

        let price_interval_secs = env_or("PRICE_INTERVAL_SECS", 60)?;
        let price_interval_secs = non_zero("PRICE_INTERVAL_SECS", price_interval_secs)?;

        Ok(Config {
            json_rpc_urls,
            storage_url,
            influx_database: env_or("INFLUX_DATABASE", "gastracker".to_string())?,
            influx_username: env_or("INFLUX_USERNAME", "gastracker".to_string())?,
            influx_password: env_or("INFLUX_PASSWORD", "gastracker".to_string())?,
            tokens,
            currencies,
            price_api_url: env_or("PRICE_API_URL", DEFAULT_PRICE_API_URL.to_string())?,
            price_interval: Duration::from_secs(price_interval_secs),
            start_block: env_or("START_BLOCK", 2_500_000)?,
            scan_step: env_or("SCAN_STEP", 5000)?,
            idle_interval: Duration::from_millis(env_or("IDLE_INTERVAL_MS", 2000)?),
            block_cache_size: env_or("BLOCK_CACHE_SIZE", 25)?,
        })
    }

    pub fn scanner(&self) -> ScannerConfig {
        ScannerConfig {
            step: self.scan_step,
            idle_interval: self.idle_interval,
            block_cache_size: self.block_cache_size,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn non_zero(key: &str, value: u64) -> Result<u64> {
    if value == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(value)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
