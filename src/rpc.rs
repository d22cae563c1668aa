use alloy::consensus::Transaction as _;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use alloy_primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120); // 2 minutes timeout per request

/// The parts of a log entry the scanner needs.
#[derive(Debug, Clone)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub block_number: u64,
    pub transaction_hash: B256,
}

/// The parts of a transaction the scanner needs.
#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub hash: B256,
    /// `None` for contract creations.
    pub to: Option<Address>,
    pub gas: u64,
    pub gas_price: u128,
}

/// Read-only view of the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn head_block(&self) -> Result<u64>;

    /// Logs emitted by `addresses` in the inclusive range `from..=to`.
    async fn filter_logs(&self, from: u64, to: u64, addresses: &[Address])
    -> Result<Vec<ChainLog>>;

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<ChainTransaction>>;

    /// Unix timestamp (seconds) of the block header.
    async fn block_timestamp(&self, number: u64) -> Result<u64>;
}

#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<DynProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            providers.push(ProviderBuilder::new().connect_http(parsed_url).erased());
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn get_provider(&self) -> &DynProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    fn rotate_provider(&self) {
        if self.providers.len() < 2 {
            return;
        }
        let next = (self.current_provider.load(Ordering::Relaxed) + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        debug!("Rotating to RPC provider #{}", next);
    }

    /// Runs one request against the current provider, bounded by
    /// `REQUEST_TIMEOUT`. Failures rotate to the next configured endpoint so the
    /// caller's retry lands elsewhere.
    async fn request<T, E, F>(&self, what: &str, future: F) -> Result<T>
    where
        E: std::fmt::Display,
        F: IntoFuture<Output = Result<T, E>>,
    {
        match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("RPC error on {} ({}): {}", self.get_current_url(), what, e);
                self.rotate_provider();
                Err(anyhow::anyhow!("{} failed: {}", what, e))
            }
            Err(_) => {
                warn!(
                    "Request timeout after {} seconds on {} ({})",
                    REQUEST_TIMEOUT.as_secs(),
                    self.get_current_url(),
                    what
                );
                self.rotate_provider();
                Err(anyhow::anyhow!(
                    "{} timed out after {} seconds",
                    what,
                    REQUEST_TIMEOUT.as_secs()
                ))
            }
        }
    }

    async fn fetch_logs(&self, from: u64, to: u64, addresses: &[Address]) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(addresses.to_vec())
            .from_block(from)
            .to_block(to);
        let provider = self.get_provider();
        self.request("eth_getLogs", provider.get_logs(&filter))
            .await
    }

    /// Some providers cap the result size and answer with a narrower range to
    /// retry; extract it.
    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    pub async fn get_logs(&self, from: u64, to: u64, addresses: &[Address]) -> Result<Vec<Log>> {
        let mut all_logs = Vec::new();
        let mut current_from = from;

        while current_from <= to {
            match self.fetch_logs(current_from, to, addresses).await {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(e) => match Self::parse_max_results_error(&e.to_string()) {
                    Some((suggested_from, suggested_to))
                        if suggested_from == current_from && suggested_to < to =>
                    {
                        info!(
                            "Hit max results limit for blocks {}-{}, splitting at block {}",
                            current_from, to, suggested_to
                        );
                        let logs = self
                            .fetch_logs(suggested_from, suggested_to, addresses)
                            .await?;
                        all_logs.extend(logs);
                        current_from = suggested_to + 1;
                    }
                    _ => return Err(e),
                },
            }
        }

        Ok(all_logs)
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn head_block(&self) -> Result<u64> {
        let provider = self.get_provider();
        self.request("eth_blockNumber", provider.get_block_number())
            .await
    }

    async fn filter_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<ChainLog>> {
        let logs = self.get_logs(from, to, addresses).await?;
        let mut converted = Vec::with_capacity(logs.len());
        for log in logs {
            let (Some(block_number), Some(transaction_hash)) =
                (log.block_number, log.transaction_hash)
            else {
                debug!("Skipping pending log without block or transaction hash");
                continue;
            };
            converted.push(ChainLog {
                address: log.address(),
                topics: log.topics().to_vec(),
                block_number,
                transaction_hash,
            });
        }
        Ok(converted)
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<ChainTransaction>> {
        let provider = self.get_provider();
        let tx = self
            .request(
                "eth_getTransactionByHash",
                provider.get_transaction_by_hash(hash),
            )
            .await?;

        Ok(tx.map(|tx| {
            let gas_price = tx
                .effective_gas_price
                .or_else(|| tx.gas_price())
                .unwrap_or_else(|| tx.max_fee_per_gas());
            ChainTransaction {
                hash,
                to: tx.to(),
                gas: tx.gas_limit(),
                gas_price,
            }
        }))
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64> {
        let provider = self.get_provider();
        let block = self
            .request(
                "eth_getBlockByNumber",
                provider.get_block_by_number(BlockNumberOrTag::Number(number)),
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("Block {} not found", number))?;
        Ok(block.header.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_max_results_error() {
        let msg = "query exceeds max results 20000, retry with the range 100-250";
        assert_eq!(RpcClient::parse_max_results_error(msg), Some((100, 250)));
        assert_eq!(RpcClient::parse_max_results_error("connection reset"), None);
    }

    #[test]
    fn test_new_requires_urls() {
        assert!(RpcClient::new(&[]).is_err());
        assert!(RpcClient::new(&["not a url".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_rotation_wraps_around() {
        let client = RpcClient::new(&[
            "http://localhost:8545".to_string(),
            "http://localhost:8546".to_string(),
        ])
        .unwrap();

        assert_eq!(client.get_current_url(), "http://localhost:8545");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://localhost:8546");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://localhost:8545");
    }
}
