use crate::block_cache::{BlockTimeCache, DEFAULT_BLOCK_CACHE_SIZE};
use crate::events::is_transfer;
use crate::models::TokenTransfer;
use crate::rpc::{ChainClient, ChainLog};
use crate::tokens::TokenSet;
use alloy_primitives::Address;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SCAN_STEP: u64 = 5000;
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(2);

/// Logs this close to the head are stamped with the local clock instead of
/// paying for a header lookup.
const HEAD_CONFIRMATION_TOLERANCE: u64 = 2;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Upper bound on blocks requested per log query (the window spans at most `step + 1`).
    pub step: u64,
    pub idle_interval: Duration,
    pub block_cache_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            step: DEFAULT_SCAN_STEP,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
        }
    }
}

/// Last block of the next window after `cursor`, or `None` when the chain has
/// not moved past it.
pub fn window_end(cursor: u64, head: u64, step: u64) -> Option<u64> {
    if head <= cursor {
        return None;
    }
    Some(head.min(cursor.saturating_add(step).saturating_add(1)))
}

pub struct ChainScanner<C: ChainClient + ?Sized> {
    client: Arc<C>,
    tokens: Arc<TokenSet>,
    addresses: Vec<Address>,
    config: ScannerConfig,
    cache: BlockTimeCache,
    cursor: Arc<AtomicU64>,
}

/// Control side of a running scanner.
pub struct ScannerHandle {
    cancel: CancellationToken,
    cursor: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ScannerHandle {
    /// Highest block fully processed so far.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Signals the worker and waits for it to exit. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Chain scanner task failed: {}", e);
            }
        }
    }
}

impl<C: ChainClient + ?Sized + 'static> ChainScanner<C> {
    pub fn new(client: Arc<C>, tokens: Arc<TokenSet>, config: ScannerConfig) -> Self {
        let addresses = tokens.addresses();
        let cache = BlockTimeCache::new(config.block_cache_size);
        ChainScanner {
            client,
            tokens,
            addresses,
            config,
            cache,
            cursor: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns the scanning worker. Batches are handed over through a
    /// single-slot channel, so scanning pauses until the consumer catches up.
    pub fn start(
        self,
        cursor: u64,
        cancel: CancellationToken,
    ) -> (ScannerHandle, mpsc::Receiver<Vec<TokenTransfer>>) {
        let (tx, rx) = mpsc::channel(1);
        self.cursor.store(cursor, Ordering::SeqCst);
        let handle_cursor = Arc::clone(&self.cursor);
        let task = tokio::spawn(self.run(cursor, tx, cancel.clone()));

        let handle = ScannerHandle {
            cancel,
            cursor: handle_cursor,
            task: Some(task),
        };
        (handle, rx)
    }

    async fn run(
        mut self,
        mut cursor: u64,
        batches: mpsc::Sender<Vec<TokenTransfer>>,
        cancel: CancellationToken,
    ) {
        info!(
            "Starting scan from block {} over {} token contract(s)",
            cursor,
            self.addresses.len()
        );

        while !cancel.is_cancelled() {
            let head = match self.client.head_block().await {
                Ok(head) => head,
                Err(e) => {
                    error!("Failed to get latest block: {:#}", e);
                    info!("Retrying in a moment...");
                    if !self.idle(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(to_block) = window_end(cursor, head, self.config.step) else {
                debug!("No new blocks (head {}), sleeping...", head);
                if !self.idle(&cancel).await {
                    break;
                }
                continue;
            };

            let transfers = match self.scan_window(cursor, to_block, head).await {
                Ok(transfers) => transfers,
                Err(e) => {
                    error!(
                        "Failed to retrieve logs for blocks {}-{}: {:#}",
                        cursor + 1,
                        to_block,
                        e
                    );
                    info!("Retrying in a moment...");
                    if !self.idle(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if !transfers.is_empty() {
                info!(
                    "Found {} token transfer(s) in blocks {}-{}",
                    transfers.len(),
                    cursor + 1,
                    to_block
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Shutdown requested while handing off transfers");
                        break;
                    }
                    sent = batches.send(transfers) => {
                        if sent.is_err() {
                            warn!("Transfer consumer is gone, stopping scanner");
                            break;
                        }
                    }
                }
            }

            cursor = to_block;
            self.cursor.store(cursor, Ordering::SeqCst);
            debug!("Updated last processed block to {}", cursor);

            if !self.idle(&cancel).await {
                break;
            }
        }

        info!("Chain scanner is closing...");
    }

    /// Returns `false` when shutdown was requested during the wait.
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(self.config.idle_interval) => true,
        }
    }

    /// Collects the transfers in `(cursor, to_block]`. Only the log query
    /// itself can fail; per-entry problems are logged and skipped.
    pub async fn scan_window(
        &mut self,
        cursor: u64,
        to_block: u64,
        head: u64,
    ) -> Result<Vec<TokenTransfer>> {
        let from = cursor + 1;
        debug!("Fetching logs for blocks {} to {}", from, to_block);
        let logs = self
            .client
            .filter_logs(from, to_block, &self.addresses)
            .await?;
        debug!(
            "Received {} logs for blocks {} to {}",
            logs.len(),
            from,
            to_block
        );

        Ok(self.handle_logs(logs, from, to_block, head).await)
    }

    async fn handle_logs(
        &mut self,
        logs: Vec<ChainLog>,
        from: u64,
        to_block: u64,
        head: u64,
    ) -> Vec<TokenTransfer> {
        let mut transfers = Vec::new();

        for log in logs {
            if !is_transfer(&log.topics) {
                continue;
            }
            if log.block_number < from || log.block_number > to_block {
                warn!(
                    "Ignoring log for block {} outside requested range {}-{}",
                    log.block_number, from, to_block
                );
                continue;
            }

            let tx = match self.client.transaction_by_hash(log.transaction_hash).await {
                Ok(Some(tx)) => tx,
                Ok(None) => {
                    warn!("Transaction {:?} not found", log.transaction_hash);
                    continue;
                }
                Err(e) => {
                    error!(
                        "Failed to retrieve transaction {:?}: {:#}",
                        log.transaction_hash, e
                    );
                    continue;
                }
            };

            let Some(to) = tx.to else {
                // contract creation
                continue;
            };
            let Some(token) = self.tokens.get(&to).cloned() else {
                info!(
                    "Irrelevant transaction for address {:?}: {:?}",
                    to, log.transaction_hash
                );
                continue;
            };

            let time = if head.saturating_sub(log.block_number) < HEAD_CONFIRMATION_TOLERANCE {
                Utc::now()
            } else {
                match self.block_time(log.block_number).await {
                    Ok(time) => time,
                    Err(e) => {
                        error!(
                            "Failed to retrieve time of block {}: {:#}",
                            log.block_number, e
                        );
                        continue;
                    }
                }
            };

            transfers.push(TokenTransfer {
                token,
                time,
                gas: tx.gas,
                gas_price: tx.gas_price,
                block: log.block_number,
                tx_hash: log.transaction_hash,
            });
        }

        transfers
    }

    async fn block_time(&mut self, block: u64) -> Result<DateTime<Utc>> {
        if let Some(time) = self.cache.get(block) {
            return Ok(time);
        }

        let secs = self.client.block_timestamp(block).await?;
        let time = DateTime::from_timestamp(i64::try_from(secs)?, 0)
            .ok_or_else(|| anyhow::anyhow!("Block {} has invalid timestamp {}", block, secs))?;
        self.cache.put(block, time);
        Ok(time)
    }

    pub fn cache(&self) -> &BlockTimeCache {
        &self.cache
    }
}
