//! In-memory chain used by tests and local dry runs.

use crate::events::TRANSFER_TOPIC;
use crate::rpc::{ChainClient, ChainLog, ChainTransaction};
use alloy_primitives::{Address, B256};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Requests observed by [`MockChain`], in call order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub head_calls: usize,
    pub filter_ranges: Vec<(u64, u64)>,
    pub transaction_lookups: Vec<B256>,
    pub header_lookups: Vec<u64>,
}

#[derive(Default)]
struct State {
    head: u64,
    logs: Vec<ChainLog>,
    transactions: HashMap<B256, ChainTransaction>,
    timestamps: HashMap<u64, u64>,
    failing_head_calls: usize,
    failing_log_calls: usize,
    failing_headers: HashSet<u64>,
    failing_transactions: HashSet<B256>,
    next_hash: u64,
    calls: CallLog,
}

/// Scriptable [`ChainClient`]. Log queries honour the address filter but not
/// topics, like a node that cannot be trusted to filter by topic.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    pub fn set_timestamp(&self, block: u64, secs: u64) {
        self.state().timestamps.insert(block, secs);
    }

    pub fn add_log(&self, block: u64, address: Address, topics: Vec<B256>, hash: B256) {
        self.state().logs.push(ChainLog {
            address,
            topics,
            block_number: block,
            transaction_hash: hash,
        });
    }

    /// Adds a Transfer log emitted by `log_address` whose transaction was sent to `to`.
    pub fn add_transaction_log(
        &self,
        block: u64,
        log_address: Address,
        to: Option<Address>,
        gas: u64,
        gas_price: u128,
    ) -> B256 {
        let mut state = self.state();
        state.next_hash += 1;
        let hash = B256::left_padding_from(&state.next_hash.to_be_bytes());
        state.transactions.insert(
            hash,
            ChainTransaction {
                hash,
                to,
                gas,
                gas_price,
            },
        );
        state.logs.push(ChainLog {
            address: log_address,
            topics: vec![TRANSFER_TOPIC, B256::ZERO, B256::ZERO],
            block_number: block,
            transaction_hash: hash,
        });
        hash
    }

    pub fn add_transfer(&self, block: u64, token: Address, gas: u64, gas_price: u128) -> B256 {
        self.add_transaction_log(block, token, Some(token), gas, gas_price)
    }

    /// Fails the next `count` head queries.
    pub fn fail_head(&self, count: usize) {
        self.state().failing_head_calls = count;
    }

    /// Fails the next `count` log queries.
    pub fn fail_logs(&self, count: usize) {
        self.state().failing_log_calls = count;
    }

    pub fn fail_header(&self, block: u64) {
        self.state().failing_headers.insert(block);
    }

    pub fn fail_transaction(&self, hash: B256) {
        self.state().failing_transactions.insert(hash);
    }

    pub fn calls(&self) -> CallLog {
        self.state().calls.clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn head_block(&self) -> Result<u64> {
        let mut state = self.state();
        state.calls.head_calls += 1;
        if state.failing_head_calls > 0 {
            state.failing_head_calls -= 1;
            bail!("connection refused");
        }
        Ok(state.head)
    }

    async fn filter_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<ChainLog>> {
        let mut state = self.state();
        state.calls.filter_ranges.push((from, to));
        if state.failing_log_calls > 0 {
            state.failing_log_calls -= 1;
            bail!("query timeout exceeded");
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| log.block_number >= from && log.block_number <= to)
            .filter(|log| addresses.contains(&log.address))
            .cloned()
            .collect())
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<ChainTransaction>> {
        let mut state = self.state();
        state.calls.transaction_lookups.push(hash);
        if state.failing_transactions.contains(&hash) {
            bail!("transaction lookup failed");
        }
        Ok(state.transactions.get(&hash).cloned())
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64> {
        let mut state = self.state();
        state.calls.header_lookups.push(number);
        if state.failing_headers.contains(&number) {
            bail!("header not available");
        }
        state
            .timestamps
            .get(&number)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Block {} not found", number))
    }
}
