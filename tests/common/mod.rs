#![allow(dead_code)]

use alloy_primitives::Address;
use anyhow::{Result, bail};
use async_trait::async_trait;
use gas_tracker::models::PricedPoint;
use gas_tracker::repository::StorageSink;
use gas_tracker::tokens::{Token, TokenSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn rep_address() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn dao_address() -> Address {
    Address::repeat_byte(0xbb)
}

pub fn tokens() -> Arc<TokenSet> {
    Arc::new(
        TokenSet::new(vec![
            Token::new("REP", rep_address()),
            Token::new("TheDAO", dao_address()),
        ])
        .unwrap(),
    )
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Keeps written points in memory and can be told to misbehave.
#[derive(Default)]
pub struct RecordingSink {
    pub points: Mutex<Vec<PricedPoint>>,
    pub last_block: Mutex<Option<u64>>,
    pub fail_init: AtomicBool,
    pub fail_last_block: AtomicBool,
    pub failing_writes: AtomicUsize,
    pub closed: AtomicBool,
}

impl RecordingSink {
    pub fn points(&self) -> Vec<PricedPoint> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn init(&self) -> Result<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }

    async fn write_batch(&self, points: &[PricedPoint]) -> Result<usize> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("write timed out");
        }
        self.points.lock().unwrap().extend_from_slice(points);
        Ok(points.len())
    }

    async fn last_recorded_block(&self) -> Result<Option<u64>> {
        if self.fail_last_block.load(Ordering::SeqCst) {
            bail!("query failed");
        }
        Ok(*self.last_block.lock().unwrap())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
