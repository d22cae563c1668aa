mod common;

use alloy_primitives::B256;
use chrono::DateTime;
use common::{RecordingSink, dao_address, rep_address, tokens, wait_until};
use gas_tracker::coordinator::{GasTracker, TrackerSettings, resolve_start_block};
use gas_tracker::mock::MockChain;
use gas_tracker::models::{PointKind, PricedPoint};
use gas_tracker::prices::{Prices, StaticQuotes};
use gas_tracker::repository::{SqliteSink, StorageSink};
use gas_tracker::scanner::ScannerConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn settings(start_block: u64, step: u64) -> TrackerSettings {
    TrackerSettings {
        start_block,
        currencies: vec!["USD".to_string(), "EUR".to_string()],
        price_interval: Duration::from_secs(60),
        scanner: ScannerConfig {
            step,
            idle_interval: Duration::from_millis(5),
            block_cache_size: 25,
        },
    }
}

fn quotes() -> Box<StaticQuotes> {
    Box::new(StaticQuotes(Prices::from([
        ("USD".to_string(), 2000.0),
        ("EUR".to_string(), 1800.0),
    ])))
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

async fn start(
    settings: TrackerSettings,
    chain: &Arc<MockChain>,
    sink: Arc<dyn StorageSink>,
) -> anyhow::Result<GasTracker> {
    GasTracker::start(settings, Arc::clone(chain), tokens(), sink, quotes())
        .await
}

#[tokio::test]
async fn test_transfers_are_priced_and_stored() {
    let chain = Arc::new(MockChain::default());
    chain.set_head(1000);
    chain.set_timestamp(990, 1_476_000_000);
    chain.add_transfer(990, rep_address(), 50_000, 20_000_000_000);
    chain.add_transfer(999, dao_address(), 21_000, 10_000_000_000);

    let sink = Arc::new(RecordingSink::default());
    let mut tracker = start(settings(900, 5000), &chain, sink.clone())
        .await
        .unwrap();

    wait_until(|| sink.points().len() == 4).await;
    assert_eq!(tracker.prices().get("USD"), 2000.0);
    tracker.stop().await;

    let points = sink.points();
    let rep = &points[0];
    assert_eq!(rep.token, "REP");
    assert_eq!(rep.kind, PointKind::Token);
    assert_eq!(rep.block, 990);
    assert_eq!(rep.time, DateTime::from_timestamp(1_476_000_000, 0).unwrap());
    assert!(close(rep.fees["ETH"], 0.001));
    assert!(close(rep.fees["USD"], 2.0));
    assert!(close(rep.fees["EUR"], 1.8));

    let reference = &points[1];
    assert_eq!(reference.token, "ETH");
    assert_eq!(reference.kind, PointKind::Reference);
    assert_eq!(reference.gas, 21_000);
    assert_eq!(reference.tx_hash, rep.tx_hash);
    assert!(close(reference.fees["ETH"], 0.00042));
    assert!(close(reference.fees["USD"], 0.84));

    assert_eq!(points[2].token, "TheDAO");
    assert_eq!(points[3].kind, PointKind::Reference);
    assert_ne!(points[2].tx_hash, rep.tx_hash);
    assert_eq!(tracker.cursor(), 1000);

    // Block 999 was within two blocks of the head, so no header was fetched.
    assert_eq!(chain.calls().header_lookups, vec![990]);
    assert!(sink.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_price_change_applies_to_later_batches() {
    let chain = Arc::new(MockChain::default());
    chain.set_head(10);
    chain.set_timestamp(5, 100);
    chain.set_timestamp(25, 200);
    chain.add_transfer(5, rep_address(), 21_000, 1_000_000_000);
    chain.add_transfer(25, rep_address(), 21_000, 1_000_000_000);

    let sink = Arc::new(RecordingSink::default());
    let mut tracker = start(settings(0, 9), &chain, sink.clone()).await.unwrap();
    wait_until(|| sink.points().len() == 2).await;

    let earlier = sink.points();
    let updated = Prices::from([("USD".to_string(), 4000.0)]);
    tracker.prices().install(updated);
    chain.set_head(30);
    wait_until(|| sink.points().len() == 4).await;
    tracker.stop().await;

    let points = sink.points();
    assert_eq!(&points[..2], &earlier[..]);
    assert!(close(points[0].fees["USD"], 0.042));
    assert!(close(points[0].fees["EUR"], 0.0378));

    let later = &points[2];
    assert_eq!(later.block, 25);
    assert!(close(later.fees["USD"], 0.084));
    assert_eq!(later.fees["EUR"], 0.0);
}

#[tokio::test]
async fn test_unquoted_currencies_are_written_as_zero() {
    let chain = Arc::new(MockChain::default());
    chain.set_head(3);
    chain.add_transfer(3, rep_address(), 21_000, 1_000_000_000);

    let sink = Arc::new(RecordingSink::default());
    let no_quotes = Box::new(StaticQuotes(Prices::new()));
    let mut tracker = GasTracker::start(
        settings(0, 5000),
        Arc::clone(&chain),
        tokens(),
        sink.clone(),
        no_quotes,
    )
    .await
    .unwrap();

    wait_until(|| sink.points().len() == 2).await;
    tracker.stop().await;

    for point in sink.points() {
        let currencies: Vec<_> = point.fees.keys().cloned().collect();
        assert_eq!(currencies, vec!["ETH", "EUR", "USD"]);
        assert_eq!(point.fees["USD"], 0.0);
    }
}

#[tokio::test]
async fn test_resumes_after_recorded_block() {
    let sink = Arc::new(SqliteSink::open("sqlite::memory:").unwrap());
    sink.init().await.unwrap();
    let recorded = PricedPoint {
        time: DateTime::from_timestamp(1_476_000_000, 0).unwrap(),
        token: "REP".to_string(),
        kind: PointKind::Token,
        gas: 50_000,
        fees: BTreeMap::from([("ETH".to_string(), 0.001)]),
        block: 500,
        tx_hash: B256::repeat_byte(0x05),
    };
    sink.write_batch(&[recorded]).await.unwrap();

    let chain = Arc::new(MockChain::default());
    chain.set_head(600);
    chain.add_transfer(600, rep_address(), 50_000, 1_000_000_000);

    let mut tracker = start(settings(0, 5000), &chain, sink.clone())
        .await
        .unwrap();
    wait_until(|| tracker.cursor() == 600).await;
    tracker.stop().await;

    assert_eq!(chain.calls().filter_ranges[0], (501, 600));
    assert_eq!(sink.last_recorded_block().await.unwrap(), Some(600));
}

#[tokio::test]
async fn test_store_failure_is_fatal() {
    let chain = Arc::new(MockChain::default());
    let sink = Arc::new(RecordingSink::default());
    sink.fail_init.store(true, Ordering::SeqCst);

    let result = start(settings(0, 5000), &chain, sink).await;

    assert!(result.is_err());
    assert_eq!(chain.calls().head_calls, 0);
}

#[tokio::test]
async fn test_unreachable_chain_is_fatal() {
    let chain = Arc::new(MockChain::default());
    chain.fail_head(1);
    let sink = Arc::new(RecordingSink::default());

    let result = start(settings(0, 5000), &chain, sink).await;

    let err = result.err().unwrap();
    assert!(format!("{err:#}").contains("Could not reach chain client"));
}

#[tokio::test]
async fn test_failed_write_does_not_stop_tracking() {
    let chain = Arc::new(MockChain::default());
    chain.set_head(30);
    chain.set_timestamp(5, 100);
    chain.set_timestamp(25, 200);
    chain.add_transfer(5, rep_address(), 21_000, 1_000_000_000);
    chain.add_transfer(25, dao_address(), 21_000, 1_000_000_000);

    let sink = Arc::new(RecordingSink::default());
    sink.failing_writes.store(1, Ordering::SeqCst);
    let mut tracker = start(settings(0, 9), &chain, sink.clone()).await.unwrap();

    wait_until(|| sink.points().len() == 2).await;
    tracker.stop().await;

    let points = sink.points();
    assert_eq!(points[0].token, "TheDAO");
    assert_eq!(points[0].block, 25);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let chain = Arc::new(MockChain::default());
    chain.set_head(10);
    let sink = Arc::new(RecordingSink::default());

    let mut tracker = start(settings(10, 5000), &chain, sink.clone())
        .await
        .unwrap();
    tracker.stop().await;
    tracker.stop().await;

    assert!(sink.closed.load(Ordering::SeqCst));
    assert!(sink.points().is_empty());
}

#[tokio::test]
async fn test_start_block_fallbacks() {
    let sink = RecordingSink::default();
    assert_eq!(resolve_start_block(&sink, 42).await, 42);

    *sink.last_block.lock().unwrap() = Some(0);
    assert_eq!(resolve_start_block(&sink, 42).await, 42);

    *sink.last_block.lock().unwrap() = Some(7_000);
    assert_eq!(resolve_start_block(&sink, 42).await, 7_000);

    sink.fail_last_block.store(true, Ordering::SeqCst);
    assert_eq!(resolve_start_block(&sink, 42).await, 42);
}
