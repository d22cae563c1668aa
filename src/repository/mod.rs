pub mod database;
pub mod influx;
pub mod point_repository;

pub use database::Database;
pub use influx::InfluxSink;
pub use point_repository::{PointRepository, SqliteSink, StoredPoint, TokenStats};

use crate::config::Config;
use crate::models::PricedPoint;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::Arc;

/// Destination of priced points.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Prepares the backend. Failure here is fatal for the process.
    async fn init(&self) -> Result<()>;

    /// Returns the number of points accepted.
    async fn write_batch(&self, points: &[PricedPoint]) -> Result<usize>;

    /// Highest block recorded so far, if any.
    async fn last_recorded_block(&self) -> Result<Option<u64>>;

    async fn close(&self) -> Result<()>;
}

/// Picks the backend from `STORAGE_URL`: `sqlite:<path>` or an InfluxDB
/// `http(s)://` endpoint.
pub fn open_sink(config: &Config) -> Result<Arc<dyn StorageSink>> {
    let url = config.storage_url.as_str();
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteSink::open(url)?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Arc::new(InfluxSink::new(
            url,
            &config.influx_database,
            &config.influx_username,
            &config.influx_password,
        )?));
    }
    bail!(
        "Unsupported STORAGE_URL '{}', expected sqlite:<path> or http(s)://",
        url
    )
}
