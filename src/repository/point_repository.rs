use super::StorageSink;
use super::database::Database;
use crate::models::{PointKind, PricedPoint};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params, params_from_iter};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// A point read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredPoint {
    pub time: DateTime<Utc>,
    pub token: String,
    pub kind: String,
    pub gas: Option<u64>,
    pub block: Option<u64>,
    pub fees: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub token: String,
    pub points: usize,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
    pub average_fees: BTreeMap<String, f64>,
}

pub struct PointRepository<'a> {
    conn: &'a Connection,
}

impl<'a> PointRepository<'a> {
    const INSERT_POINT: &'static str =
        "INSERT INTO points (time, token, kind, gas, block) VALUES (?1, ?2, ?3, ?4, ?5)";

    const INSERT_FEE: &'static str =
        "INSERT OR REPLACE INTO point_fees (point_id, currency, amount) VALUES (?1, ?2, ?3)";

    const SELECT_LAST_BLOCK: &'static str = "SELECT MAX(block) FROM points";

    const SELECT_POINTS: &'static str = "SELECT id, time, token, kind, gas, block FROM points";

    const SELECT_FEES: &'static str =
        "SELECT currency, amount FROM point_fees WHERE point_id = ?1 ORDER BY currency";

    const SELECT_TOKEN_COUNTS: &'static str = "SELECT token, COUNT(*), MIN(block), MAX(block)
         FROM points GROUP BY token ORDER BY token";

    const SELECT_AVERAGE_FEES: &'static str = "SELECT p.token, f.currency, AVG(f.amount)
         FROM point_fees f JOIN points p ON p.id = f.point_id
         GROUP BY p.token, f.currency";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Writes the batch in one transaction. Points with non-finite fees are
    /// logged and left out.
    pub fn insert_batch(&self, points: &[PricedPoint]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;

        {
            let mut insert_point = tx.prepare(Self::INSERT_POINT)?;
            let mut insert_fee = tx.prepare(Self::INSERT_FEE)?;

            for point in points {
                if let Err(e) = validate(point) {
                    error!("Dropping point for {}: {:#}", point.token, e);
                    continue;
                }

                let (gas, block) = match point.kind {
                    PointKind::Token => (Some(point.gas), Some(point.block)),
                    PointKind::Reference => (None, None),
                };
                insert_point.execute(params![
                    point.time.timestamp(),
                    point.token,
                    point.kind.as_str(),
                    gas,
                    block,
                ])?;
                let point_id = tx.last_insert_rowid();

                for (currency, amount) in &point.fees {
                    insert_fee.execute(params![point_id, currency, amount])?;
                }
                count += 1;
            }
        }

        tx.commit()?;
        Ok(count)
    }

    pub fn last_block(&self) -> Result<Option<u64>> {
        let block: Option<u64> = self
            .conn
            .query_row(Self::SELECT_LAST_BLOCK, [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(block)
    }

    /// Most recent points first.
    pub fn recent(&self, token: Option<&str>, limit: usize) -> Result<Vec<StoredPoint>> {
        let mut query = Self::SELECT_POINTS.to_string();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(token) = token {
            query.push_str(" WHERE token = ?");
            params.push(Box::new(token.to_string()));
        }
        query.push_str(&format!(" ORDER BY time DESC, id DESC LIMIT {limit}"));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(params), Self::row_to_point)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut fees_stmt = self.conn.prepare(Self::SELECT_FEES)?;
        let mut points = Vec::with_capacity(rows.len());
        for (id, mut point) in rows {
            point.fees = fees_stmt
                .query_map(params![id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            points.push(point);
        }
        Ok(points)
    }

    pub fn token_stats(&self) -> Result<Vec<TokenStats>> {
        let mut stmt = self.conn.prepare(Self::SELECT_TOKEN_COUNTS)?;
        let mut stats = stmt
            .query_map([], |row| {
                Ok(TokenStats {
                    token: row.get(0)?,
                    points: row.get(1)?,
                    first_block: row.get(2)?,
                    last_block: row.get(3)?,
                    average_fees: BTreeMap::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(Self::SELECT_AVERAGE_FEES)?;
        let averages = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (token, currency, average) in averages {
            if let Some(entry) = stats.iter_mut().find(|s| s.token == token) {
                entry.average_fees.insert(currency, average);
            }
        }
        Ok(stats)
    }

    fn row_to_point(row: &Row) -> rusqlite::Result<(i64, StoredPoint)> {
        let secs: i64 = row.get(1)?;
        let time = DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| rusqlite::Error::IntegralValueOutOfRange(1, secs))?;
        Ok((
            row.get(0)?,
            StoredPoint {
                time,
                token: row.get(2)?,
                kind: row.get(3)?,
                gas: row.get(4)?,
                block: row.get(5)?,
                fees: BTreeMap::new(),
            },
        ))
    }
}

fn validate(point: &PricedPoint) -> Result<()> {
    if point.fees.is_empty() {
        bail!("no fee values");
    }
    for (currency, amount) in &point.fees {
        if !amount.is_finite() {
            bail!("fee in {} is not a finite number ({})", currency, amount);
        }
    }
    Ok(())
}

/// Local SQLite store, mainly for development and the `query` tool.
#[derive(Clone)]
pub struct SqliteSink {
    db: Arc<Mutex<Database>>,
}

impl SqliteSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let db = Database::new(db_path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_repo<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PointRepository) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let db = db
                .lock()
                .map_err(|_| anyhow::anyhow!("Database lock poisoned"))?;
            f(&PointRepository::new(&db.conn))
        })
        .await?
    }
}

#[async_trait]
impl StorageSink for SqliteSink {
    async fn init(&self) -> Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            db.lock()
                .map_err(|_| anyhow::anyhow!("Database lock poisoned"))?
                .create_tables()
        })
        .await??;
        info!("SQLite store ready");
        Ok(())
    }

    async fn write_batch(&self, points: &[PricedPoint]) -> Result<usize> {
        let points = points.to_vec();
        self.with_repo(move |repo| repo.insert_batch(&points)).await
    }

    async fn last_recorded_block(&self) -> Result<Option<u64>> {
        self.with_repo(|repo| repo.last_block()).await
    }

    async fn close(&self) -> Result<()> {
        info!("SQLite store is closing...");
        Ok(())
    }
}
