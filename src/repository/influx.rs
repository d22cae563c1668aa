use super::StorageSink;
use crate::models::{PointKind, PricedPoint};
use alloy_primitives::hex;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::{error, info};

pub const SERIES: &str = "gastracking";
const PRECISION: &str = "s";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const INIT_ATTEMPTS: usize = 3;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    series: Option<Vec<Series>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// InfluxDB 1.x over its HTTP API.
pub struct InfluxSink {
    client: Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
}

impl InfluxSink {
    pub fn new(base_url: &str, database: &str, username: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }

    async fn query(&self, q: &str, database: Option<&str>) -> Result<QueryResponse> {
        let mut params = vec![("q", q), ("epoch", PRECISION)];
        if let Some(db) = database {
            params.push(("db", db));
        }

        let response = self
            .authorized(self.client.post(format!("{}/query", self.base_url)))
            .form(&params)
            .send()
            .await
            .with_context(|| format!("InfluxDB query failed: {q}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read InfluxDB response")?;
        if !status.is_success() {
            bail!("InfluxDB returned {} for '{}': {}", status, q, body);
        }

        let parsed: QueryResponse =
            serde_json::from_str(&body).context("Invalid InfluxDB query response")?;
        if let Some(e) = parsed.error.as_ref() {
            bail!("InfluxDB error for '{}': {}", q, e);
        }
        if let Some(e) = parsed.results.iter().find_map(|r| r.error.as_ref()) {
            bail!("InfluxDB error for '{}': {}", q, e);
        }
        Ok(parsed)
    }

    async fn create_database(&self) -> Result<()> {
        self.query(&format!("CREATE DATABASE \"{}\"", self.database), None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageSink for InfluxSink {
    async fn init(&self) -> Result<()> {
        let strategy = FixedInterval::from_millis(1000).take(INIT_ATTEMPTS - 1);
        Retry::spawn(strategy, || self.create_database())
            .await
            .with_context(|| format!("Cannot reach InfluxDB at {}", self.base_url))?;
        info!("Successfully created database {}", self.database);
        Ok(())
    }

    async fn write_batch(&self, points: &[PricedPoint]) -> Result<usize> {
        let mut lines = Vec::with_capacity(points.len());
        for point in points {
            match render_line(point) {
                Ok(line) => lines.push(line),
                Err(e) => error!("Dropping point for {}: {:#}", point.token, e),
            }
        }
        if lines.is_empty() {
            return Ok(0);
        }

        let response = self
            .authorized(self.client.post(format!("{}/write", self.base_url)))
            .query(&[("db", self.database.as_str()), ("precision", PRECISION)])
            .body(lines.join("\n"))
            .send()
            .await
            .context("InfluxDB write failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("InfluxDB rejected write ({}): {}", status, body);
        }
        Ok(lines.len())
    }

    async fn last_recorded_block(&self) -> Result<Option<u64>> {
        let q = format!("SELECT last(block) FROM {SERIES}");
        let response = self.query(&q, Some(&self.database)).await?;
        last_block_from(&response)
    }

    async fn close(&self) -> Result<()> {
        info!("Influx is closing...");
        Ok(())
    }
}

fn last_block_from(response: &QueryResponse) -> Result<Option<u64>> {
    let Some(series) = response
        .results
        .first()
        .and_then(|r| r.series.as_ref())
        .and_then(|s| s.first())
    else {
        return Ok(None);
    };

    let column = series
        .columns
        .iter()
        .position(|c| c == "last")
        .context("Could not find block height in query result")?;
    let Some(value) = series.values.first().and_then(|row| row.get(column)) else {
        return Ok(None);
    };

    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .with_context(|| format!("Invalid block height {n}")),
        serde_json::Value::String(s) => s
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid block height {s}")),
        serde_json::Value::Null => Ok(None),
        other => bail!("Unexpected block height value {other}"),
    }
}

/// Renders a point in line protocol:
/// `gastracking,token=REP,tx=0x.. gas=50000i,block=102i,fee_ETH=0.001,fee_USD=2 1476000000`
///
/// The `tx` tag keeps several transfers of one block from overwriting each
/// other, since InfluxDB keys points by series and timestamp.
pub fn render_line(point: &PricedPoint) -> Result<String> {
    let mut fields = Vec::with_capacity(point.fees.len() + 2);
    if point.kind == PointKind::Token {
        fields.push(format!("gas={}i", point.gas));
        fields.push(format!("block={}i", point.block));
    }
    for (currency, amount) in &point.fees {
        if !amount.is_finite() {
            bail!("fee in {} is not a finite number ({})", currency, amount);
        }
        let key = escape(currency, &[',', '=', ' ']);
        fields.push(format!("fee_{key}={amount}"));
    }
    if fields.is_empty() {
        bail!("point has no fields");
    }

    Ok(format!(
        "{},token={},tx={} {} {}",
        SERIES,
        escape(&point.token, &[',', '=', ' ']),
        hex::encode_prefixed(point.tx_hash),
        fields.join(","),
        point.time.timestamp()
    ))
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use chrono::DateTime;
    use std::collections::BTreeMap;

    const TX: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn point(token: &str, kind: PointKind) -> PricedPoint {
        PricedPoint {
            time: DateTime::from_timestamp(1_476_000_000, 0).unwrap(),
            token: token.to_string(),
            kind,
            gas: 50_000,
            fees: BTreeMap::from([
                ("ETH".to_string(), 0.001),
                ("EUR".to_string(), 1.8),
                ("USD".to_string(), 2.0),
            ]),
            block: 102,
            tx_hash: B256::repeat_byte(0x11),
        }
    }

    #[test]
    fn test_render_token_point() {
        let line = render_line(&point("REP", PointKind::Token)).unwrap();
        assert_eq!(
            line,
            format!(
                "gastracking,token=REP,tx={TX} \
                 gas=50000i,block=102i,fee_ETH=0.001,fee_EUR=1.8,fee_USD=2 1476000000"
            )
        );
    }

    #[test]
    fn test_render_reference_point_omits_gas_and_block() {
        let line = render_line(&point("ETH", PointKind::Reference)).unwrap();
        assert_eq!(
            line,
            format!(
                "gastracking,token=ETH,tx={TX} fee_ETH=0.001,fee_EUR=1.8,fee_USD=2 1476000000"
            )
        );
    }

    #[test]
    fn test_transfers_in_one_block_get_distinct_series() {
        let first = point("REP", PointKind::Token);
        let mut second = point("REP", PointKind::Token);
        second.tx_hash = B256::repeat_byte(0x22);

        let series = |line: String| line.split(' ').next().unwrap().to_string();
        let first_series = series(render_line(&first).unwrap());
        let second_series = series(render_line(&second).unwrap());
        assert_ne!(first_series, second_series);
        assert_eq!(first.time, second.time);
    }

    #[test]
    fn test_render_escapes_tags() {
        let line = render_line(&point("The DAO,v2", PointKind::Token)).unwrap();
        assert!(line.starts_with("gastracking,token=The\\ DAO\\,v2,tx="));
    }

    #[test]
    fn test_render_rejects_non_finite() {
        let mut p = point("REP", PointKind::Token);
        p.fees.insert("USD".to_string(), f64::INFINITY);
        assert!(render_line(&p).is_err());
    }

    #[test]
    fn test_last_block_from_response() {
        let response: QueryResponse = serde_json::from_str(
            r#"{"results":[{"statement_id":0,"series":[{"name":"gastracking","columns":["time","last"],"values":[[1476000000,4321]]}]}]}"#,
        )
        .unwrap();
        assert_eq!(last_block_from(&response).unwrap(), Some(4321));

        let response: QueryResponse = serde_json::from_str(
            r#"{"results":[{"statement_id":0,"series":[{"columns":["time","last"],"values":[[1476000000,"77"]]}]}]}"#,
        )
        .unwrap();
        assert_eq!(last_block_from(&response).unwrap(), Some(77));
    }

    #[test]
    fn test_last_block_empty_series() {
        let response: QueryResponse =
            serde_json::from_str(r#"{"results":[{"statement_id":0}]}"#).unwrap();
        assert_eq!(last_block_from(&response).unwrap(), None);
    }

    #[test]
    fn test_last_block_missing_column() {
        let response: QueryResponse = serde_json::from_str(
            r#"{"results":[{"series":[{"columns":["time","max"],"values":[[1,2]]}]}]}"#,
        )
        .unwrap();
        assert!(last_block_from(&response).is_err());
    }
}
