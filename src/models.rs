use crate::tokens::Token;
use alloy_primitives::{B256, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A transaction to a tracked token contract that emitted a Transfer event.
#[derive(Debug, Clone)]
pub struct TokenTransfer {
    pub token: Arc<Token>,
    pub time: DateTime<Utc>,
    pub gas: u64,
    pub gas_price: u128,
    pub block: u64,
    pub tx_hash: B256,
}

impl TokenTransfer {
    /// Total fee in wei.
    pub fn fee(&self) -> U256 {
        U256::from(self.gas) * U256::from(self.gas_price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    /// Fee actually paid for the token transfer.
    Token,
    /// Cost of a plain ether transfer at the same gas price.
    Reference,
}

impl PointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointKind::Token => "token",
            PointKind::Reference => "reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricedPoint {
    pub time: DateTime<Utc>,
    pub token: String,
    pub kind: PointKind,
    pub gas: u64,
    pub fees: BTreeMap<String, f64>,
    pub block: u64,
    /// Transaction the point belongs to. Keeps points of one block apart in
    /// stores keyed by series and timestamp.
    pub tx_hash: B256,
}
