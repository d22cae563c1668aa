use crate::models::{PointKind, PricedPoint, TokenTransfer};
use crate::prices::Prices;
use alloy_primitives::U256;
use alloy_primitives::utils::format_units;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Gas consumed by a plain ether transfer.
pub const ETHER_TRANSFER_GAS: u64 = 21_000;

/// Symbol of the chain's base currency, used as the reference point's tag.
pub const BASE_SYMBOL: &str = "ETH";

/// Decimals between wei and ether.
const BASE_UNIT_DECIMALS: u8 = 18;

/// Turns token transfers into fee points priced in every quoted currency.
#[derive(Debug, Clone, Default)]
pub struct FeeAttributor {
    /// Always present in the fee map, at zero until a quote arrives.
    currencies: Vec<String>,
}

impl FeeAttributor {
    pub fn new(currencies: &[String]) -> Self {
        Self {
            currencies: currencies.to_vec(),
        }
    }

    /// Produces a token point and an ether-transfer reference point for each
    /// transfer. Every point of the batch is priced with the same `prices`.
    pub fn attribute(&self, transfers: &[TokenTransfer], prices: &Prices) -> Vec<PricedPoint> {
        let mut points = Vec::with_capacity(transfers.len() * 2);

        for transfer in transfers {
            match self.attribute_one(transfer, prices) {
                Ok((token_point, reference_point)) => {
                    debug!(
                        "New tx for token {} in block {}",
                        transfer.token.name, transfer.block
                    );
                    points.push(token_point);
                    points.push(reference_point);
                }
                Err(e) => {
                    error!(
                        "Skipping transfer of {} in block {}: {:#}",
                        transfer.token.name, transfer.block, e
                    );
                }
            }
        }

        points
    }

    fn attribute_one(
        &self,
        transfer: &TokenTransfer,
        prices: &Prices,
    ) -> Result<(PricedPoint, PricedPoint)> {
        let token_fee = to_base_units(transfer.fee())?;
        let reference_fee =
            to_base_units(U256::from(ETHER_TRANSFER_GAS) * U256::from(transfer.gas_price))?;

        let token_point = PricedPoint {
            time: transfer.time,
            token: transfer.token.name.clone(),
            kind: PointKind::Token,
            gas: transfer.gas,
            fees: self.fee_map(token_fee, prices),
            block: transfer.block,
            tx_hash: transfer.tx_hash,
        };
        let reference_point = PricedPoint {
            time: transfer.time,
            token: BASE_SYMBOL.to_string(),
            kind: PointKind::Reference,
            gas: ETHER_TRANSFER_GAS,
            fees: self.fee_map(reference_fee, prices),
            block: transfer.block,
            tx_hash: transfer.tx_hash,
        };
        Ok((token_point, reference_point))
    }

    fn fee_map(&self, base_amount: f64, prices: &Prices) -> BTreeMap<String, f64> {
        let mut fees = BTreeMap::new();
        fees.insert(BASE_SYMBOL.to_string(), base_amount);
        for currency in &self.currencies {
            let price = prices.get(currency).copied().unwrap_or(0.0);
            fees.insert(currency.clone(), base_amount * price);
        }
        for (currency, price) in prices.iter() {
            if currency != BASE_SYMBOL && !fees.contains_key(currency) {
                fees.insert(currency.clone(), base_amount * price);
            }
        }
        fees
    }
}

/// Converts an amount of wei to ether.
pub fn to_base_units(wei: U256) -> Result<f64> {
    let formatted = format_units(wei, BASE_UNIT_DECIMALS)
        .with_context(|| format!("Cannot format {wei} wei"))?;
    formatted
        .parse::<f64>()
        .with_context(|| format!("Cannot parse fee amount {formatted}"))
}
