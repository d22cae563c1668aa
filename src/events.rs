use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::B256;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 = Transfer::SIGNATURE_HASH;

/// Upstream topic filtering is not trusted, so every log is re-checked here.
pub fn is_transfer(topics: &[B256]) -> bool {
    topics.iter().any(|topic| *topic == TRANSFER_TOPIC)
}
