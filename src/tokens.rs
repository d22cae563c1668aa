use alloy_primitives::Address;
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// Mainnet tokens tracked when `TOKENS` is not configured.
pub const DEFAULT_TOKENS: &[(&str, &str)] = &[
    ("REP", "0x48c80F1f4D53D5951e5D5438B54Cba84f29F32a5"),
    ("TheDAO", "0xBB9bc244D798123fDe783fCc1C72d3Bb8C189413"),
    ("ICONOMI", "0x888666CA69E0f178DED6D75b5726Cee99A87D698"),
    ("Elcoin", "0x57d90b64a1a57749b0f932f1a3395792e12e7055"),
    ("Xaurum", "0x4DF812F6064def1e5e029f1ca858777CC98D2D81"),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    pub name: String,
    pub address: Address,
}

impl Token {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// The fixed set of token contracts watched during a run, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    by_address: HashMap<Address, Arc<Token>>,
}

impl TokenSet {
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Result<Self> {
        let mut by_address: HashMap<Address, Arc<Token>> = HashMap::new();
        for token in tokens {
            if let Some(existing) = by_address.get(&token.address) {
                bail!(
                    "Token address {:?} configured twice ({} and {})",
                    token.address,
                    existing.name,
                    token.name
                );
            }
            by_address.insert(token.address, Arc::new(token));
        }
        Ok(Self { by_address })
    }

    /// Parses `NAME=0xADDRESS` pairs separated by commas.
    pub fn parse(list: &str) -> Result<Self> {
        let tokens = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| -> Result<Token> {
                let Some((name, address)) = entry.split_once('=') else {
                    bail!("Invalid token entry '{entry}', expected NAME=ADDRESS");
                };
                let address = Address::from_str(address.trim())
                    .with_context(|| format!("Invalid address for token {name}"))?;
                Ok(Token::new(name.trim(), address))
            })
            .collect::<Result<Vec<_>>>()?;

        if tokens.is_empty() {
            bail!("Token list is empty");
        }
        Self::new(tokens)
    }

    pub fn defaults() -> Result<Self> {
        let tokens = DEFAULT_TOKENS
            .iter()
            .map(|(name, address)| {
                Address::from_str(address)
                    .map(|address| Token::new(*name, address))
                    .with_context(|| format!("Invalid built-in address for {name}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(tokens)
    }

    pub fn get(&self, address: &Address) -> Option<&Arc<Token>> {
        self.by_address.get(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.by_address.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Token>> {
        self.by_address.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_list() {
        let set = TokenSet::parse(
            "REP=0x48c80F1f4D53D5951e5D5438B54Cba84f29F32a5, Xaurum=0x4DF812F6064def1e5e029f1ca858777CC98D2D81",
        )
        .unwrap();

        assert_eq!(set.len(), 2);
        let rep = Address::from_str("0x48c80F1f4D53D5951e5D5438B54Cba84f29F32a5").unwrap();
        assert_eq!(set.get(&rep).unwrap().name, "REP");
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let address = Address::repeat_byte(0x11);
        let result = TokenSet::new(vec![Token::new("A", address), Token::new("B", address)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_entries_rejected() {
        assert!(TokenSet::parse("REP").is_err());
        assert!(TokenSet::parse("REP=0xnothex").is_err());
        assert!(TokenSet::parse(" , ").is_err());
    }

    #[test]
    fn test_defaults_are_distinct() {
        let set = TokenSet::defaults().unwrap();
        assert_eq!(set.len(), DEFAULT_TOKENS.len());
    }
}
