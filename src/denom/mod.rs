//! Voucher denomination resolution
//!
//! Maps an internal voucher denom to the foreign token contract that settles
//! it, together with the factor used to convert voucher amounts into token
//! units.

use crate::config::{parse_address, DenominationConfig};

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Foreign-chain counterpart of a voucher denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgedDenominator {
    pub token_contract: Address,
    pub symbol: String,
    pub conversion_factor: U256,
}

impl BridgedDenominator {
    /// Convert a voucher amount into token units
    pub fn to_foreign(&self, amount: U256) -> Option<U256> {
        amount.checked_mul(self.conversion_factor)
    }

    /// Convert token units back into the voucher amount they were derived from
    pub fn to_voucher(&self, amount: U256) -> Option<U256> {
        amount.checked_div(self.conversion_factor)
    }
}

/// Resolves voucher denoms to their bridged counterpart
pub trait DenominationResolver: Send + Sync {
    fn resolve(&self, voucher_denom: &str) -> Option<BridgedDenominator>;
}

/// Static registry of bridged denominators loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct DenomRegistry {
    denoms: HashMap<String, BridgedDenominator>,
}

impl DenomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the `[denominations]` config table
    pub fn from_config(config: &HashMap<String, DenominationConfig>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for (voucher_denom, entry) in config {
            registry.register(
                voucher_denom,
                BridgedDenominator {
                    token_contract: parse_address(&entry.token_contract)?,
                    symbol: entry.symbol.clone(),
                    conversion_factor: U256::from(entry.conversion_factor),
                },
            );
        }
        Ok(registry)
    }

    pub fn register(&mut self, voucher_denom: &str, denom: BridgedDenominator) {
        self.denoms.insert(voucher_denom.to_string(), denom);
    }
}

impl DenominationResolver for DenomRegistry {
    fn resolve(&self, voucher_denom: &str) -> Option<BridgedDenominator> {
        self.denoms.get(voucher_denom).cloned()
    }
}
