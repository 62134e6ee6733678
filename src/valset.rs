//! Validator set snapshots captured into outgoing batches

use crate::config::{parse_address, ValidatorConfig};

use ethers::types::Address;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValsetMember {
    pub eth_address: Address,
    pub power: u64,
}

/// Point-in-time capture of the signing authority set
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Valset {
    pub nonce: u64,
    pub members: Vec<ValsetMember>,
}

impl Valset {
    /// Sum of member powers, saturating at `u64::MAX`
    pub fn total_power(&self) -> u64 {
        self.members
            .iter()
            .fold(0u64, |total, m| total.saturating_add(m.power))
    }
}

/// Provides the current validator set
pub trait ValsetProvider: Send + Sync {
    fn current_valset(&self) -> Valset;
}

/// Validator set fixed at startup from configuration
#[derive(Debug, Clone)]
pub struct StaticValsetProvider {
    valset: Valset,
}

impl StaticValsetProvider {
    pub fn new(valset: Valset) -> Self {
        Self { valset }
    }

    pub fn from_config(validators: &[ValidatorConfig]) -> anyhow::Result<Self> {
        let mut members = validators
            .iter()
            .map(|v| {
                Ok(ValsetMember {
                    eth_address: parse_address(&v.eth_address)?,
                    power: v.power,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        // Highest power first, address as tie-break
        members.sort_by(|a, b| {
            b.power
                .cmp(&a.power)
                .then_with(|| a.eth_address.cmp(&b.eth_address))
        });

        let valset = Valset { nonce: 0, members };
        tracing::info!(
            "Validator set: {} members, total power {}",
            valset.members.len(),
            valset.total_power()
        );
        Ok(Self::new(valset))
    }
}

impl ValsetProvider for StaticValsetProvider {
    fn current_valset(&self) -> Valset {
        self.valset.clone()
    }
}
