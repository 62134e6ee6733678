//! Outgoing batch records

use crate::denom::BridgedDenominator;
use crate::valset::Valset;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// Token-denominated projection of a transfer request, frozen at batching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchElement {
    pub id: u64,
    pub sender: String,
    pub dest_address: Address,
    pub amount: U256,
    pub bridge_fee: U256,
}

/// A batch of transfers awaiting execution on the foreign chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub nonce: u64,
    pub elements: Vec<BatchElement>,
    pub token_contract: Address,
    pub voucher_denom: String,
    /// Denominator in force when the batch was built
    pub bridged_denom: BridgedDenominator,
    pub total_fee: U256,
    pub valset: Valset,
}

impl OutgoingBatch {
    pub fn transfer_ids(&self) -> Vec<u64> {
        self.elements.iter().map(|e| e.id).collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Result of confirming a batch executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub batch: OutgoingBatch,
    /// Nonces of older batches canceled as a consequence, highest first
    pub canceled: Vec<u64>,
}
