//! Ordered in-memory batch store

use super::BatchStore;
use crate::batch::OutgoingBatch;

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Last issued nonce of one token contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub token_contract: Address,
    pub last_nonce: u64,
}

/// Serializable form of the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub batches: Vec<OutgoingBatch>,
    pub nonces: Vec<NonceRecord>,
}

/// Batch store backed by ordered maps
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    /// Pending batches: (token_contract, nonce) -> batch
    batches: BTreeMap<(Address, u64), OutgoingBatch>,
    /// Last issued nonce per token contract
    last_nonces: BTreeMap<Address, u64>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            batches: self.batches.values().cloned().collect(),
            nonces: self
                .last_nonces
                .iter()
                .map(|(token_contract, last_nonce)| NonceRecord {
                    token_contract: *token_contract,
                    last_nonce: *last_nonce,
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut store = Self::new();
        for record in snapshot.nonces {
            store
                .last_nonces
                .insert(record.token_contract, record.last_nonce);
        }
        for batch in snapshot.batches {
            // Never hand out a nonce a restored batch already holds
            let last = store.last_nonces.entry(batch.token_contract).or_insert(0);
            if batch.nonce > *last {
                *last = batch.nonce;
            }
            store.put(batch);
        }
        store
    }
}

impl BatchStore for MemoryBatchStore {
    fn put(&mut self, batch: OutgoingBatch) {
        let key = (batch.token_contract, batch.nonce);
        if self.batches.insert(key, batch).is_some() {
            debug!("Overwrote batch {} for token {:?}", key.1, key.0);
        }
    }

    fn get(&self, token_contract: &Address, nonce: u64) -> Option<&OutgoingBatch> {
        self.batches.get(&(*token_contract, nonce))
    }

    fn delete(&mut self, token_contract: &Address, nonce: u64) -> Option<OutgoingBatch> {
        self.batches.remove(&(*token_contract, nonce))
    }

    fn batches_desc(&self) -> Box<dyn Iterator<Item = &OutgoingBatch> + '_> {
        Box::new(self.batches.values().rev())
    }

    fn next_nonce(&mut self, token_contract: &Address) -> u64 {
        let last = self.last_nonces.entry(*token_contract).or_insert(0);
        *last += 1;
        debug!("Allocated nonce {} for token {:?}", *last, token_contract);
        *last
    }

    fn last_nonce(&self, token_contract: &Address) -> u64 {
        self.last_nonces.get(token_contract).copied().unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}
