//! Batch store
//!
//! Durable mapping from `(token contract, nonce)` to pending batches, plus
//! the per-token nonce counters batches are numbered from.

mod memory;

pub use memory::{MemoryBatchStore, NonceRecord, StoreSnapshot};

use crate::batch::OutgoingBatch;

use ethers::types::Address;

/// Storage for pending outgoing batches
pub trait BatchStore: Send {
    /// Insert or overwrite the batch keyed by its token contract and nonce
    fn put(&mut self, batch: OutgoingBatch);

    fn get(&self, token_contract: &Address, nonce: u64) -> Option<&OutgoingBatch>;

    fn delete(&mut self, token_contract: &Address, nonce: u64) -> Option<OutgoingBatch>;

    /// Lazily visit every stored batch, grouped by token contract with the
    /// highest nonce first. The store cannot change while the iterator lives;
    /// callers stop early by dropping it.
    fn batches_desc(&self) -> Box<dyn Iterator<Item = &OutgoingBatch> + '_>;

    /// Increment and return the nonce counter of `token_contract`
    fn next_nonce(&mut self, token_contract: &Address) -> u64;

    /// Last nonce issued for `token_contract`, 0 if none
    fn last_nonce(&self, token_contract: &Address) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
