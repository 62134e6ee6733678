//! Batch lifecycle manager
//!
//! Each operation runs to completion before the next begins and leaves no
//! partial mutation behind when it fails.

use super::types::{ExecutionOutcome, OutgoingBatch};
use crate::denom::DenominationResolver;
use crate::error::{BatchError, BatchResult};
use crate::events::{BatchEvent, BridgeIdentity, EventSink};
use crate::metrics;
use crate::pool::{NewTransfer, TransferPool, TransferRequest};
use crate::store::BatchStore;
use crate::valset::ValsetProvider;

use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Owns the transfer pool and batch store and drives batches through
/// creation, execution and cancellation
pub struct BatchManager<S: BatchStore> {
    pool: TransferPool,
    store: S,
    resolver: Arc<dyn DenominationResolver>,
    valsets: Arc<dyn ValsetProvider>,
    events: Arc<dyn EventSink>,
    bridge: BridgeIdentity,
}

impl<S: BatchStore> BatchManager<S> {
    pub fn new(
        pool: TransferPool,
        store: S,
        resolver: Arc<dyn DenominationResolver>,
        valsets: Arc<dyn ValsetProvider>,
        events: Arc<dyn EventSink>,
        bridge: BridgeIdentity,
    ) -> Self {
        Self {
            pool,
            store,
            resolver,
            valsets,
            events,
            bridge,
        }
    }

    pub fn pool(&self) -> &TransferPool {
        &self.pool
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replace the pool and store wholesale, e.g. to undo an operation
    /// whose result could not be persisted
    pub fn restore(&mut self, pool: TransferPool, store: S) {
        self.pool = pool;
        self.store = store;
    }

    /// Admit a transfer request to the pool
    pub fn submit_transfer(&mut self, transfer: NewTransfer) -> BatchResult<u64> {
        let denom = transfer.denom.clone();
        let id = self.pool.add(transfer)?;

        metrics::record_transfer_submitted(&denom);
        metrics::record_pool_depth(&denom, self.pool.unbatched_len(&denom));
        Ok(id)
    }

    /// Withdraw a transfer that has not been batched yet
    pub fn withdraw_transfer(&mut self, id: u64) -> BatchResult<TransferRequest> {
        let tx = self.pool.remove_unbatched(id)?;

        info!("Transfer {} withdrawn from pool {}", id, tx.denom);
        metrics::record_pool_depth(&tx.denom, self.pool.unbatched_len(&tx.denom));
        Ok(tx)
    }

    /// Build a batch from the highest-fee unbatched transfers of `denom`
    pub fn create_batch(&mut self, denom: &str, max_elements: usize) -> BatchResult<OutgoingBatch> {
        if max_elements == 0 {
            return Err(BatchError::invalid("max elements must be positive"));
        }

        let bridged = self
            .resolver
            .resolve(denom)
            .ok_or_else(|| BatchError::UnknownDenomination {
                denom: denom.to_string(),
            })?;
        let token_contract = bridged.token_contract;

        if self.store.last_nonce(&token_contract) == u64::MAX {
            return Err(BatchError::invalid(format!(
                "nonce space exhausted for token {:?}",
                token_contract
            )));
        }

        let selection = self.pool.select_top(denom, &bridged, max_elements)?;

        // Nothing below can fail: the selection, nonce and record land together
        let nonce = self.store.next_nonce(&token_contract);
        let batch = OutgoingBatch {
            nonce,
            elements: selection.elements,
            token_contract,
            voucher_denom: denom.to_string(),
            bridged_denom: bridged,
            total_fee: selection.total_fee,
            valset: self.valsets.current_valset(),
        };
        self.store.put(batch.clone());

        self.events.emit(&BatchEvent::BatchCreated {
            bridge: self.bridge,
            token_contract,
            nonce,
            elements: batch.len(),
            total_fee: batch.total_fee,
        });

        info!(
            "Created batch {} for token {:?} with {} transfers (total fee {})",
            nonce,
            token_contract,
            batch.len(),
            batch.total_fee
        );
        metrics::record_batch_created(&token_contract, batch.len());
        metrics::record_pool_depth(denom, self.pool.unbatched_len(denom));

        Ok(batch)
    }

    /// Handle a batch confirmed executed on the foreign chain.
    ///
    /// The batch's transfers are dropped for good, every older batch of the
    /// same token is canceled, then the batch itself is removed.
    pub fn confirm_executed(
        &mut self,
        token_contract: Address,
        nonce: u64,
    ) -> BatchResult<ExecutionOutcome> {
        let ids = self
            .store
            .get(&token_contract, nonce)
            .map(|batch| batch.transfer_ids())
            .ok_or(BatchError::UnknownBatch {
                token_contract,
                nonce,
            })?;

        let dropped = self.pool.discard(&ids);
        if dropped != ids.len() {
            warn!(
                "Batch {} for token {:?} referenced {} transfers, {} were live",
                nonce,
                token_contract,
                ids.len(),
                dropped
            );
        }

        // Settlement nonces are monotonic: anything older can no longer execute
        let stale: Vec<u64> = self
            .store
            .batches_desc()
            .skip_while(|b| b.token_contract != token_contract)
            .take_while(|b| b.token_contract == token_contract)
            .filter(|b| b.nonce < nonce)
            .map(|b| b.nonce)
            .collect();

        let mut canceled = Vec::with_capacity(stale.len());
        for stale_nonce in stale {
            match self.cancel(token_contract, stale_nonce) {
                Ok(_) => canceled.push(stale_nonce),
                Err(e) => error!(
                    "Failed to cancel stale batch {} for token {:?}: {}",
                    stale_nonce, token_contract, e
                ),
            }
        }

        let batch = self
            .store
            .delete(&token_contract, nonce)
            .ok_or(BatchError::UnknownBatch {
                token_contract,
                nonce,
            })?;

        info!(
            "Batch {} for token {:?} executed, {} older batches canceled",
            nonce,
            token_contract,
            canceled.len()
        );
        metrics::record_batch_executed(&token_contract);

        Ok(ExecutionOutcome { batch, canceled })
    }

    /// Cancel a pending batch and return its transfers to the pool.
    ///
    /// Not idempotent: a second call for the same nonce fails with
    /// `UnknownBatch`.
    pub fn cancel_batch(&mut self, token_contract: Address, nonce: u64) -> BatchResult<OutgoingBatch> {
        self.cancel(token_contract, nonce)
    }

    fn cancel(&mut self, token_contract: Address, nonce: u64) -> BatchResult<OutgoingBatch> {
        let unknown = BatchError::UnknownBatch {
            token_contract,
            nonce,
        };
        let batch = self.store.get(&token_contract, nonce).ok_or(unknown.clone())?;

        // Undo the conversion frozen into the batch
        let entries = batch
            .elements
            .iter()
            .map(|e| {
                batch
                    .bridged_denom
                    .to_voucher(e.bridge_fee)
                    .map(|fee| (e.id, fee))
                    .ok_or_else(|| {
                        BatchError::invalid(format!(
                            "batch {} has a zero conversion factor",
                            nonce
                        ))
                    })
            })
            .collect::<BatchResult<Vec<_>>>()?;
        let denom = batch.voucher_denom.clone();

        self.pool.readmit_all(&denom, &entries)?;
        let batch = self.store.delete(&token_contract, nonce).ok_or(unknown)?;

        self.events.emit(&BatchEvent::BatchCanceled {
            bridge: self.bridge,
            token_contract,
            nonce,
        });

        info!(
            "Canceled batch {} for token {:?}, {} transfers returned to pool {}",
            nonce,
            token_contract,
            entries.len(),
            denom
        );
        metrics::record_batch_canceled(&token_contract);
        metrics::record_pool_depth(&denom, self.pool.unbatched_len(&denom));

        Ok(batch)
    }

    pub fn get_batch(&self, token_contract: &Address, nonce: u64) -> Option<&OutgoingBatch> {
        self.store.get(token_contract, nonce)
    }

    /// All pending batches, highest nonce first within each token
    pub fn pending_batches(&self) -> Vec<OutgoingBatch> {
        let batches: Vec<OutgoingBatch> = self.store.batches_desc().cloned().collect();
        debug!("Listing {} pending batches", batches.len());
        batches
    }
}
