//! Fee-ordered index of unbatched transfer requests

use crate::batch::BatchElement;
use crate::denom::BridgedDenominator;
use crate::error::{BatchError, BatchResult};

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// A user-submitted request to move value across the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: u64,
    pub sender: String,
    pub dest_address: Address,
    /// Voucher denom both `amount` and `fee` are expressed in
    pub denom: String,
    pub amount: U256,
    pub fee: U256,
}

/// Transfer submission before an id is assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransfer {
    pub sender: String,
    pub dest_address: Address,
    pub denom: String,
    pub amount: U256,
    pub fee: U256,
}

/// Index key: highest fee first, then lowest id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    fee: Reverse<U256>,
    id: u64,
}

impl PoolKey {
    fn of(tx: &TransferRequest) -> Self {
        Self {
            fee: Reverse(tx.fee),
            id: tx.id,
        }
    }
}

/// Transfers taken out of the pool for one batch
#[derive(Debug, Clone)]
pub struct Selection {
    pub elements: Vec<BatchElement>,
    /// Sum of the converted element fees
    pub total_fee: U256,
}

/// Serializable form of the pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub last_id: u64,
    pub requests: Vec<TransferRequest>,
    pub unbatched: Vec<u64>,
}

/// Transfer pool.
///
/// Every live request has a record in `requests`. Only requests not held by
/// a pending batch are present in the per-denom `unbatched` index, so a
/// request can never be selected into two batches at once.
#[derive(Debug, Default)]
pub struct TransferPool {
    requests: BTreeMap<u64, TransferRequest>,
    unbatched: BTreeMap<String, BTreeSet<PoolKey>>,
    last_id: u64,
}

impl TransferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new transfer request and return its id
    pub fn add(&mut self, transfer: NewTransfer) -> BatchResult<u64> {
        if transfer.denom.is_empty() {
            return Err(BatchError::invalid("transfer denom is empty"));
        }
        if transfer.sender.is_empty() {
            return Err(BatchError::invalid("transfer sender is empty"));
        }
        if transfer.amount.is_zero() {
            return Err(BatchError::invalid("transfer amount must be positive"));
        }

        let id = self
            .last_id
            .checked_add(1)
            .ok_or_else(|| BatchError::invalid("transfer id space exhausted"))?;
        self.last_id = id;

        let tx = TransferRequest {
            id,
            sender: transfer.sender,
            dest_address: transfer.dest_address,
            denom: transfer.denom,
            amount: transfer.amount,
            fee: transfer.fee,
        };

        self.unbatched
            .entry(tx.denom.clone())
            .or_default()
            .insert(PoolKey::of(&tx));
        debug!("Admitted transfer {} to pool {}", id, tx.denom);
        self.requests.insert(id, tx);

        Ok(id)
    }

    /// Withdraw a transfer that is not part of any batch
    pub fn remove_unbatched(&mut self, id: u64) -> BatchResult<TransferRequest> {
        let tx = self
            .requests
            .get(&id)
            .ok_or(BatchError::UnknownTransfer { id })?;

        let removed = self
            .unbatched
            .get_mut(&tx.denom)
            .map(|keys| keys.remove(&PoolKey::of(tx)))
            .unwrap_or(false);
        if !removed {
            return Err(BatchError::invalid(format!(
                "transfer {} is held by a pending batch",
                id
            )));
        }

        let denom = tx.denom.clone();
        self.prune(&denom);
        self.requests
            .remove(&id)
            .ok_or(BatchError::UnknownTransfer { id })
    }

    /// Take up to `max` transfers of `denom` in fee-descending order.
    ///
    /// Conversion and fee summation complete before anything leaves the
    /// index, so a failed selection leaves the pool untouched.
    pub fn select_top(
        &mut self,
        denom: &str,
        bridged: &BridgedDenominator,
        max: usize,
    ) -> BatchResult<Selection> {
        let mut taken = Vec::new();
        let mut elements = Vec::new();
        let mut total_fee = U256::zero();

        if let Some(keys) = self.unbatched.get(denom) {
            for key in keys.iter().take(max) {
                let tx = self.requests.get(&key.id).ok_or(BatchError::PoolInvariant {
                    id: key.id,
                    detail: "indexed transfer has no record",
                })?;

                let conversion_overflow = || BatchError::ConversionOverflow {
                    denom: denom.to_string(),
                    id: tx.id,
                };
                let amount = bridged.to_foreign(tx.amount).ok_or_else(conversion_overflow)?;
                let bridge_fee = bridged.to_foreign(tx.fee).ok_or_else(conversion_overflow)?;
                total_fee = total_fee
                    .checked_add(bridge_fee)
                    .ok_or_else(|| BatchError::FeeOverflow {
                        denom: denom.to_string(),
                    })?;

                elements.push(BatchElement {
                    id: tx.id,
                    sender: tx.sender.clone(),
                    dest_address: tx.dest_address,
                    amount,
                    bridge_fee,
                });
                taken.push(*key);
            }
        }

        if elements.is_empty() {
            return Err(BatchError::EmptySelection {
                denom: denom.to_string(),
            });
        }

        if let Some(keys) = self.unbatched.get_mut(denom) {
            for key in &taken {
                keys.remove(key);
            }
        }
        self.prune(denom);

        debug!(
            "Selected {} transfers from pool {} (total fee {})",
            elements.len(),
            denom,
            total_fee
        );
        Ok(Selection {
            elements,
            total_fee,
        })
    }

    /// Return previously selected transfers to the unbatched index.
    ///
    /// Each entry is `(id, voucher fee)`. All entries are checked before any
    /// is inserted: a missing record, a denom or fee mismatch, or a transfer
    /// that is already unbatched is a `PoolInvariant` error.
    pub fn readmit_all(&mut self, denom: &str, entries: &[(u64, U256)]) -> BatchResult<()> {
        let mut keys = Vec::with_capacity(entries.len());
        for &(id, fee) in entries {
            let tx = self.requests.get(&id).ok_or(BatchError::PoolInvariant {
                id,
                detail: "readmitted transfer has no record",
            })?;
            if tx.denom != denom {
                return Err(BatchError::PoolInvariant {
                    id,
                    detail: "readmitted under a different denom",
                });
            }
            if tx.fee != fee {
                return Err(BatchError::PoolInvariant {
                    id,
                    detail: "readmitted fee differs from the recorded fee",
                });
            }
            let key = PoolKey::of(tx);
            let already = self
                .unbatched
                .get(denom)
                .map(|set| set.contains(&key))
                .unwrap_or(false);
            if already || keys.contains(&key) {
                return Err(BatchError::PoolInvariant {
                    id,
                    detail: "transfer is already unbatched",
                });
            }
            keys.push(key);
        }

        self.unbatched
            .entry(denom.to_string())
            .or_default()
            .extend(keys);
        debug!("Readmitted {} transfers to pool {}", entries.len(), denom);
        Ok(())
    }

    /// Permanently drop transfer records. Returns how many existed.
    pub fn discard(&mut self, ids: &[u64]) -> usize {
        let mut dropped = 0;
        for id in ids {
            if let Some(tx) = self.requests.remove(id) {
                let key = PoolKey::of(&tx);
                if let Some(set) = self.unbatched.get_mut(&tx.denom) {
                    if set.remove(&key) {
                        warn!("Discarded transfer {} was still unbatched", id);
                    }
                }
                self.prune(&tx.denom);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn get(&self, id: u64) -> Option<&TransferRequest> {
        self.requests.get(&id)
    }

    pub fn is_unbatched(&self, id: u64) -> bool {
        self.requests
            .get(&id)
            .and_then(|tx| {
                self.unbatched
                    .get(&tx.denom)
                    .map(|set| set.contains(&PoolKey::of(tx)))
            })
            .unwrap_or(false)
    }

    /// Unbatched transfers of `denom` in selection order
    pub fn unbatched(&self, denom: &str) -> Vec<TransferRequest> {
        self.unbatched
            .get(denom)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.requests.get(&key.id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn unbatched_len(&self, denom: &str) -> usize {
        self.unbatched.get(denom).map(|set| set.len()).unwrap_or(0)
    }

    /// Number of unbatched transfers per denom
    pub fn unbatched_counts(&self) -> Vec<(String, usize)> {
        self.unbatched
            .iter()
            .map(|(denom, set)| (denom.clone(), set.len()))
            .collect()
    }

    /// Number of live transfer records, batched or not
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            last_id: self.last_id,
            requests: self.requests.values().cloned().collect(),
            unbatched: self
                .unbatched
                .values()
                .flat_map(|set| set.iter().map(|key| key.id))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: PoolSnapshot) -> BatchResult<Self> {
        let mut pool = Self {
            requests: BTreeMap::new(),
            unbatched: BTreeMap::new(),
            last_id: snapshot.last_id,
        };

        for tx in snapshot.requests {
            if tx.id > pool.last_id {
                return Err(BatchError::PoolInvariant {
                    id: tx.id,
                    detail: "record id above the id counter",
                });
            }
            pool.requests.insert(tx.id, tx);
        }

        for id in snapshot.unbatched {
            let tx = pool.requests.get(&id).ok_or(BatchError::PoolInvariant {
                id,
                detail: "unbatched id has no record",
            })?;
            pool.unbatched
                .entry(tx.denom.clone())
                .or_default()
                .insert(PoolKey::of(tx));
        }

        Ok(pool)
    }

    fn prune(&mut self, denom: &str) {
        if self
            .unbatched
            .get(denom)
            .map(|set| set.is_empty())
            .unwrap_or(false)
        {
            self.unbatched.remove(denom);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DENOM: &str = "voucher";

    fn bridged(factor: u64) -> BridgedDenominator {
        BridgedDenominator {
            token_contract: Address::repeat_byte(0xaa),
            symbol: "TKN".to_string(),
            conversion_factor: U256::from(factor),
        }
    }

    fn transfer(amount: u64, fee: u64) -> NewTransfer {
        NewTransfer {
            sender: "cosmos1sender".to_string(),
            dest_address: Address::repeat_byte(0x22),
            denom: DENOM.to_string(),
            amount: U256::from(amount),
            fee: U256::from(fee),
        }
    }

    fn pool_with_fees(fees: &[u64]) -> TransferPool {
        let mut pool = TransferPool::new();
        for fee in fees {
            pool.add(transfer(100, *fee)).unwrap();
        }
        pool
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut pool = TransferPool::new();
        assert_eq!(pool.add(transfer(1, 0)).unwrap(), 1);
        assert_eq!(pool.add(transfer(1, 0)).unwrap(), 2);
        pool.remove_unbatched(2).unwrap();
        assert_eq!(pool.add(transfer(1, 0)).unwrap(), 3);
    }

    #[test]
    fn test_add_rejects_zero_amount() {
        let mut pool = TransferPool::new();
        let err = pool.add(transfer(0, 5)).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument { .. }));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_select_orders_by_fee_then_id() {
        let mut pool = pool_with_fees(&[5, 1, 9, 3, 9]);
        let selection = pool.select_top(DENOM, &bridged(1), 3).unwrap();

        let ids: Vec<u64> = selection.elements.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 5, 1]);
        assert_eq!(selection.total_fee, U256::from(23u64));

        let left: Vec<u64> = pool.unbatched(DENOM).iter().map(|t| t.fee.as_u64()).collect();
        assert_eq!(left, vec![3, 1]);
    }

    #[test]
    fn test_select_converts_amounts() {
        let mut pool = pool_with_fees(&[2]);
        let selection = pool.select_top(DENOM, &bridged(10), 5).unwrap();
        assert_eq!(selection.elements[0].amount, U256::from(1000u64));
        assert_eq!(selection.elements[0].bridge_fee, U256::from(20u64));
        assert_eq!(selection.total_fee, U256::from(20u64));
    }

    #[test]
    fn test_select_empty_denom() {
        let mut pool = TransferPool::new();
        let err = pool.select_top(DENOM, &bridged(1), 10).unwrap_err();
        assert_eq!(
            err,
            BatchError::EmptySelection {
                denom: DENOM.to_string()
            }
        );
    }

    #[test]
    fn test_fee_overflow_leaves_pool_untouched() {
        let mut pool = TransferPool::new();
        let mut big = transfer(1, 0);
        big.fee = U256::MAX;
        pool.add(big.clone()).unwrap();
        pool.add(big).unwrap();

        let err = pool.select_top(DENOM, &bridged(1), 2).unwrap_err();
        assert!(matches!(err, BatchError::FeeOverflow { .. }));
        assert_eq!(pool.unbatched_len(DENOM), 2);
    }

    #[test]
    fn test_conversion_overflow_leaves_pool_untouched() {
        let mut pool = TransferPool::new();
        let mut big = transfer(1, 0);
        big.amount = U256::MAX;
        pool.add(big).unwrap();

        let err = pool.select_top(DENOM, &bridged(2), 1).unwrap_err();
        assert_eq!(
            err,
            BatchError::ConversionOverflow {
                denom: DENOM.to_string(),
                id: 1
            }
        );
        assert!(pool.is_unbatched(1));
    }

    #[test]
    fn test_readmit_restores_position() {
        let mut pool = pool_with_fees(&[5, 1, 9]);
        let selection = pool.select_top(DENOM, &bridged(1), 1).unwrap();
        assert!(!pool.is_unbatched(3));

        pool.readmit_all(DENOM, &[(3, U256::from(9u64))]).unwrap();
        let ids: Vec<u64> = pool.unbatched(DENOM).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(selection.elements[0].id, 3);
    }

    #[test]
    fn test_duplicate_readmission_rejected() {
        let mut pool = pool_with_fees(&[5, 7]);
        pool.select_top(DENOM, &bridged(1), 1).unwrap();

        let err = pool
            .readmit_all(DENOM, &[(2, U256::from(7u64)), (1, U256::from(5u64))])
            .unwrap_err();
        assert!(matches!(err, BatchError::PoolInvariant { id: 1, .. }));
        // Nothing was inserted
        assert!(!pool.is_unbatched(2));
    }

    #[test]
    fn test_remove_unbatched_refuses_batched_transfer() {
        let mut pool = pool_with_fees(&[5]);
        pool.select_top(DENOM, &bridged(1), 1).unwrap();

        let err = pool.remove_unbatched(1).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument { .. }));
        assert_eq!(
            pool.remove_unbatched(99).unwrap_err(),
            BatchError::UnknownTransfer { id: 99 }
        );
    }

    #[test]
    fn test_discard_drops_records() {
        let mut pool = pool_with_fees(&[5, 6]);
        pool.select_top(DENOM, &bridged(1), 2).unwrap();
        assert_eq!(pool.discard(&[1, 2, 3]), 2);
        assert!(pool.is_empty());
        assert!(pool.unbatched_counts().is_empty());
    }

    #[test]
    fn test_snapshot_restores_index() {
        let mut pool = pool_with_fees(&[4, 8, 6]);
        pool.select_top(DENOM, &bridged(1), 1).unwrap();

        let restored = TransferPool::from_snapshot(pool.snapshot()).unwrap();
        assert_eq!(restored.unbatched(DENOM), pool.unbatched(DENOM));
        assert!(!restored.is_unbatched(2));
        assert_eq!(restored.len(), 3);
    }
}
