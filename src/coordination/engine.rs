//! Batch coordinator: serializes every batch operation through one task

use crate::batch::{BatchManager, ExecutionOutcome, OutgoingBatch};
use crate::config::BatcherConfig;
use crate::error::{BatchResult, BatcherError, BatcherResult};
use crate::metrics;
use crate::pool::{NewTransfer, TransferRequest};
use crate::state::{LedgerSnapshot, StateManager};
use crate::store::{BatchStore, MemoryBatchStore};

use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Commands accepted by the coordinator
#[derive(Debug)]
pub enum BatchCommand {
    SubmitTransfer {
        transfer: NewTransfer,
        response: oneshot::Sender<BatcherResult<u64>>,
    },
    WithdrawTransfer {
        id: u64,
        response: oneshot::Sender<BatcherResult<TransferRequest>>,
    },
    CreateBatch {
        denom: String,
        max_elements: Option<usize>,
        response: oneshot::Sender<BatcherResult<OutgoingBatch>>,
    },
    ConfirmExecuted {
        token_contract: Address,
        nonce: u64,
        response: oneshot::Sender<BatcherResult<ExecutionOutcome>>,
    },
    CancelBatch {
        token_contract: Address,
        nonce: u64,
        response: oneshot::Sender<BatcherResult<OutgoingBatch>>,
    },
    GetBatch {
        token_contract: Address,
        nonce: u64,
        response: oneshot::Sender<Option<OutgoingBatch>>,
    },
    ListBatches {
        response: oneshot::Sender<Vec<OutgoingBatch>>,
    },
    ListPool {
        denom: String,
        response: oneshot::Sender<Vec<TransferRequest>>,
    },
    Status {
        response: oneshot::Sender<PoolStatus>,
    },
}

/// Pool and store summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub transfers: usize,
    pub unbatched: Vec<(String, usize)>,
    pub pending_batches: usize,
    /// False while the last snapshot write failed
    pub persisted: bool,
}

/// Handle for interacting with the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::UnboundedSender<BatchCommand>,
}

impl CoordinatorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BatchCommand,
    ) -> BatcherResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| BatcherError::CoordinatorStopped)?;
        rx.await.map_err(|_| BatcherError::CoordinatorStopped)
    }

    pub async fn submit_transfer(&self, transfer: NewTransfer) -> BatcherResult<u64> {
        self.request(|response| BatchCommand::SubmitTransfer { transfer, response })
            .await?
    }

    pub async fn withdraw_transfer(&self, id: u64) -> BatcherResult<TransferRequest> {
        self.request(|response| BatchCommand::WithdrawTransfer { id, response })
            .await?
    }

    /// Build a batch; `None` uses the configured maximum size
    pub async fn create_batch(
        &self,
        denom: String,
        max_elements: Option<usize>,
    ) -> BatcherResult<OutgoingBatch> {
        self.request(|response| BatchCommand::CreateBatch {
                denom,
                max_elements,
                response,
            })
            .await?
    }

    pub async fn confirm_executed(
        &self,
        token_contract: Address,
        nonce: u64,
    ) -> BatcherResult<ExecutionOutcome> {
        self.request(|response| BatchCommand::ConfirmExecuted {
                token_contract,
                nonce,
                response,
            })
            .await?
    }

    pub async fn cancel_batch(
        &self,
        token_contract: Address,
        nonce: u64,
    ) -> BatcherResult<OutgoingBatch> {
        self.request(|response| BatchCommand::CancelBatch {
                token_contract,
                nonce,
                response,
            })
            .await?
    }

    pub async fn get_batch(
        &self,
        token_contract: Address,
        nonce: u64,
    ) -> BatcherResult<Option<OutgoingBatch>> {
        self.request(|response| BatchCommand::GetBatch {
            token_contract,
            nonce,
            response,
        })
        .await
    }

    pub async fn list_batches(&self) -> BatcherResult<Vec<OutgoingBatch>> {
        self.request(|response| BatchCommand::ListBatches { response })
            .await
    }

    pub async fn list_pool(&self, denom: String) -> BatcherResult<Vec<TransferRequest>> {
        self.request(|response| BatchCommand::ListPool { denom, response })
            .await
    }

    pub async fn status(&self) -> BatcherResult<PoolStatus> {
        self.request(|response| BatchCommand::Status { response })
            .await
    }
}

/// Owns the batch manager and applies commands one at a time
pub struct BatchCoordinator {
    /// Batch lifecycle state machine
    manager: BatchManager<MemoryBatchStore>,
    /// State manager for persistence
    state: Arc<StateManager>,
    /// Configuration
    config: BatcherConfig,
    /// Denoms visited by automatic batching
    denoms: Vec<String>,
    /// Incoming commands
    receiver: mpsc::UnboundedReceiver<BatchCommand>,
    /// Shutdown signal
    shutdown: watch::Receiver<bool>,
    /// Set when a snapshot write failed; mutations are refused until one succeeds
    dirty: bool,
}

impl BatchCoordinator {
    /// Create a coordinator and the handle used to reach it
    pub fn new(
        manager: BatchManager<MemoryBatchStore>,
        state: Arc<StateManager>,
        config: BatcherConfig,
        denoms: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, CoordinatorHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            manager,
            state,
            config,
            denoms,
            receiver,
            shutdown,
            dirty: false,
        };
        (coordinator, CoordinatorHandle { sender })
    }

    /// Main coordination loop
    pub async fn run(mut self) -> BatcherResult<()> {
        let mut auto_interval = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));

        info!(
            "Batch coordinator started ({} denoms, auto batching {})",
            self.denoms.len(),
            if self.config.auto_batch { "on" } else { "off" }
        );

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                _ = auto_interval.tick(), if self.config.auto_batch => {
                    self.build_pending_batches().await;
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if self.persist().await.is_err() {
            warn!("Final snapshot was not written");
        }
        info!("Batch coordinator stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: BatchCommand) {
        match command {
            BatchCommand::SubmitTransfer { transfer, response } => {
                let result = self.apply(|m| m.submit_transfer(transfer)).await;
                let _ = response.send(result);
            }

            BatchCommand::WithdrawTransfer { id, response } => {
                let result = self.apply(|m| m.withdraw_transfer(id)).await;
                let _ = response.send(result);
            }

            BatchCommand::CreateBatch {
                denom,
                max_elements,
                response,
            } => {
                let max = max_elements.unwrap_or(self.config.max_batch_size);
                let result = self.apply(|m| m.create_batch(&denom, max)).await;
                let _ = response.send(result);
            }

            BatchCommand::ConfirmExecuted {
                token_contract,
                nonce,
                response,
            } => {
                let result = self
                    .apply(|m| m.confirm_executed(token_contract, nonce))
                    .await;
                if let Err(BatcherError::Batch(e)) = &result {
                    if e.is_benign() {
                        debug!("Ignoring confirmation replay: {}", e);
                    } else {
                        warn!("Confirmation failed: {}", e);
                    }
                }
                let _ = response.send(result);
            }

            BatchCommand::CancelBatch {
                token_contract,
                nonce,
                response,
            } => {
                let result = self
                    .apply(|m| m.cancel_batch(token_contract, nonce))
                    .await;
                let _ = response.send(result);
            }

            BatchCommand::GetBatch {
                token_contract,
                nonce,
                response,
            } => {
                let _ = response.send(self.manager.get_batch(&token_contract, nonce).cloned());
            }

            BatchCommand::ListBatches { response } => {
                let _ = response.send(self.manager.pending_batches());
            }

            BatchCommand::ListPool { denom, response } => {
                let _ = response.send(self.manager.pool().unbatched(&denom));
            }

            BatchCommand::Status { response } => {
                let pool = self.manager.pool();
                let _ = response.send(PoolStatus {
                    transfers: pool.len(),
                    unbatched: pool.unbatched_counts(),
                    pending_batches: self.manager.store().len(),
                    persisted: !self.dirty,
                });
            }
        }
    }

    /// Try to batch every configured denom
    async fn build_pending_batches(&mut self) {
        let max = self.config.max_batch_size;
        for denom in self.denoms.clone() {
            match self.apply(|m| m.create_batch(&denom, max)).await {
                Ok(batch) => debug!("Auto-built batch {} for {}", batch.nonce, denom),
                Err(BatcherError::Batch(e)) if e.is_benign() => {
                    debug!("Nothing to batch: {}", e)
                }
                Err(BatcherError::Batch(e)) if e.should_alert() => {
                    error!("Automatic batching of {} failed: {}", denom, e)
                }
                Err(BatcherError::Batch(e)) => {
                    warn!("Automatic batching of {} failed: {}", denom, e)
                }
                Err(e) => {
                    warn!("Automatic batching paused: {}", e);
                    break;
                }
            }
        }
    }

    /// Run one mutating operation and make it durable.
    ///
    /// The operation only counts once its snapshot is written. If the write
    /// fails, the manager is rolled back to its state before the operation
    /// and the write error is returned instead of the result.
    async fn apply<T, F>(&mut self, op: F) -> BatcherResult<T>
    where
        F: FnOnce(&mut BatchManager<MemoryBatchStore>) -> BatchResult<T>,
    {
        if self.dirty {
            self.persist().await?;
        }

        let before = LedgerSnapshot::capture(&self.manager);
        let value = op(&mut self.manager)?;

        if let Err(e) = self.persist().await {
            match before.into_parts() {
                Ok((pool, store)) => self.manager.restore(pool, store),
                Err(restore_err) => {
                    error!("Failed to roll back unpersisted operation: {}", restore_err)
                }
            }
            return Err(e);
        }

        Ok(value)
    }

    async fn persist(&mut self) -> BatcherResult<()> {
        let snapshot = LedgerSnapshot::capture(&self.manager);
        match self.state.save(&snapshot).await {
            Ok(()) => {
                if self.dirty {
                    info!("Snapshot writes to {:?} recovered", self.state.path());
                }
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                error!("Failed to persist snapshot to {:?}: {}", self.state.path(), e);
                metrics::record_snapshot_failure();
                self.dirty = true;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;
    use crate::denom::{BridgedDenominator, DenomRegistry};
    use crate::error::BatchError;
    use crate::events::{BridgeIdentity, BroadcastEventSink};
    use crate::pool::TransferPool;
    use crate::valset::{StaticValsetProvider, Valset};

    use ethers::types::U256;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    const DENOM: &str = "voucher";

    fn token() -> Address {
        Address::repeat_byte(0x0c)
    }

    struct Running {
        handle: CoordinatorHandle,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<BatcherResult<()>>,
        state: Arc<StateManager>,
        _dir: TempDir,
    }

    async fn start(auto_batch: bool) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(
            StateManager::new(&StateConfig {
                snapshot_path: dir.path().join("batcher.json"),
            })
            .await
            .unwrap(),
        );

        let mut registry = DenomRegistry::new();
        registry.register(
            DENOM,
            BridgedDenominator {
                token_contract: token(),
                symbol: "TKN".to_string(),
                conversion_factor: U256::one(),
            },
        );
        let manager = BatchManager::new(
            TransferPool::new(),
            MemoryBatchStore::new(),
            Arc::new(registry),
            Arc::new(StaticValsetProvider::new(Valset::default())),
            Arc::new(BroadcastEventSink::new(16)),
            BridgeIdentity {
                contract_address: Address::repeat_byte(0xbb),
                chain_id: 1,
            },
        );

        let config = BatcherConfig {
            poll_interval_ms: 10,
            max_batch_size: 2,
            auto_batch,
            health_check_interval_secs: 60,
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (coordinator, handle) = BatchCoordinator::new(
            manager,
            state.clone(),
            config,
            vec![DENOM.to_string()],
            shutdown_rx,
        );
        let task = tokio::spawn(coordinator.run());

        Running {
            handle,
            shutdown,
            task,
            state,
            _dir: dir,
        }
    }

    fn transfer(fee: u64) -> NewTransfer {
        NewTransfer {
            sender: "cosmos1sender".to_string(),
            dest_address: Address::repeat_byte(0x22),
            denom: DENOM.to_string(),
            amount: U256::from(100u64),
            fee: U256::from(fee),
        }
    }

    #[tokio::test]
    async fn test_commands_round_trip_and_persist() {
        let running = start(false).await;
        let handle = &running.handle;

        for fee in [1, 2, 3] {
            handle.submit_transfer(transfer(fee)).await.unwrap();
        }
        let first = handle.create_batch(DENOM.to_string(), None).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = handle.create_batch(DENOM.to_string(), None).await.unwrap();

        let outcome = handle.confirm_executed(token(), second.nonce).await.unwrap();
        assert_eq!(outcome.canceled, vec![first.nonce]);

        let status = handle.status().await.unwrap();
        assert_eq!(status.transfers, 2);
        assert_eq!(status.pending_batches, 0);
        assert_eq!(status.unbatched, vec![(DENOM.to_string(), 2)]);

        let snapshot = running.state.load().await.unwrap().unwrap();
        assert_eq!(snapshot.pool.unbatched.len(), 2);
        assert!(snapshot.store.batches.is_empty());
        assert_eq!(snapshot.store.nonces[0].last_nonce, 2);

        running.shutdown.send(true).unwrap();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_replayed_confirmation_surfaces_unknown_batch() {
        let running = start(false).await;
        let handle = &running.handle;

        handle.submit_transfer(transfer(5)).await.unwrap();
        let batch = handle.create_batch(DENOM.to_string(), Some(1)).await.unwrap();
        handle.confirm_executed(token(), batch.nonce).await.unwrap();

        let err = handle
            .confirm_executed(token(), batch.nonce)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BatcherError::Batch(BatchError::UnknownBatch { .. })
        ));
        assert!(handle.list_batches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_batching_builds_batches() {
        let running = start(true).await;
        let handle = &running.handle;

        handle.submit_transfer(transfer(7)).await.unwrap();

        let mut batches = Vec::new();
        for _ in 0..100 {
            batches = handle.list_batches().await.unwrap();
            if !batches.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(batches.len(), 1);
        assert!(handle.list_pool(DENOM.to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unpersisted_create_is_rejected_and_rolled_back() {
        let running = start(false).await;
        let handle = &running.handle;
        handle.submit_transfer(transfer(4)).await.unwrap();

        // Swap the snapshot file for a directory so the rename fails
        let path = running.state.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = handle
            .create_batch(DENOM.to_string(), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BatcherError::Io(_)));

        let status = handle.status().await.unwrap();
        assert!(!status.persisted);
        assert_eq!(status.pending_batches, 0);
        assert_eq!(status.unbatched, vec![(DENOM.to_string(), 1)]);

        // Further writes are refused while storage is failing
        assert!(handle.submit_transfer(transfer(9)).await.is_err());
        assert_eq!(handle.status().await.unwrap().transfers, 1);

        std::fs::remove_dir(&path).unwrap();
        let batch = handle.create_batch(DENOM.to_string(), Some(1)).await.unwrap();
        assert_eq!(batch.nonce, 1);
        assert!(handle.status().await.unwrap().persisted);

        let snapshot = running.state.load().await.unwrap().unwrap();
        assert_eq!(snapshot.store.batches, vec![batch]);
        assert_eq!(snapshot.store.nonces[0].last_nonce, 1);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_coordinator() {
        let running = start(false).await;
        running.shutdown.send(true).unwrap();
        running.task.await.unwrap().unwrap();

        let err = running.handle.status().await.unwrap_err();
        assert!(matches!(err, BatcherError::CoordinatorStopped));
    }
}
