//! JSON snapshot state manager

use crate::batch::BatchManager;
use crate::config::StateConfig;
use crate::error::{BatchError, BatchResult, BatcherError, BatcherResult};
use crate::pool::{PoolSnapshot, TransferPool};
use crate::store::{BatchStore, MemoryBatchStore, StoreSnapshot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Full batcher state as written to disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub pool: PoolSnapshot,
    pub store: StoreSnapshot,
    pub saved_at: Option<DateTime<Utc>>,
}

impl LedgerSnapshot {
    pub fn capture(manager: &BatchManager<MemoryBatchStore>) -> Self {
        Self {
            pool: manager.pool().snapshot(),
            store: manager.store().snapshot(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Rebuild the pool and store, checking that every transfer record is
    /// either unbatched or held by exactly one batch
    pub fn into_parts(self) -> BatchResult<(TransferPool, MemoryBatchStore)> {
        let record_ids: Vec<u64> = self.pool.requests.iter().map(|r| r.id).collect();
        let pool = TransferPool::from_snapshot(self.pool)?;
        let store = MemoryBatchStore::from_snapshot(self.store);

        let mut batched = HashSet::new();
        for batch in store.batches_desc() {
            for id in batch.transfer_ids() {
                if pool.get(id).is_none() {
                    return Err(BatchError::PoolInvariant {
                        id,
                        detail: "batched transfer has no record",
                    });
                }
                if pool.is_unbatched(id) {
                    return Err(BatchError::PoolInvariant {
                        id,
                        detail: "batched transfer is also unbatched",
                    });
                }
                if !batched.insert(id) {
                    return Err(BatchError::PoolInvariant {
                        id,
                        detail: "transfer is held by two batches",
                    });
                }
            }
        }

        if let Some(&id) = record_ids
            .iter()
            .find(|id| !pool.is_unbatched(**id) && !batched.contains(*id))
        {
            return Err(BatchError::PoolInvariant {
                id,
                detail: "transfer record is neither unbatched nor batched",
            });
        }

        Ok((pool, store))
    }
}

/// State manager for snapshot persistence
pub struct StateManager {
    path: PathBuf,
}

impl StateManager {
    /// Create a new state manager, creating the snapshot directory if needed
    pub async fn new(config: &StateConfig) -> BatcherResult<Self> {
        if let Some(parent) = config.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        Ok(Self {
            path: config.snapshot_path.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot, if any
    pub async fn load(&self) -> BatcherResult<Option<LedgerSnapshot>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {:?}, starting empty", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;
        info!(
            "Loaded snapshot from {:?}: {} transfers, {} pending batches",
            self.path,
            snapshot.pool.requests.len(),
            snapshot.store.batches.len()
        );
        Ok(Some(snapshot))
    }

    /// Write a snapshot, replacing the previous one atomically
    pub async fn save(&self, snapshot: &LedgerSnapshot) -> BatcherResult<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");

        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Saved snapshot to {:?} ({} bytes)", self.path, bytes.len());
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> BatcherResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let metadata = fs::metadata(&dir).await?;
        if !metadata.is_dir() {
            return Err(BatcherError::Internal(format!(
                "snapshot directory {:?} is not a directory",
                dir
            )));
        }
        if metadata.permissions().readonly() {
            return Err(BatcherError::Internal(format!(
                "snapshot directory {:?} is read-only",
                dir
            )));
        }
        Ok(())
    }
}
