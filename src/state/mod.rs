//! State persistence
//!
//! Handles:
//! - Ledger snapshots (pool, pending batches, nonce counters)
//! - Restart recovery from the last snapshot
//! - Storage health checks

mod manager;

pub use manager::{LedgerSnapshot, StateManager};
