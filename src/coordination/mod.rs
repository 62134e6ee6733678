//! Batch coordination
//!
//! A single coordinator task owns the batch manager. Callers reach it
//! through a cloneable handle, so batch operations never interleave.

pub mod engine;

pub use engine::{BatchCommand, BatchCoordinator, CoordinatorHandle, PoolStatus};
