//! Outgoing batch lifecycle
//!
//! Batches are built from the transfer pool, handed to the foreign chain for
//! execution and then either confirmed executed (which cancels every older
//! batch of the same token) or canceled (which returns their transfers to the
//! pool).

pub mod manager;
pub mod types;

pub use manager::BatchManager;
pub use types::{BatchElement, ExecutionOutcome, OutgoingBatch};
