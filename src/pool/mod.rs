//! Transfer pool
//!
//! Holds every transfer request not yet executed on the foreign chain and
//! indexes the unbatched ones by voucher denom and fee for batch selection.

mod index;

pub use index::{NewTransfer, PoolSnapshot, TransferPool, TransferRequest};
