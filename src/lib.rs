// === Public Modules (The Canonical Paths) ===
pub mod asset;
pub mod authority;
pub mod chain;
pub mod error;
pub mod market;
pub mod registry;
pub mod types;
pub mod vesting;

// === Private Implementation Details ===
mod macros;

// === Convenience ===
pub mod sorted_vec_map;
pub use crate::chain::{
    AppliedOperation, BlockContext, HardforkSchedule, Ledger, Operation, OperationKind,
    OperationOutcome, Transaction,
};
pub use crate::error::{TidepoolError, TidepoolResult};
pub use crate::types::{Amount, AssetAmount, Price, PriceFeed};
