pub mod driver;
pub mod hardfork;
pub mod operations;

pub use driver::{AppliedOperation, BlockContext, Ledger, Transaction};
pub use hardfork::HardforkSchedule;
pub use operations::{Operation, OperationKind, OperationOutcome};
