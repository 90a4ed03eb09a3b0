pub mod call_order;
pub mod limit_order;
pub mod matching;
pub mod settlement;

pub use call_order::CallOrder;
pub use limit_order::LimitOrder;
pub use settlement::{CollateralBid, ForceSettlement};
