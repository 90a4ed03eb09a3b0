pub mod amount;
pub mod ids;
pub mod price;

pub use amount::{Amount, AssetAmount, MAX_SHARE_SUPPLY};
pub use ids::{
    AccountId, AssetId, CallOrderId, CollateralBidId, ForceSettlementId, LimitOrderId,
    VestingBalanceId,
};
pub use price::{Price, PriceFeed, COLLATERAL_RATIO_DENOM, MAX_COLLATERAL_RATIO, MIN_COLLATERAL_RATIO};
