use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::TidepoolResult,
    types::{AccountId, Amount, AssetAmount, AssetId, Price},
};

/// An offer to sell `for_sale` of the base asset of `sell_price` for the
/// quote asset, at no worse than the quoted ratio.
///
/// The escrowed `for_sale` amount leaves the seller's balance at placement
/// and returns in full on cancellation or expiry. Partial fills shrink it;
/// rounding residues stay with the order until they are culled as dust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub seller: AccountId,
    pub for_sale: Amount,
    pub sell_price: Price,
    pub expiration: Option<DateTime<Utc>>,
    /// Operation fee deferred until the order leaves the book; refunded on
    /// cancellation before any fill.
    pub deferred_fee: Amount,
}

impl LimitOrder {
    pub fn sell_asset(&self) -> AssetId {
        self.sell_price.base.asset_id
    }

    pub fn receive_asset(&self) -> AssetId {
        self.sell_price.quote.asset_id
    }

    pub fn amount_for_sale(&self) -> AssetAmount {
        AssetAmount::new(self.for_sale, self.sell_asset())
    }

    /// What the remaining escrow buys at the order's own price.
    pub fn amount_to_receive(&self) -> TidepoolResult<AssetAmount> {
        self.sell_price.convert(self.amount_for_sale())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}
