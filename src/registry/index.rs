//! Sort keys for the ordered projections.
//!
//! Each key embeds exactly the fields its index sorts by. Ratio comparisons
//! use 128-bit cross products, mirroring [`crate::types::Price`]; equality is
//! defined as `cmp == Equal` so the `BTreeSet` semantics and the ordering can
//! never disagree.

use std::cmp::Ordering;
use std::ops::RangeInclusive;

use crate::{
    market::{call_order::CallOrder, limit_order::LimitOrder, settlement::CollateralBid},
    types::{AssetId, CallOrderId, CollateralBidId, LimitOrderId, Price},
};

// ================================================================================================
// Order book
// ================================================================================================

/// `(sell asset, receive asset, price descending, id ascending)`.
///
/// Best-priced order first within a pair; FIFO by id at equal price, which
/// also resolves same-block ties deterministically.
#[derive(Debug, Clone, Copy)]
pub struct BookKey {
    pub sell_asset: AssetId,
    pub receive_asset: AssetId,
    pub price: Price,
    pub id: LimitOrderId,
}

impl BookKey {
    pub fn of(id: LimitOrderId, order: &LimitOrder) -> Self {
        Self {
            sell_asset: order.sell_asset(),
            receive_asset: order.receive_asset(),
            price: order.sell_price,
            id,
        }
    }

    /// The full key range of one trading pair.
    pub fn pair_range(sell: AssetId, receive: AssetId) -> RangeInclusive<BookKey> {
        let best = BookKey {
            sell_asset: sell,
            receive_asset: receive,
            price: Price::from_amounts(i64::MAX, sell, 1, receive),
            id: LimitOrderId(0),
        };
        let worst = BookKey {
            sell_asset: sell,
            receive_asset: receive,
            price: Price::from_amounts(1, sell, i64::MAX, receive),
            id: LimitOrderId(u64::MAX),
        };
        best..=worst
    }
}

impl Ord for BookKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sell_asset
            .cmp(&other.sell_asset)
            .then_with(|| self.receive_asset.cmp(&other.receive_asset))
            // Descending price: the richest offer sorts first.
            .then_with(|| other.price.cmp(&self.price))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for BookKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BookKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BookKey {}

// ================================================================================================
// Call collateralization
// ================================================================================================

/// `(debt asset, collateral/debt ascending, id ascending)`: the least
/// collateralized position of an asset is always the first key.
#[derive(Debug, Clone, Copy)]
pub struct CallKey {
    pub debt_asset: AssetId,
    pub collateral: i64,
    pub debt: i64,
    pub id: CallOrderId,
}

impl CallKey {
    pub fn of(id: CallOrderId, order: &CallOrder) -> Self {
        Self {
            debt_asset: order.debt_asset(),
            collateral: order.collateral.amount.0,
            debt: order.debt.amount.0,
            id,
        }
    }

    pub fn asset_range(debt_asset: AssetId) -> RangeInclusive<CallKey> {
        let least = CallKey {
            debt_asset,
            collateral: 0,
            debt: 1,
            id: CallOrderId(0),
        };
        let most = CallKey {
            debt_asset,
            collateral: i64::MAX,
            debt: 1,
            id: CallOrderId(u64::MAX),
        };
        least..=most
    }
}

impl Ord for CallKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.debt_asset.cmp(&other.debt_asset).then_with(|| {
            let lhs = self.collateral as i128 * other.debt as i128;
            let rhs = other.collateral as i128 * self.debt as i128;
            lhs.cmp(&rhs).then_with(|| self.id.cmp(&other.id))
        })
    }
}

impl PartialOrd for CallKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CallKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CallKey {}

// ================================================================================================
// Collateral bids
// ================================================================================================

/// `(debt asset, collateral/debt descending, id ascending)`: the most
/// generous bid of a settled asset is the first key.
#[derive(Debug, Clone, Copy)]
pub struct BidKey {
    pub debt_asset: AssetId,
    pub collateral: i64,
    pub debt: i64,
    pub id: CollateralBidId,
}

impl BidKey {
    pub fn of(id: CollateralBidId, bid: &CollateralBid) -> Self {
        Self {
            debt_asset: bid.debt.asset_id,
            collateral: bid.collateral.amount.0,
            debt: bid.debt.amount.0,
            id,
        }
    }

    pub fn asset_range(debt_asset: AssetId) -> RangeInclusive<BidKey> {
        let best = BidKey {
            debt_asset,
            collateral: i64::MAX,
            debt: 1,
            id: CollateralBidId(0),
        };
        let worst = BidKey {
            debt_asset,
            collateral: 0,
            debt: 1,
            id: CollateralBidId(u64::MAX),
        };
        best..=worst
    }
}

impl Ord for BidKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.debt_asset.cmp(&other.debt_asset).then_with(|| {
            let lhs = self.collateral as i128 * other.debt as i128;
            let rhs = other.collateral as i128 * self.debt as i128;
            // Descending bid price.
            rhs.cmp(&lhs).then_with(|| self.id.cmp(&other.id))
        })
    }
}

impl PartialOrd for BidKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BidKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BidKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, Amount, AssetAmount};

    #[test]
    fn call_keys_order_least_collateralized_first() {
        let risky = CallKey {
            debt_asset: AssetId(5),
            collateral: 2000,
            debt: 1000,
            id: CallOrderId(1),
        };
        let safe = CallKey {
            debt_asset: AssetId(5),
            collateral: 4000,
            debt: 1000,
            id: CallOrderId(0),
        };
        assert!(risky < safe);
    }

    #[test]
    fn equal_ratio_non_canonical_fractions_tie_break_by_id() {
        let a = CallKey {
            debt_asset: AssetId(5),
            collateral: 2,
            debt: 1,
            id: CallOrderId(1),
        };
        let b = CallKey {
            debt_asset: AssetId(5),
            collateral: 4000,
            debt: 2000,
            id: CallOrderId(2),
        };
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn bid_keys_order_most_generous_first() {
        let generous = BidKey {
            debt_asset: AssetId(5),
            collateral: 3000,
            debt: 1000,
            id: CollateralBidId(1),
        };
        let stingy = BidKey {
            debt_asset: AssetId(5),
            collateral: 1500,
            debt: 1000,
            id: CollateralBidId(0),
        };
        assert!(generous < stingy);
    }

    #[test]
    fn pair_range_covers_all_prices() {
        let order = LimitOrder {
            seller: AccountId(1),
            for_sale: Amount(100),
            sell_price: Price::new(
                AssetAmount::new(100, AssetId(1)),
                AssetAmount::new(70, AssetId(2)),
            ),
            expiration: None,
            deferred_fee: Amount::ZERO,
        };
        let key = BookKey::of(LimitOrderId(9), &order);
        assert!(BookKey::pair_range(AssetId(1), AssetId(2)).contains(&key));
        assert!(!BookKey::pair_range(AssetId(2), AssetId(1)).contains(&key));
    }
}
