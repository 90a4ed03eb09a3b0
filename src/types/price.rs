use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{
    error::{TidepoolResult, ValidationError},
    types::{
        amount::{Amount, AssetAmount},
        ids::AssetId,
    },
};

/// Denominator for all per-mille collateral ratios (MCR, MSSR, ICR).
pub const COLLATERAL_RATIO_DENOM: u16 = 1000;

/// Smallest admissible per-mille collateral ratio. A ratio of exactly 1000
/// would allow positions with no margin at all.
pub const MIN_COLLATERAL_RATIO: u16 = 1001;

/// Largest admissible per-mille collateral ratio (32x).
pub const MAX_COLLATERAL_RATIO: u16 = 32000;

// ================================================================================================
// Price
// ================================================================================================

/// An exact ratio of two asset amounts.
///
/// A price quotes `base.amount` of the base asset per `quote.amount` of the
/// quote asset. The ratio is usually kept in reduced form but never has to
/// be: equality and ordering are defined on the 128-bit cross product
/// (`a/b == c/d iff a*d == b*c`), so non-canonical fractions compare
/// correctly.
///
/// Two prices only order meaningfully within the same asset pair. The total
/// order used by indices sorts by pair first, then by ratio, which keeps
/// cross-pair keys well-defined without ever comparing their ratios.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Price {
    pub base: AssetAmount,
    pub quote: AssetAmount,
}

impl Price {
    pub fn new(base: AssetAmount, quote: AssetAmount) -> Self {
        Self { base, quote }
    }

    /// Price of `base_amount` base units per `quote_amount` quote units.
    pub fn from_amounts(
        base_amount: impl Into<Amount>,
        base_asset: AssetId,
        quote_amount: impl Into<Amount>,
        quote_asset: AssetId,
    ) -> Self {
        Self {
            base: AssetAmount::new(base_amount, base_asset),
            quote: AssetAmount::new(quote_amount, quote_asset),
        }
    }

    /// The 1:1 price of an asset against itself, used as the default core
    /// exchange rate of the core asset.
    pub fn identity(asset_id: AssetId) -> Self {
        Self {
            base: AssetAmount::new(1, asset_id),
            quote: AssetAmount::new(1, asset_id),
        }
    }

    pub fn pair(&self) -> (AssetId, AssetId) {
        (self.base.asset_id, self.quote.asset_id)
    }

    /// A price is invertible iff both sides are strictly positive.
    pub fn is_invertible(&self) -> bool {
        self.base.amount.is_positive() && self.quote.amount.is_positive()
    }

    pub fn validate(&self) -> TidepoolResult<()> {
        if !self.is_invertible() {
            return Err(ValidationError::InvalidPrice.into());
        }
        Ok(())
    }

    /// Swaps base and quote.
    pub fn invert(self) -> Self {
        Self {
            base: self.quote,
            quote: self.base,
        }
    }

    /// Compares the ratios of two prices quoting the same pair.
    ///
    /// Uses exact 128-bit cross multiplication; amounts are bounded by
    /// `MAX_SHARE_SUPPLY` so the products cannot overflow.
    pub fn cmp_ratio(&self, other: &Price) -> TidepoolResult<Ordering> {
        if self.pair() != other.pair() {
            return Err(ValidationError::PricePairMismatch.into());
        }
        let lhs = self.base.amount.0 as i128 * other.quote.amount.0 as i128;
        let rhs = other.base.amount.0 as i128 * self.quote.amount.0 as i128;
        Ok(lhs.cmp(&rhs))
    }

    /// Converts an amount of one side of the pair into the other, rounding
    /// toward zero. The residue of the division stays with the caller.
    pub fn convert(&self, a: AssetAmount) -> TidepoolResult<AssetAmount> {
        self.validate()?;
        if a.asset_id == self.base.asset_id {
            let r = a.amount.0 as i128 * self.quote.amount.0 as i128 / self.base.amount.0 as i128;
            let amount = i64::try_from(r).map_err(|_| ValidationError::AmountOverflow)?;
            Ok(AssetAmount::new(amount, self.quote.asset_id))
        } else if a.asset_id == self.quote.asset_id {
            let r = a.amount.0 as i128 * self.base.amount.0 as i128 / self.quote.amount.0 as i128;
            let amount = i64::try_from(r).map_err(|_| ValidationError::AmountOverflow)?;
            Ok(AssetAmount::new(amount, self.base.asset_id))
        } else {
            Err(ValidationError::PriceAssetMismatch(a.asset_id).into())
        }
    }

    /// Converts rounding away from zero, for the debt-conservative side of a
    /// fill. Requires a non-negative input amount.
    pub fn convert_round_up(&self, a: AssetAmount) -> TidepoolResult<AssetAmount> {
        self.validate()?;
        let (num, den, out_asset) = if a.asset_id == self.base.asset_id {
            (
                a.amount.0 as i128 * self.quote.amount.0 as i128,
                self.base.amount.0 as i128,
                self.quote.asset_id,
            )
        } else if a.asset_id == self.quote.asset_id {
            (
                a.amount.0 as i128 * self.base.amount.0 as i128,
                self.quote.amount.0 as i128,
                self.base.asset_id,
            )
        } else {
            return Err(ValidationError::PriceAssetMismatch(a.asset_id).into());
        };
        let r = (num + den - 1) / den;
        let amount = i64::try_from(r).map_err(|_| ValidationError::AmountOverflow)?;
        Ok(AssetAmount::new(amount, out_asset))
    }

    /// Scales the ratio by `num/den`, reducing by gcd and halving both sides
    /// if the 128-bit intermediates would not fit back into amounts. The
    /// halving loses at most one bit of precision per step and preserves the
    /// orientation of every comparison the engine makes.
    pub fn mul_ratio(self, num: u16, den: u16) -> TidepoolResult<Price> {
        if num == 0 || den == 0 {
            return Err(ValidationError::InvalidPrice.into());
        }
        self.validate()?;
        let mut n = self.base.amount.0 as i128 * num as i128;
        let mut d = self.quote.amount.0 as i128 * den as i128;
        let g = gcd(n, d);
        n /= g;
        d /= g;
        while n > i64::MAX as i128 || d > i64::MAX as i128 {
            n >>= 1;
            d >>= 1;
        }
        Ok(Price {
            base: AssetAmount::new((n.max(1)) as i64, self.base.asset_id),
            quote: AssetAmount::new((d.max(1)) as i64, self.quote.asset_id),
        })
    }
}

/// Equality on the cross product, so `2:4` equals `1:2`.
impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        self.pair() == other.pair()
            && self.base.amount.0 as i128 * other.quote.amount.0 as i128
                == other.base.amount.0 as i128 * self.quote.amount.0 as i128
    }
}

impl Eq for Price {}

/// Total order: pair first, ratio second. Within one pair this is exactly the
/// cross-product order; across pairs it is an arbitrary but stable key order.
impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pair().cmp(&other.pair()).then_with(|| {
            let lhs = self.base.amount.0 as i128 * other.quote.amount.0 as i128;
            let rhs = other.base.amount.0 as i128 * self.quote.amount.0 as i128;
            lhs.cmp(&rhs)
        })
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.base, self.quote)
    }
}

fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.abs().max(1), b.abs().max(1));
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

// ================================================================================================
// Price feed
// ================================================================================================

/// One publisher's view of a market-issued asset.
///
/// `settlement_price` is quoted with the debt asset as base and the backing
/// collateral as quote. The collateral ratios are per-mille. The trigger
/// prices the engine actually compares against call orders are derived in
/// collateral-per-debt orientation, so a call order's own
/// `collateral : debt` ratio can be compared by cross product without any
/// further conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFeed {
    /// Debt per collateral.
    pub settlement_price: Price,
    /// Debt asset per core asset, used to convert fees.
    pub core_exchange_rate: Price,
    /// MCR, per-mille. Positions at or below it are in margin-call territory.
    pub maintenance_collateral_ratio: u16,
    /// MSSR, per-mille. Bounds the price at which a margin call may execute.
    pub maximum_short_squeeze_ratio: u16,
    /// ICR, per-mille. Enforced only at position mutation time, when present.
    pub initial_collateral_ratio: Option<u16>,
}

impl PriceFeed {
    pub fn validate(&self) -> TidepoolResult<()> {
        self.settlement_price.validate()?;
        self.core_exchange_rate.validate()?;
        let range = MIN_COLLATERAL_RATIO..=MAX_COLLATERAL_RATIO;
        if !range.contains(&self.maintenance_collateral_ratio) {
            return Err(ValidationError::McrOutOfRange(self.maintenance_collateral_ratio).into());
        }
        if !range.contains(&self.maximum_short_squeeze_ratio) {
            return Err(ValidationError::MssrOutOfRange(self.maximum_short_squeeze_ratio).into());
        }
        if let Some(icr) = self.initial_collateral_ratio {
            if !range.contains(&icr) {
                return Err(ValidationError::IcrOutOfRange(icr).into());
            }
        }
        Ok(())
    }

    /// Collateral-per-debt threshold below which a position is margin-called.
    pub fn maintenance_collateralization(&self) -> TidepoolResult<Price> {
        self.settlement_price
            .invert()
            .mul_ratio(self.maintenance_collateral_ratio, COLLATERAL_RATIO_DENOM)
    }

    /// Collateral-per-debt threshold a mutated position must reach, when the
    /// publisher supplied an ICR.
    pub fn initial_collateralization(&self) -> TidepoolResult<Option<Price>> {
        match self.initial_collateral_ratio {
            Some(icr) => Ok(Some(
                self.settlement_price
                    .invert()
                    .mul_ratio(icr, COLLATERAL_RATIO_DENOM)?,
            )),
            None => Ok(None),
        }
    }

    /// The margin-call order price: the collateral-per-debt level at which
    /// margin calls execute. A limit order demanding less collateral per unit
    /// of debt than this is not lifted by a call.
    pub fn margin_call_price(&self) -> TidepoolResult<Price> {
        self.settlement_price
            .invert()
            .mul_ratio(self.maximum_short_squeeze_ratio, COLLATERAL_RATIO_DENOM)
    }
}
