use serde::{Deserialize, Serialize};

use crate::{
    error::{TidepoolResult, ValidationError},
    impl_add_sub_primitive, impl_from_primitive, impl_neg_primitive,
    types::ids::AssetId,
};

/// Largest amount of any single asset that may ever exist on hand.
///
/// Chosen so that the product of two amounts always fits a 128-bit
/// intermediate with headroom for per-mille ratio scaling.
pub const MAX_SHARE_SUPPLY: i64 = (1 << 62) - 1;

/// A signed amount denominated in the smallest unit of some asset.
///
/// Deltas may be negative; amounts on hand satisfy
/// `0 <= amount <= MAX_SHARE_SUPPLY`. All ledger-visible arithmetic goes
/// through the checked methods, which surface overflow as a
/// [`ValidationError`] instead of wrapping.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Amount(pub i64);
impl_from_primitive!(Amount, i64);
impl_add_sub_primitive!(Amount, i64);
impl_neg_primitive!(Amount, i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// True iff the amount is a valid on-hand quantity.
    pub fn is_valid_supply(self) -> bool {
        (0..=MAX_SHARE_SUPPLY).contains(&self.0)
    }

    pub fn checked_add(self, rhs: Amount) -> TidepoolResult<Amount> {
        let sum = self
            .0
            .checked_add(rhs.0)
            .ok_or(ValidationError::AmountOverflow)?;
        Ok(Amount(sum))
    }

    pub fn checked_sub(self, rhs: Amount) -> TidepoolResult<Amount> {
        let diff = self
            .0
            .checked_sub(rhs.0)
            .ok_or(ValidationError::AmountOverflow)?;
        Ok(Amount(diff))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An amount tagged with the asset it is denominated in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct AssetAmount {
    pub amount: Amount,
    pub asset_id: AssetId,
}

impl AssetAmount {
    pub fn new(amount: impl Into<Amount>, asset_id: AssetId) -> Self {
        Self {
            amount: amount.into(),
            asset_id,
        }
    }

    pub fn zero(asset_id: AssetId) -> Self {
        Self {
            amount: Amount::ZERO,
            asset_id,
        }
    }
}

impl std::fmt::Display for AssetAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.amount, self.asset_id)
    }
}
