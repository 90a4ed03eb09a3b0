use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    asset::flags,
    error::{TidepoolResult, ValidationError},
    sorted_vec_map::SortedVecMap,
    types::{AccountId, Amount, AssetId, Price, PriceFeed, MAX_SHARE_SUPPLY},
};

/// Longest admissible asset symbol.
const MAX_SYMBOL_LEN: usize = 16;
const MIN_SYMBOL_LEN: usize = 3;
const MAX_PRECISION: u8 = 12;

/// Issuer-chosen parameters of an asset. `flags` must stay within
/// `issuer_permissions` at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetOptions {
    pub max_supply: Amount,
    /// Per-mille fee charged on the receiving side of fills.
    pub market_fee_percent: u16,
    pub issuer_permissions: u16,
    pub flags: u16,
    /// This asset per core asset; converts fees paid in this asset.
    pub core_exchange_rate: Price,
    pub whitelist_authorities: BTreeSet<AccountId>,
    pub blacklist_authorities: BTreeSet<AccountId>,
}

impl AssetOptions {
    pub fn validate(&self) -> TidepoolResult<()> {
        if !self.max_supply.is_positive() || self.max_supply.0 > MAX_SHARE_SUPPLY {
            return Err(ValidationError::InvalidMaxSupply(self.max_supply.0).into());
        }
        if self.market_fee_percent > 1000 {
            return Err(ValidationError::MarketFeeOutOfRange(self.market_fee_percent).into());
        }
        if self.flags & !self.issuer_permissions != 0 {
            return Err(ValidationError::FlagsOutsidePermissions {
                flags: self.flags,
                permissions: self.issuer_permissions,
            }
            .into());
        }
        self.core_exchange_rate.validate()?;
        Ok(())
    }
}

/// Supply and fee state that changes on nearly every operation touching the
/// asset, kept separate from the static options in the source material and
/// separate here for the same reason: cheap before-images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDynamicData {
    pub current_supply: Amount,
    pub confidential_supply: Amount,
    /// Fees accumulated in this asset (market fees, non-core operation fees).
    pub accumulated_fees: Amount,
    /// Fees accumulated in the backing asset (margin-call fees).
    pub accumulated_collateral_fees: Amount,
    /// Core-asset pool that pays for fee conversion.
    pub fee_pool: Amount,
}

impl AssetDynamicData {
    /// Applies a signed supply delta, failing closed on overflow or a
    /// negative result instead of recording a corrupted supply.
    pub fn adjust_supply(&mut self, delta: Amount) -> TidepoolResult<()> {
        let next = self.current_supply.checked_add(delta)?;
        if next.is_negative() {
            return Err(ValidationError::AmountOutOfRange(next.0).into());
        }
        self.current_supply = next;
        Ok(())
    }
}

/// The resolved end state of a black swan or an issuer-invoked settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettlement {
    /// Debt per collateral, as seized.
    pub price: Price,
    /// Backing-asset fund the remaining supply redeems against.
    pub fund: Amount,
}

/// Everything that exists only for market-issued assets: the collateral
/// contract, the feed store and the aggregation results derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitassetData {
    pub backing_asset: AssetId,
    pub feed_lifetime_sec: i64,
    pub minimum_feeds: u8,
    pub force_settlement_delay_sec: i64,
    /// Per-mille withheld from force-settlement payouts.
    pub force_settlement_offset_percent: u16,
    /// Per-mille of current supply that may force-settle per interval.
    pub maximum_force_settlement_volume: u16,
    /// Per-mille of margin-call collateral diverted to collateral fees.
    pub margin_call_fee_ratio: u16,
    /// Asset-level ICR; overrides the feed median when present.
    pub initial_collateral_ratio: Option<u16>,
    pub is_prediction_market: bool,

    pub feed_producers: BTreeSet<AccountId>,
    /// Latest publication per producer.
    pub feeds: SortedVecMap<AccountId, (DateTime<Utc>, PriceFeed)>,

    /// Per-field median over live feeds; `None` while below `minimum_feeds`.
    pub median_feed: Option<PriceFeed>,
    /// Oldest publication that contributed to the median.
    pub current_feed_publication_time: Option<DateTime<Utc>>,
    /// Collateral-per-debt margin-call threshold derived from the median.
    pub current_maintenance_collateralization: Option<Price>,
    /// Collateral-per-debt mutation threshold, when an ICR is in effect.
    pub current_initial_collateralization: Option<Price>,

    pub settlement: Option<GlobalSettlement>,
    /// Amount force-settled in the current maintenance interval.
    pub force_settled_volume: Amount,
}

impl BitassetData {
    pub fn new(backing_asset: AssetId) -> Self {
        Self {
            backing_asset,
            feed_lifetime_sec: 24 * 60 * 60,
            minimum_feeds: 1,
            force_settlement_delay_sec: 24 * 60 * 60,
            force_settlement_offset_percent: 0,
            maximum_force_settlement_volume: 20,
            margin_call_fee_ratio: 0,
            initial_collateral_ratio: None,
            is_prediction_market: false,
            feed_producers: BTreeSet::new(),
            feeds: SortedVecMap::new(),
            median_feed: None,
            current_feed_publication_time: None,
            current_maintenance_collateralization: None,
            current_initial_collateralization: None,
            settlement: None,
            force_settled_volume: Amount::ZERO,
        }
    }

    pub fn has_settlement(&self) -> bool {
        self.settlement.is_some()
    }

    /// The feed the engine currently trades against: the median with the
    /// asset-level ICR override applied.
    pub fn current_feed(&self) -> Option<PriceFeed> {
        let mut feed = self.median_feed?;
        if self.initial_collateral_ratio.is_some() {
            feed.initial_collateral_ratio = self.initial_collateral_ratio;
        }
        Some(feed)
    }

    /// Whether a publication from `feed_time` is stale at `now`.
    ///
    /// The pre-fix comparison is inclusive, expiring feeds one second early.
    /// Historical blocks replay against that behavior, so both senses are
    /// kept and selected by the caller's hardfork state.
    pub fn feed_is_expired(&self, feed_time: DateTime<Utc>, now: DateTime<Utc>, pre_fix: bool) -> bool {
        let deadline = feed_time + chrono::Duration::seconds(self.feed_lifetime_sec);
        if pre_fix {
            deadline <= now
        } else {
            deadline < now
        }
    }
}

/// One asset: identity, issuer-chosen options, supply dynamics and, for
/// market-issued assets, the collateral contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub symbol: String,
    pub precision: u8,
    /// Immutable at creation; transferable only through the issuer-update
    /// operation.
    pub issuer: AccountId,
    pub options: AssetOptions,
    pub dynamic: AssetDynamicData,
    pub bitasset: Option<BitassetData>,
}

impl AssetRecord {
    pub fn is_market_issued(&self) -> bool {
        self.bitasset.is_some()
    }

    pub fn is_prediction_market(&self) -> bool {
        self.bitasset
            .as_ref()
            .map(|b| b.is_prediction_market)
            .unwrap_or(false)
    }

    pub fn can_global_settle(&self) -> bool {
        self.options.issuer_permissions & flags::GLOBAL_SETTLE != 0
    }

    pub fn charges_market_fees(&self) -> bool {
        self.options.flags & flags::CHARGE_MARKET_FEE != 0
    }

    pub fn can_force_settle(&self) -> bool {
        self.options.flags & flags::DISABLE_FORCE_SETTLE == 0
    }

    pub fn uses_whitelist(&self) -> bool {
        self.options.flags & flags::WHITE_LIST != 0
    }
}

/// Symbol rules: 3 to 16 characters, uppercase letters, digits and dots,
/// starting and ending with a letter.
pub fn validate_symbol(symbol: &str) -> TidepoolResult<()> {
    let bytes = symbol.as_bytes();
    let len_ok = (MIN_SYMBOL_LEN..=MAX_SYMBOL_LEN).contains(&bytes.len());
    let charset_ok = bytes
        .iter()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == b'.');
    let ends_ok = bytes.first().is_some_and(|c| c.is_ascii_uppercase())
        && bytes.last().is_some_and(|c| c.is_ascii_uppercase());
    if !(len_ok && charset_ok && ends_ok) {
        return Err(ValidationError::InvalidSymbol(symbol.to_string()).into());
    }
    Ok(())
}

pub fn validate_precision(precision: u8) -> TidepoolResult<()> {
    if precision > MAX_PRECISION {
        return Err(ValidationError::InvalidPrecision(precision).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_rules() {
        assert!(validate_symbol("USDBIT").is_ok());
        assert!(validate_symbol("BTC.B").is_ok());
        assert!(validate_symbol("AB").is_err()); // too short
        assert!(validate_symbol("abcdef").is_err()); // lowercase
        assert!(validate_symbol("1BC").is_err()); // starts with digit
        assert!(validate_symbol("ABC.").is_err()); // ends with dot
        assert!(validate_symbol("TOOLONGSYMBOLXXXX").is_err());
    }

    #[test]
    fn flags_must_stay_within_permissions() {
        let options = AssetOptions {
            max_supply: Amount(1_000_000),
            market_fee_percent: 0,
            issuer_permissions: flags::CHARGE_MARKET_FEE,
            flags: flags::CHARGE_MARKET_FEE | flags::WHITE_LIST,
            core_exchange_rate: Price::identity(AssetId(0)),
            whitelist_authorities: BTreeSet::new(),
            blacklist_authorities: BTreeSet::new(),
        };
        assert!(options.validate().is_err());
    }
}
