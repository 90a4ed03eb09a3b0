//! Activation timestamps for behavior switches.
//!
//! Historical blocks must replay bit-for-bit, so both sides of every switch
//! live in the engine forever and each call site branches on
//! `block_time >= threshold`. The thresholds themselves are configuration
//! supplied by the embedding chain, never constants baked in here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardforkSchedule {
    /// Fixes the off-by-one in feed expiry: before this, a feed was retired
    /// exactly at its deadline instead of after it.
    pub feed_expiry_fix: DateTime<Utc>,
    /// Extends the holding gate of `force_settle` and `bid_collateral` to the
    /// backing asset. The earlier omission is a preserved bug.
    pub backing_asset_authorization: DateTime<Utc>,
    /// Introduces the initial collateral ratio: stricter collateralization on
    /// debt-increasing mutations, and ICR fields in feeds and options.
    pub initial_collateral_ratio: DateTime<Utc>,
    /// Stops prediction-market feeds from triggering global settlement.
    pub prediction_market_swan_guard: DateTime<Utc>,
    /// Margin calls stop lifting limit orders priced below the
    /// max-short-squeeze level.
    pub call_squeeze_guard: DateTime<Utc>,
}

impl HardforkSchedule {
    /// Every switch already active: the behavior of a freshly started chain.
    pub fn all_active() -> Self {
        Self {
            feed_expiry_fix: DateTime::<Utc>::MIN_UTC,
            backing_asset_authorization: DateTime::<Utc>::MIN_UTC,
            initial_collateral_ratio: DateTime::<Utc>::MIN_UTC,
            prediction_market_swan_guard: DateTime::<Utc>::MIN_UTC,
            call_squeeze_guard: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// No switch active: the original behavior, bugs included.
    pub fn none_active() -> Self {
        Self {
            feed_expiry_fix: DateTime::<Utc>::MAX_UTC,
            backing_asset_authorization: DateTime::<Utc>::MAX_UTC,
            initial_collateral_ratio: DateTime::<Utc>::MAX_UTC,
            prediction_market_swan_guard: DateTime::<Utc>::MAX_UTC,
            call_squeeze_guard: DateTime::<Utc>::MAX_UTC,
        }
    }
}
