//! Coin-days-destroyed vesting.
//!
//! A balance earns `balance * seconds` of coin-seconds as time passes, capped
//! at `balance * vesting_seconds`. Withdrawing `w` spends `w * vesting_seconds`
//! of the earned budget, so a fresh deposit takes the full vesting period to
//! mature while an aged balance can be drawn down gradually.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{FundsError, TidepoolResult},
    types::{AccountId, Amount, AssetAmount},
};

/// The policy seam: the ledger only ships coin-days-destroyed, but the
/// withdrawal path is written against the enum so further schedules slot in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VestingPolicy {
    Cdd(CddVestingPolicy),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CddVestingPolicy {
    pub vesting_seconds: i64,
    /// Earned budget; `i128` because `balance * vesting_seconds` exceeds 64
    /// bits long before either factor is unusual.
    pub coin_seconds_earned: i128,
    pub coin_seconds_earned_last_update: DateTime<Utc>,
}

impl CddVestingPolicy {
    pub fn new(vesting_seconds: i64, start: DateTime<Utc>) -> Self {
        Self {
            vesting_seconds,
            coin_seconds_earned: 0,
            coin_seconds_earned_last_update: start,
        }
    }

    /// Ages the earned coin-seconds up to `now`. Idempotent for equal `now`.
    pub fn update(&mut self, balance: Amount, now: DateTime<Utc>) {
        let elapsed = (now - self.coin_seconds_earned_last_update)
            .num_seconds()
            .clamp(0, self.vesting_seconds);
        let cap = balance.0 as i128 * self.vesting_seconds as i128;
        self.coin_seconds_earned =
            (self.coin_seconds_earned + elapsed as i128 * balance.0 as i128).min(cap);
        self.coin_seconds_earned_last_update = now;
    }

    /// Whether `amount` may be withdrawn after aging to `now`, and the
    /// coin-seconds it would spend.
    pub fn check_withdraw(&self, amount: Amount) -> TidepoolResult<i128> {
        let required = amount.0 as i128 * self.vesting_seconds as i128;
        if self.coin_seconds_earned < required {
            return Err(FundsError::VestingImmature {
                earned: self.coin_seconds_earned,
                required,
            }
            .into());
        }
        Ok(required)
    }
}

/// An escrowed balance releasing under a vesting policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VestingBalance {
    pub owner: AccountId,
    pub balance: AssetAmount,
    pub policy: VestingPolicy,
}

impl VestingBalance {
    /// Ages the policy, then deposits. The deposit itself earns nothing yet;
    /// only the aging cap grows with the larger balance.
    pub fn deposit(&mut self, amount: Amount, now: DateTime<Utc>) {
        let VestingPolicy::Cdd(policy) = &mut self.policy;
        policy.update(self.balance.amount, now);
        self.balance.amount += amount;
    }

    /// Ages the policy, checks admissibility, and withdraws.
    pub fn withdraw(&mut self, amount: Amount, now: DateTime<Utc>) -> TidepoolResult<()> {
        let VestingPolicy::Cdd(policy) = &mut self.policy;
        policy.update(self.balance.amount, now);
        let spent = policy.check_withdraw(amount)?;
        policy.coin_seconds_earned -= spent;
        self.balance.amount -= amount;
        Ok(())
    }
}
