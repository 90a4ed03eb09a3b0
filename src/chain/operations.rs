//! The operation sum type and its static validation.
//!
//! One variant per user operation, plus the virtual variants the engine
//! emits for side-effects (fills, settlements, seizures, accepted bids).
//! Virtual variants never validate: a transaction containing one is rejected
//! before evaluation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumDiscriminants, EnumString, IntoStaticStr};

use crate::{
    asset::records::{validate_precision, validate_symbol, AssetOptions},
    error::{LifecycleError, TidepoolResult, ValidationError},
    types::{
        AccountId, Amount, AssetAmount, AssetId, CallOrderId, CollateralBidId, ForceSettlementId,
        LimitOrderId, Price, PriceFeed, VestingBalanceId,
    },
};

/// Creation-time parameters of the collateral contract behind a bitasset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitassetOptions {
    pub backing_asset: AssetId,
    pub feed_lifetime_sec: i64,
    pub minimum_feeds: u8,
    pub force_settlement_delay_sec: i64,
    pub force_settlement_offset_percent: u16,
    pub maximum_force_settlement_volume: u16,
    pub margin_call_fee_ratio: u16,
    pub initial_collateral_ratio: Option<u16>,
}

impl BitassetOptions {
    pub fn validate(&self) -> TidepoolResult<()> {
        if self.feed_lifetime_sec <= 0 {
            return Err(ValidationError::InvalidBitassetParameter("feed_lifetime_sec").into());
        }
        if self.force_settlement_delay_sec < 0 {
            return Err(
                ValidationError::InvalidBitassetParameter("force_settlement_delay_sec").into(),
            );
        }
        if self.minimum_feeds == 0 {
            return Err(ValidationError::InvalidBitassetParameter("minimum_feeds").into());
        }
        if self.force_settlement_offset_percent >= 1000 {
            return Err(
                ValidationError::InvalidBitassetParameter("force_settlement_offset_percent").into(),
            );
        }
        if self.maximum_force_settlement_volume > 1000 {
            return Err(
                ValidationError::InvalidBitassetParameter("maximum_force_settlement_volume").into(),
            );
        }
        if self.margin_call_fee_ratio > 1000 {
            return Err(ValidationError::InvalidBitassetParameter("margin_call_fee_ratio").into());
        }
        if let Some(icr) = self.initial_collateral_ratio {
            if !(crate::types::MIN_COLLATERAL_RATIO..=crate::types::MAX_COLLATERAL_RATIO)
                .contains(&icr)
            {
                return Err(ValidationError::IcrOutOfRange(icr).into());
            }
        }
        Ok(())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ListingKind {
    NoListing,
    WhiteListed,
    BlackListed,
    WhiteAndBlackListed,
}

impl ListingKind {
    pub fn whitelists(self) -> bool {
        matches!(self, ListingKind::WhiteListed | ListingKind::WhiteAndBlackListed)
    }

    pub fn blacklists(self) -> bool {
        matches!(self, ListingKind::BlackListed | ListingKind::WhiteAndBlackListed)
    }
}

/// Reference to the order-like object on one side of a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRef {
    Limit(LimitOrderId),
    Call(CallOrderId),
    Settlement(ForceSettlementId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(
    name(OperationKind),
    derive(Display, EnumString, IntoStaticStr, PartialOrd, Ord, Hash),
    strum(serialize_all = "snake_case")
)]
pub enum Operation {
    Transfer {
        fee: AssetAmount,
        from: AccountId,
        to: AccountId,
        amount: AssetAmount,
    },
    LimitOrderCreate {
        fee: AssetAmount,
        seller: AccountId,
        amount_to_sell: AssetAmount,
        min_to_receive: AssetAmount,
        expiration: Option<DateTime<Utc>>,
        fill_or_kill: bool,
    },
    LimitOrderCancel {
        fee: AssetAmount,
        fee_paying_account: AccountId,
        order: LimitOrderId,
    },
    CallOrderUpdate {
        fee: AssetAmount,
        funding_account: AccountId,
        delta_collateral: AssetAmount,
        delta_debt: AssetAmount,
        target_collateral_ratio: Option<u16>,
    },
    BidCollateral {
        fee: AssetAmount,
        bidder: AccountId,
        additional_collateral: AssetAmount,
        debt_covered: AssetAmount,
    },
    AssetCreate {
        fee: AssetAmount,
        issuer: AccountId,
        symbol: String,
        precision: u8,
        common_options: AssetOptions,
        bitasset_options: Option<BitassetOptions>,
        is_prediction_market: bool,
    },
    AssetUpdate {
        fee: AssetAmount,
        issuer: AccountId,
        asset_to_update: AssetId,
        new_options: AssetOptions,
    },
    AssetUpdateBitasset {
        fee: AssetAmount,
        issuer: AccountId,
        asset_to_update: AssetId,
        new_options: BitassetOptions,
    },
    AssetUpdateFeedProducers {
        fee: AssetAmount,
        issuer: AccountId,
        asset_to_update: AssetId,
        new_feed_producers: BTreeSet<AccountId>,
    },
    AssetUpdateIssuer {
        fee: AssetAmount,
        issuer: AccountId,
        asset_to_update: AssetId,
        new_issuer: AccountId,
    },
    AssetPublishFeed {
        fee: AssetAmount,
        publisher: AccountId,
        asset_id: AssetId,
        feed: PriceFeed,
    },
    AssetSettle {
        fee: AssetAmount,
        account: AccountId,
        amount: AssetAmount,
    },
    AssetGlobalSettle {
        fee: AssetAmount,
        issuer: AccountId,
        asset_to_settle: AssetId,
        /// Debt per collateral.
        settle_price: Price,
    },
    AssetIssue {
        fee: AssetAmount,
        issuer: AccountId,
        asset_to_issue: AssetAmount,
        issue_to_account: AccountId,
    },
    AssetReserve {
        fee: AssetAmount,
        payer: AccountId,
        amount_to_reserve: AssetAmount,
    },
    AssetFundFeePool {
        fee: AssetAmount,
        from_account: AccountId,
        asset_id: AssetId,
        /// Core asset.
        amount: Amount,
    },
    VestingBalanceCreate {
        fee: AssetAmount,
        creator: AccountId,
        owner: AccountId,
        amount: AssetAmount,
        vesting_seconds: i64,
    },
    VestingBalanceWithdraw {
        fee: AssetAmount,
        vesting_balance: VestingBalanceId,
        owner: AccountId,
        amount: AssetAmount,
    },
    AccountWhitelist {
        fee: AssetAmount,
        authorizing_account: AccountId,
        account_to_list: AccountId,
        new_listing: ListingKind,
    },

    // ------------------------------------------------------------------------------------------
    // Virtual operations: emitted by the engine, never submitted.
    // ------------------------------------------------------------------------------------------
    FillOrder {
        order: OrderRef,
        account: AccountId,
        pays: AssetAmount,
        receives: AssetAmount,
        fee: AssetAmount,
        is_maker: bool,
    },
    ExecuteSettlement {
        settlement: ForceSettlementId,
        owner: AccountId,
        settled: AssetAmount,
        received: AssetAmount,
    },
    GlobalSettlementSeize {
        order: CallOrderId,
        borrower: AccountId,
        debt: AssetAmount,
        collateral_taken: AssetAmount,
    },
    BidAccepted {
        bid: CollateralBidId,
        bidder: AccountId,
        debt_covered: AssetAmount,
        collateral: AssetAmount,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        OperationKind::from(self)
    }

    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            Operation::FillOrder { .. }
                | Operation::ExecuteSettlement { .. }
                | Operation::GlobalSettlementSeize { .. }
                | Operation::BidAccepted { .. }
        )
    }

    /// The declared operation fee. Virtual operations carry no fee.
    pub fn fee(&self) -> Option<AssetAmount> {
        match self {
            Operation::Transfer { fee, .. }
            | Operation::LimitOrderCreate { fee, .. }
            | Operation::LimitOrderCancel { fee, .. }
            | Operation::CallOrderUpdate { fee, .. }
            | Operation::BidCollateral { fee, .. }
            | Operation::AssetCreate { fee, .. }
            | Operation::AssetUpdate { fee, .. }
            | Operation::AssetUpdateBitasset { fee, .. }
            | Operation::AssetUpdateFeedProducers { fee, .. }
            | Operation::AssetUpdateIssuer { fee, .. }
            | Operation::AssetPublishFeed { fee, .. }
            | Operation::AssetSettle { fee, .. }
            | Operation::AssetGlobalSettle { fee, .. }
            | Operation::AssetIssue { fee, .. }
            | Operation::AssetReserve { fee, .. }
            | Operation::AssetFundFeePool { fee, .. }
            | Operation::VestingBalanceCreate { fee, .. }
            | Operation::VestingBalanceWithdraw { fee, .. }
            | Operation::AccountWhitelist { fee, .. } => Some(*fee),
            Operation::FillOrder { .. }
            | Operation::ExecuteSettlement { .. }
            | Operation::GlobalSettlementSeize { .. }
            | Operation::BidAccepted { .. } => None,
        }
    }

    /// The account that pays the fee and authorizes the operation.
    pub fn fee_payer(&self) -> Option<AccountId> {
        match self {
            Operation::Transfer { from, .. } => Some(*from),
            Operation::LimitOrderCreate { seller, .. } => Some(*seller),
            Operation::LimitOrderCancel {
                fee_paying_account, ..
            } => Some(*fee_paying_account),
            Operation::CallOrderUpdate {
                funding_account, ..
            } => Some(*funding_account),
            Operation::BidCollateral { bidder, .. } => Some(*bidder),
            Operation::AssetCreate { issuer, .. }
            | Operation::AssetUpdate { issuer, .. }
            | Operation::AssetUpdateBitasset { issuer, .. }
            | Operation::AssetUpdateFeedProducers { issuer, .. }
            | Operation::AssetUpdateIssuer { issuer, .. }
            | Operation::AssetIssue { issuer, .. } => Some(*issuer),
            Operation::AssetPublishFeed { publisher, .. } => Some(*publisher),
            Operation::AssetSettle { account, .. } => Some(*account),
            Operation::AssetGlobalSettle { issuer, .. } => Some(*issuer),
            Operation::AssetReserve { payer, .. } => Some(*payer),
            Operation::AssetFundFeePool { from_account, .. } => Some(*from_account),
            Operation::VestingBalanceCreate { creator, .. } => Some(*creator),
            Operation::VestingBalanceWithdraw { owner, .. } => Some(*owner),
            Operation::AccountWhitelist {
                authorizing_account,
                ..
            } => Some(*authorizing_account),
            _ => None,
        }
    }

    /// State-independent validation. Anything touching the registry belongs
    /// in the evaluators instead.
    pub fn validate(&self) -> TidepoolResult<()> {
        if let Some(fee) = self.fee() {
            if fee.amount.is_negative() {
                return Err(ValidationError::NegativeFee.into());
            }
        }
        match self {
            Operation::Transfer { amount, from, to, .. } => {
                if !amount.amount.is_positive() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                if from == to {
                    return Err(ValidationError::SelfTransfer.into());
                }
                Ok(())
            }
            Operation::LimitOrderCreate {
                amount_to_sell,
                min_to_receive,
                ..
            } => {
                if amount_to_sell.asset_id == min_to_receive.asset_id {
                    return Err(ValidationError::IdenticalAssetPair.into());
                }
                if !amount_to_sell.amount.is_positive() || !min_to_receive.amount.is_positive() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::CallOrderUpdate {
                delta_collateral,
                delta_debt,
                ..
            } => {
                if delta_collateral.asset_id == delta_debt.asset_id {
                    return Err(ValidationError::IdenticalDebtCollateral.into());
                }
                Ok(())
            }
            Operation::BidCollateral {
                additional_collateral,
                debt_covered,
                ..
            } => {
                if additional_collateral.asset_id == debt_covered.asset_id {
                    return Err(ValidationError::IdenticalDebtCollateral.into());
                }
                if !additional_collateral.amount.is_positive()
                    || !debt_covered.amount.is_positive()
                {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::AssetCreate {
                symbol,
                precision,
                common_options,
                bitasset_options,
                is_prediction_market,
                ..
            } => {
                validate_symbol(symbol)?;
                validate_precision(*precision)?;
                common_options.validate()?;
                if let Some(bitasset) = bitasset_options {
                    bitasset.validate()?;
                    if !crate::asset::flags::is_valid_mia_permissions(
                        common_options.issuer_permissions,
                    ) {
                        return Err(ValidationError::FlagsOutsidePermissions {
                            flags: common_options.flags,
                            permissions: common_options.issuer_permissions,
                        }
                        .into());
                    }
                    // Resolution by issuer settlement is all a prediction
                    // market has; it cannot be created without the switch.
                    if *is_prediction_market
                        && common_options.issuer_permissions & crate::asset::flags::GLOBAL_SETTLE
                            == 0
                    {
                        return Err(ValidationError::FlagsOutsidePermissions {
                            flags: common_options.flags,
                            permissions: common_options.issuer_permissions,
                        }
                        .into());
                    }
                } else {
                    if *is_prediction_market {
                        return Err(ValidationError::PredictionMarketRequiresBitasset.into());
                    }
                    if !crate::asset::flags::is_valid_uia_permissions(
                        common_options.issuer_permissions,
                    ) {
                        return Err(ValidationError::FlagsOutsidePermissions {
                            flags: common_options.flags,
                            permissions: common_options.issuer_permissions,
                        }
                        .into());
                    }
                }
                Ok(())
            }
            Operation::AssetUpdate { new_options, .. } => new_options.validate(),
            Operation::AssetUpdateBitasset { new_options, .. } => new_options.validate(),
            Operation::AssetPublishFeed { feed, .. } => feed.validate(),
            Operation::AssetSettle { amount, .. } => {
                if amount.amount.is_negative() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::AssetGlobalSettle { settle_price, .. } => settle_price.validate(),
            Operation::AssetIssue { asset_to_issue, .. } => {
                if !asset_to_issue.amount.is_positive() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::AssetReserve {
                amount_to_reserve, ..
            } => {
                if !amount_to_reserve.amount.is_positive() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::AssetFundFeePool { amount, .. } => {
                if !amount.is_positive() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::VestingBalanceCreate {
                amount,
                vesting_seconds,
                ..
            } => {
                if !amount.amount.is_positive() || *vesting_seconds <= 0 {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::VestingBalanceWithdraw { amount, .. } => {
                if !amount.amount.is_positive() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                Ok(())
            }
            Operation::AccountWhitelist {
                authorizing_account,
                account_to_list,
                ..
            } => {
                if authorizing_account == account_to_list {
                    return Err(ValidationError::SelfListing.into());
                }
                Ok(())
            }
            Operation::FillOrder { .. }
            | Operation::ExecuteSettlement { .. }
            | Operation::GlobalSettlementSeize { .. }
            | Operation::BidAccepted { .. } => {
                Err(LifecycleError::VirtualOperationSubmitted.into())
            }
            _ => Ok(()),
        }
    }
}

/// The primary result tag of an applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOutcome {
    None,
    Asset(AssetId),
    LimitOrder(LimitOrderId),
    CallOrder(CallOrderId),
    /// A queued settlement request; immediate post-swan redemptions report
    /// `Paid` instead.
    Settlement(Option<ForceSettlementId>),
    Bid(CollateralBidId),
    VestingBalance(VestingBalanceId),
    Paid(AssetAmount),
}
