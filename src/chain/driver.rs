//! The transaction driver.
//!
//! Routes each operation to its evaluator through a per-kind table, wraps
//! every transaction in a nested undo session, and emits virtual operations
//! immediately after the operation that triggered them. The maintenance
//! entry point runs the interval work: expiry sweeps, feed re-aggregation,
//! settlement releases and collateral-bid revival.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info_span};

use crate::{
    asset::{
        feeds,
        flags,
        records::{AssetDynamicData, AssetRecord, BitassetData},
    },
    authority::{ensure_authorized, ensure_authorized_with_backing},
    chain::{
        hardfork::HardforkSchedule,
        operations::{BitassetOptions, Operation, OperationKind, OperationOutcome},
    },
    error::{
        AuthorizationError, ConsistencyError, FundsError, LifecycleError, TidepoolResult,
        ValidationError,
    },
    market::{
        call_order::CallOrder,
        limit_order::LimitOrder,
        matching, settlement,
        settlement::{CollateralBid, ForceSettlement},
    },
    registry::Registry,
    types::{
        AccountId, Amount, AssetAmount, AssetId, Price, MAX_SHARE_SUPPLY,
    },
    vesting::{CddVestingPolicy, VestingBalance, VestingPolicy},
};

/// Block number and time, supplied by the embedding chain. The core never
/// reads a wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub time: DateTime<Utc>,
}

/// A sequence of operations applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub operations: Vec<Operation>,
    pub expiration: DateTime<Utc>,
}

/// One entry of the operation-result stream observers consume: the operation
/// (real or virtual) plus its primary result tag.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub operation: Operation,
    pub result: OperationOutcome,
    pub is_virtual: bool,
}

/// Everything an evaluator may touch, scoped to one operation.
pub(crate) struct EvalContext<'a> {
    pub registry: &'a mut Registry,
    pub hardforks: &'a HardforkSchedule,
    pub block: BlockContext,
    pub core_asset: AssetId,
    pub applied: &'a mut Vec<AppliedOperation>,
}

impl EvalContext<'_> {
    pub fn emit_virtual(&mut self, operation: Operation) {
        self.applied.push(AppliedOperation {
            operation,
            result: OperationOutcome::None,
            is_virtual: true,
        });
    }

    pub fn feed_expiry_pre_fix(&self) -> bool {
        self.block.time < self.hardforks.feed_expiry_fix
    }

    pub fn backing_auth_active(&self) -> bool {
        self.block.time >= self.hardforks.backing_asset_authorization
    }

    pub fn icr_active(&self) -> bool {
        self.block.time >= self.hardforks.initial_collateral_ratio
    }

    pub fn pm_swan_guard_active(&self) -> bool {
        self.block.time >= self.hardforks.prediction_market_swan_guard
    }

    pub fn squeeze_guard_active(&self) -> bool {
        self.block.time >= self.hardforks.call_squeeze_guard
    }

    /// Charges the operation fee. Non-core fees convert through the asset's
    /// core exchange rate against its fee pool and accrue to the asset.
    fn pay_fee(&mut self, payer: AccountId, fee: AssetAmount) -> TidepoolResult<()> {
        if fee.amount.is_zero() {
            return Ok(());
        }
        let core = self.core_asset;
        if fee.asset_id == core {
            self.registry.adjust_balance(payer, core, -fee.amount)?;
            self.registry.modify_asset(core, |asset| -> TidepoolResult<()> {
                asset.dynamic.accumulated_fees =
                    asset.dynamic.accumulated_fees.checked_add(fee.amount)?;
                Ok(())
            })??;
            return Ok(());
        }
        ensure_authorized(self.registry, payer, fee.asset_id)?;
        let core_equivalent = {
            let asset = self.registry.asset(fee.asset_id)?;
            let converted = asset.options.core_exchange_rate.convert(fee)?;
            let pool = asset.dynamic.fee_pool;
            if pool.0 < converted.amount.0 {
                return Err(FundsError::InsufficientFeePool {
                    asset: fee.asset_id,
                    available: pool.0,
                    required: converted.amount.0,
                }
                .into());
            }
            converted.amount
        };
        self.registry.adjust_balance(payer, fee.asset_id, -fee.amount)?;
        self.registry.modify_asset(fee.asset_id, |asset| -> TidepoolResult<()> {
            asset.dynamic.accumulated_fees =
                asset.dynamic.accumulated_fees.checked_add(fee.amount)?;
            asset.dynamic.fee_pool = asset.dynamic.fee_pool.checked_sub(core_equivalent)?;
            Ok(())
        })??;
        // The pool drain is the network's core income.
        self.registry.modify_asset(core, |asset| -> TidepoolResult<()> {
            asset.dynamic.accumulated_fees =
                asset.dynamic.accumulated_fees.checked_add(core_equivalent)?;
            Ok(())
        })??;
        Ok(())
    }
}

trait OperationEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome>;
}

/// The deterministic state-transition core: the registry plus the evaluator
/// table and the hardfork schedule that conditions it.
pub struct Ledger {
    registry: Registry,
    hardforks: HardforkSchedule,
    core_asset: AssetId,
    evaluators: BTreeMap<OperationKind, Box<dyn OperationEvaluator>>,
}

impl Ledger {
    /// A fresh ledger holding only the core asset, issued by the network
    /// account.
    pub fn new(hardforks: HardforkSchedule) -> Self {
        let mut registry = Registry::new();
        let network = registry.create_account("network");
        let core_asset = registry
            .create_asset(AssetRecord {
                symbol: "CORE".to_string(),
                precision: 5,
                issuer: network,
                options: crate::asset::records::AssetOptions {
                    max_supply: Amount(MAX_SHARE_SUPPLY),
                    market_fee_percent: 0,
                    issuer_permissions: 0,
                    flags: 0,
                    core_exchange_rate: Price::identity(AssetId(0)),
                    whitelist_authorities: Default::default(),
                    blacklist_authorities: Default::default(),
                },
                dynamic: AssetDynamicData::default(),
                bitasset: None,
            })
            .expect("fresh registry has no symbol collisions");

        Self {
            registry,
            hardforks,
            core_asset,
            evaluators: evaluator_table(),
        }
    }

    pub fn core_asset(&self) -> AssetId {
        self.core_asset
    }

    pub fn hardforks(&self) -> &HardforkSchedule {
        &self.hardforks
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Ids touched by committed effects since the last drain, for observers.
    pub fn drain_changed_objects(&mut self) -> Vec<crate::registry::ChangedObject> {
        self.registry.drain_changed_objects()
    }

    /// Genesis funding: mints core directly into a balance, keeping supply
    /// conservation intact. Test and bootstrap use only.
    pub fn genesis_fund(&mut self, account: AccountId, amount: Amount) -> TidepoolResult<()> {
        self.registry.adjust_balance(account, self.core_asset, amount)?;
        let core = self.core_asset;
        self.registry.modify_asset(core, |asset| -> TidepoolResult<()> {
            asset.dynamic.adjust_supply(amount)
        })??;
        Ok(())
    }

    pub fn create_account(&mut self, name: impl Into<String>) -> AccountId {
        self.registry.create_account(name)
    }

    /// Applies one transaction under a nested session: all of it commits or
    /// none of it does. Returns the applied-operation stream, virtual
    /// operations interleaved after their triggers.
    pub fn push_transaction(
        &mut self,
        tx: &Transaction,
        block: BlockContext,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        let span = info_span!("transaction", block = block.number);
        let _enter = span.enter();

        if tx.operations.is_empty() {
            return Err(ValidationError::EmptyTransaction.into());
        }
        if tx.expiration < block.time {
            return Err(ValidationError::TransactionExpired(tx.expiration).into());
        }

        self.registry.start_session();
        let mut applied = Vec::new();
        for op in &tx.operations {
            if let Err(err) = self.apply_one(op, block, &mut applied) {
                debug!(kind = %op.kind(), %err, "operation rejected");
                self.registry.discard_session();
                return Err(err);
            }
        }
        self.registry.commit_session();
        Ok(applied)
    }

    /// Applies a block of transactions: any failure discards the whole block.
    pub fn apply_block(
        &mut self,
        txs: &[Transaction],
        block: BlockContext,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        self.registry.start_session();
        let mut applied = Vec::new();
        for tx in txs {
            match self.push_transaction(tx, block) {
                Ok(mut ops) => applied.append(&mut ops),
                Err(err) => {
                    self.registry.discard_session();
                    return Err(err);
                }
            }
        }
        self.registry.commit_session();
        Ok(applied)
    }

    fn apply_one(
        &mut self,
        op: &Operation,
        block: BlockContext,
        applied: &mut Vec<AppliedOperation>,
    ) -> TidepoolResult<OperationOutcome> {
        op.validate()?;
        let evaluator = self
            .evaluators
            .get(&op.kind())
            .expect("every submittable kind has an evaluator");

        let slot = applied.len();
        applied.push(AppliedOperation {
            operation: op.clone(),
            result: OperationOutcome::None,
            is_virtual: false,
        });

        let mut ctx = EvalContext {
            registry: &mut self.registry,
            hardforks: &self.hardforks,
            block,
            core_asset: self.core_asset,
            applied,
        };
        if let Some(fee) = op.fee() {
            let payer = op.fee_payer().expect("submittable operations have a payer");
            ctx.pay_fee(payer, fee)?;
        }
        let outcome = evaluator.evaluate(&mut ctx, op)?;
        applied[slot].result = outcome;
        Ok(outcome)
    }

    /// The maintenance interval: expire limit orders, re-aggregate feeds,
    /// release due force settlements under a fresh volume budget, and check
    /// collateral-bid revival. All of it commits atomically.
    pub fn apply_maintenance(
        &mut self,
        block: BlockContext,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        let span = info_span!("maintenance", block = block.number);
        let _enter = span.enter();

        self.registry.start_session();
        let mut applied = Vec::new();
        let result = self.run_maintenance(block, &mut applied);
        match result {
            Ok(()) => {
                self.registry.commit_session();
                Ok(applied)
            }
            Err(err) => {
                self.registry.discard_session();
                Err(err)
            }
        }
    }

    fn run_maintenance(
        &mut self,
        block: BlockContext,
        applied: &mut Vec<AppliedOperation>,
    ) -> TidepoolResult<()> {
        let mut ctx = EvalContext {
            registry: &mut self.registry,
            hardforks: &self.hardforks,
            block,
            core_asset: self.core_asset,
            applied,
        };

        // Expired limit orders return their escrow in full.
        for order_id in ctx.registry.expired_orders(block.time) {
            let order = ctx.registry.remove_limit_order(order_id)?;
            ctx.registry
                .adjust_balance(order.seller, order.sell_asset(), order.for_sale)?;
            if order.deferred_fee.is_positive() {
                ctx.registry
                    .adjust_balance(order.seller, ctx.core_asset, order.deferred_fee)?;
            }
        }

        let bitassets: Vec<AssetId> = ctx
            .registry
            .assets()
            .filter(|(_, record)| record.is_market_issued())
            .map(|(id, _)| id)
            .collect();

        for asset_id in bitassets {
            let pre_fix = ctx.feed_expiry_pre_fix();
            let now = ctx.block.time;
            ctx.registry.modify_asset(asset_id, |asset| {
                let bitasset = asset.bitasset.as_mut().expect("filtered market-issued");
                bitasset.force_settled_volume = Amount::ZERO;
                feeds::update_median_feeds(bitasset, now, pre_fix).map(|_| ())
            })??;

            matching::check_call_orders(&mut ctx, asset_id)?;
            settlement::execute_due_settlements(&mut ctx, asset_id)?;
            if settlement::check_bid_revival(&mut ctx, asset_id)? {
                matching::check_call_orders(&mut ctx, asset_id)?;
            }
        }
        Ok(())
    }
}

// ================================================================================================
// Evaluators
// ================================================================================================

fn evaluator_table() -> BTreeMap<OperationKind, Box<dyn OperationEvaluator>> {
    let mut table: BTreeMap<OperationKind, Box<dyn OperationEvaluator>> = BTreeMap::new();
    table.insert(OperationKind::Transfer, Box::new(TransferEvaluator));
    table.insert(OperationKind::LimitOrderCreate, Box::new(LimitOrderCreateEvaluator));
    table.insert(OperationKind::LimitOrderCancel, Box::new(LimitOrderCancelEvaluator));
    table.insert(OperationKind::CallOrderUpdate, Box::new(CallOrderUpdateEvaluator));
    table.insert(OperationKind::BidCollateral, Box::new(BidCollateralEvaluator));
    table.insert(OperationKind::AssetCreate, Box::new(AssetCreateEvaluator));
    table.insert(OperationKind::AssetUpdate, Box::new(AssetUpdateEvaluator));
    table.insert(OperationKind::AssetUpdateBitasset, Box::new(AssetUpdateBitassetEvaluator));
    table.insert(
        OperationKind::AssetUpdateFeedProducers,
        Box::new(AssetUpdateFeedProducersEvaluator),
    );
    table.insert(OperationKind::AssetUpdateIssuer, Box::new(AssetUpdateIssuerEvaluator));
    table.insert(OperationKind::AssetPublishFeed, Box::new(AssetPublishFeedEvaluator));
    table.insert(OperationKind::AssetSettle, Box::new(AssetSettleEvaluator));
    table.insert(OperationKind::AssetGlobalSettle, Box::new(AssetGlobalSettleEvaluator));
    table.insert(OperationKind::AssetIssue, Box::new(AssetIssueEvaluator));
    table.insert(OperationKind::AssetReserve, Box::new(AssetReserveEvaluator));
    table.insert(OperationKind::AssetFundFeePool, Box::new(AssetFundFeePoolEvaluator));
    table.insert(OperationKind::VestingBalanceCreate, Box::new(VestingBalanceCreateEvaluator));
    table.insert(
        OperationKind::VestingBalanceWithdraw,
        Box::new(VestingBalanceWithdrawEvaluator),
    );
    table.insert(OperationKind::AccountWhitelist, Box::new(AccountWhitelistEvaluator));
    table
}

struct TransferEvaluator;

impl OperationEvaluator for TransferEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::Transfer { from, to, amount, .. } = op else {
            unreachable!("dispatch mismatch")
        };
        let asset = ctx.registry.asset(amount.asset_id)?;
        if asset.options.flags & flags::TRANSFER_RESTRICTED != 0
            && asset.issuer != *from
            && asset.issuer != *to
        {
            return Err(AuthorizationError::AssetHolding {
                account: *from,
                asset: amount.asset_id,
            }
            .into());
        }
        ensure_authorized(ctx.registry, *from, amount.asset_id)?;
        ensure_authorized(ctx.registry, *to, amount.asset_id)?;
        ctx.registry.adjust_balance(*from, amount.asset_id, -amount.amount)?;
        ctx.registry.adjust_balance(*to, amount.asset_id, amount.amount)?;
        Ok(OperationOutcome::None)
    }
}

struct LimitOrderCreateEvaluator;

impl OperationEvaluator for LimitOrderCreateEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::LimitOrderCreate {
            seller,
            amount_to_sell,
            min_to_receive,
            expiration,
            fill_or_kill,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ensure_authorized(ctx.registry, *seller, amount_to_sell.asset_id)?;
        ensure_authorized(ctx.registry, *seller, min_to_receive.asset_id)?;
        ctx.registry
            .adjust_balance(*seller, amount_to_sell.asset_id, -amount_to_sell.amount)?;

        let order_id = ctx.registry.insert_limit_order(LimitOrder {
            seller: *seller,
            for_sale: amount_to_sell.amount,
            sell_price: Price::new(*amount_to_sell, *min_to_receive),
            expiration: *expiration,
            deferred_fee: Amount::ZERO,
        });

        let fully_filled = matching::match_new_limit_order(ctx, order_id)?;
        if *fill_or_kill && !fully_filled {
            return Err(LifecycleError::FillOrKillUnfilled.into());
        }
        Ok(OperationOutcome::LimitOrder(order_id))
    }
}

struct LimitOrderCancelEvaluator;

impl OperationEvaluator for LimitOrderCancelEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::LimitOrderCancel {
            fee_paying_account,
            order,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        let record = ctx.registry.limit_order(*order)?;
        if record.seller != *fee_paying_account {
            return Err(AuthorizationError::NotOrderOwner {
                account: *fee_paying_account,
            }
            .into());
        }
        let record = ctx.registry.remove_limit_order(*order)?;
        ctx.registry
            .adjust_balance(record.seller, record.sell_asset(), record.for_sale)?;
        if record.deferred_fee.is_positive() {
            // Deferred fees are always core-denominated.
            ctx.registry
                .adjust_balance(record.seller, ctx.core_asset, record.deferred_fee)?;
        }
        Ok(OperationOutcome::Paid(AssetAmount::new(
            record.for_sale,
            record.sell_asset(),
        )))
    }
}

struct CallOrderUpdateEvaluator;

impl OperationEvaluator for CallOrderUpdateEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::CallOrderUpdate {
            funding_account,
            delta_collateral,
            delta_debt,
            target_collateral_ratio,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        let payer = *funding_account;
        let debt_asset_id = delta_debt.asset_id;

        let bitasset = ctx
            .registry
            .asset(debt_asset_id)?
            .bitasset
            .clone()
            .ok_or(ConsistencyError::NotMarketIssued(debt_asset_id))?;
        if bitasset.has_settlement() {
            return Err(ConsistencyError::AlreadyGloballySettled(debt_asset_id).into());
        }
        if delta_collateral.asset_id != bitasset.backing_asset {
            return Err(ValidationError::PriceAssetMismatch(delta_collateral.asset_id).into());
        }
        ensure_authorized(ctx.registry, payer, debt_asset_id)?;
        ensure_authorized(ctx.registry, payer, bitasset.backing_asset)?;

        let existing = ctx.registry.find_call_order(payer, debt_asset_id);
        let (old_collateral, old_debt) = match existing {
            Some(id) => {
                let call = ctx.registry.call_order(id)?;
                (call.collateral.amount, call.debt.amount)
            }
            None => {
                if !delta_collateral.amount.is_positive() || !delta_debt.amount.is_positive() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                (Amount::ZERO, Amount::ZERO)
            }
        };
        let new_collateral = old_collateral.checked_add(delta_collateral.amount)?;
        let new_debt = old_debt.checked_add(delta_debt.amount)?;
        if new_debt.is_negative() {
            return Err(ConsistencyError::CoverExceedsDebt {
                cover: -delta_debt.amount.0,
                debt: old_debt.0,
            }
            .into());
        }
        if new_collateral.is_negative() {
            return Err(FundsError::InsufficientCollateral {
                order: existing.unwrap_or_default(),
                available: old_collateral.0,
                required: -delta_collateral.amount.0,
            }
            .into());
        }
        if new_debt.is_zero() && !new_collateral.is_zero() {
            return Err(ConsistencyError::ResidualCollateral.into());
        }

        // Balance flows: collateral in or out, debt minted or burned.
        if !delta_collateral.amount.is_zero() {
            ctx.registry
                .adjust_balance(payer, bitasset.backing_asset, -delta_collateral.amount)?;
        }
        if !delta_debt.amount.is_zero() {
            ctx.registry
                .adjust_balance(payer, debt_asset_id, delta_debt.amount)?;
            let max_supply = ctx.registry.asset(debt_asset_id)?.options.max_supply;
            ctx.registry.modify_asset(debt_asset_id, |asset| -> TidepoolResult<()> {
                asset.dynamic.adjust_supply(delta_debt.amount)
            })??;
            let supply = ctx.registry.asset(debt_asset_id)?.dynamic.current_supply;
            if supply.0 > max_supply.0 {
                return Err(ConsistencyError::SupplyExceeded {
                    asset: debt_asset_id,
                    amount: delta_debt.amount.0,
                    max: max_supply.0,
                }
                .into());
            }
        }

        if new_debt.is_zero() {
            let id = existing.expect("covering requires an existing position");
            ctx.registry.remove_call_order(id)?;
            matching::check_call_orders(ctx, debt_asset_id)?;
            return Ok(OperationOutcome::None);
        }

        let updated = CallOrder {
            borrower: payer,
            collateral: AssetAmount::new(new_collateral, bitasset.backing_asset),
            debt: AssetAmount::new(new_debt, debt_asset_id),
            target_collateral_ratio: match target_collateral_ratio {
                Some(0) | None => None,
                Some(t) => Some(*t),
            },
        };

        if bitasset.is_prediction_market {
            if new_collateral != new_debt {
                return Err(ConsistencyError::PredictionMarketMismatch.into());
            }
        } else {
            let increases_risk =
                delta_debt.amount.is_positive() || delta_collateral.amount.is_negative();
            if delta_debt.amount.is_positive() && bitasset.current_feed().is_none() {
                return Err(ConsistencyError::NoFeed(debt_asset_id).into());
            }
            if let Some(maintenance) = bitasset.current_maintenance_collateralization {
                if updated.is_called(maintenance)? {
                    return Err(ConsistencyError::Undercollateralized {
                        order: existing.unwrap_or_default(),
                    }
                    .into());
                }
                if ctx.icr_active() && increases_risk {
                    if let Some(initial) = bitasset.current_initial_collateralization {
                        if updated.collateralization().cmp_ratio(&initial)?.is_lt() {
                            return Err(ConsistencyError::Undercollateralized {
                                order: existing.unwrap_or_default(),
                            }
                            .into());
                        }
                    }
                }
            }
        }

        let id = match existing {
            Some(id) => {
                ctx.registry.modify_call_order(id, |call| *call = updated.clone())?;
                id
            }
            None => ctx.registry.insert_call_order(updated),
        };

        matching::check_call_orders(ctx, debt_asset_id)?;
        Ok(OperationOutcome::CallOrder(id))
    }
}

struct BidCollateralEvaluator;

impl OperationEvaluator for BidCollateralEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::BidCollateral {
            bidder,
            additional_collateral,
            debt_covered,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        let asset_id = debt_covered.asset_id;
        let (bitasset, supply) = {
            let asset = ctx.registry.asset(asset_id)?;
            (
                asset
                    .bitasset
                    .clone()
                    .ok_or(ConsistencyError::NotMarketIssued(asset_id))?,
                asset.dynamic.current_supply,
            )
        };
        if !bitasset.has_settlement() {
            return Err(ConsistencyError::BidOutsideSettlement.into());
        }
        if additional_collateral.asset_id != bitasset.backing_asset {
            return Err(ValidationError::PriceAssetMismatch(additional_collateral.asset_id).into());
        }
        if debt_covered.amount.0 > supply.0 {
            return Err(ConsistencyError::CoverExceedsDebt {
                cover: debt_covered.amount.0,
                debt: supply.0,
            }
            .into());
        }
        // The backing-asset gate arrived with a hardfork; the earlier
        // omission is preserved for replay.
        ensure_authorized_with_backing(ctx.registry, *bidder, asset_id, ctx.backing_auth_active())?;

        if let Some(old) = ctx.registry.find_bid(*bidder, asset_id) {
            let old_bid = ctx.registry.remove_bid(old)?;
            ctx.registry.adjust_balance(
                *bidder,
                old_bid.collateral.asset_id,
                old_bid.collateral.amount,
            )?;
        }
        ctx.registry.adjust_balance(
            *bidder,
            additional_collateral.asset_id,
            -additional_collateral.amount,
        )?;
        let id = ctx.registry.insert_bid(CollateralBid {
            bidder: *bidder,
            collateral: *additional_collateral,
            debt: *debt_covered,
        });
        Ok(OperationOutcome::Bid(id))
    }
}

struct AssetCreateEvaluator;

impl OperationEvaluator for AssetCreateEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetCreate {
            issuer,
            symbol,
            precision,
            common_options,
            bitasset_options,
            is_prediction_market,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ctx.registry.account(*issuer)?;

        let bitasset = match bitasset_options {
            Some(options) => {
                ctx.registry.asset(options.backing_asset)?;
                if !ctx.icr_active() && options.initial_collateral_ratio.is_some() {
                    return Err(ConsistencyError::IcrBeforeActivation.into());
                }
                if *is_prediction_market && options.backing_asset != ctx.core_asset {
                    return Err(ValidationError::InvalidBitassetParameter("backing_asset").into());
                }
                let mut data = apply_bitasset_options(BitassetData::new(options.backing_asset), options);
                data.is_prediction_market = *is_prediction_market;
                Some(data)
            }
            None => None,
        };

        let id = ctx.registry.create_asset(AssetRecord {
            symbol: symbol.clone(),
            precision: *precision,
            issuer: *issuer,
            options: common_options.clone(),
            dynamic: AssetDynamicData::default(),
            bitasset,
        })?;
        Ok(OperationOutcome::Asset(id))
    }
}

fn apply_bitasset_options(mut data: BitassetData, options: &BitassetOptions) -> BitassetData {
    data.backing_asset = options.backing_asset;
    data.feed_lifetime_sec = options.feed_lifetime_sec;
    data.minimum_feeds = options.minimum_feeds;
    data.force_settlement_delay_sec = options.force_settlement_delay_sec;
    data.force_settlement_offset_percent = options.force_settlement_offset_percent;
    data.maximum_force_settlement_volume = options.maximum_force_settlement_volume;
    data.margin_call_fee_ratio = options.margin_call_fee_ratio;
    data.initial_collateral_ratio = options.initial_collateral_ratio;
    data
}

fn ensure_issuer(
    ctx: &EvalContext<'_>,
    claimed: AccountId,
    asset_id: AssetId,
) -> TidepoolResult<()> {
    let asset = ctx.registry.asset(asset_id)?;
    if asset.issuer != claimed {
        return Err(AuthorizationError::NotIssuer {
            account: claimed,
            asset: asset_id,
        }
        .into());
    }
    Ok(())
}

struct AssetUpdateEvaluator;

impl OperationEvaluator for AssetUpdateEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetUpdate {
            issuer,
            asset_to_update,
            new_options,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ensure_issuer(ctx, *issuer, *asset_to_update)?;
        let asset = ctx.registry.asset(*asset_to_update)?;
        if asset.dynamic.current_supply.is_positive()
            && new_options.issuer_permissions & !asset.options.issuer_permissions != 0
        {
            return Err(ConsistencyError::PermissionWiden.into());
        }
        let valid_mask = if asset.is_market_issued() {
            flags::is_valid_mia_permissions(new_options.issuer_permissions)
        } else {
            flags::is_valid_uia_permissions(new_options.issuer_permissions)
        };
        if !valid_mask {
            return Err(ValidationError::FlagsOutsidePermissions {
                flags: new_options.flags,
                permissions: new_options.issuer_permissions,
            }
            .into());
        }
        let new_options = new_options.clone();
        ctx.registry.modify_asset(*asset_to_update, |asset| {
            asset.options = new_options;
        })?;
        Ok(OperationOutcome::None)
    }
}

struct AssetUpdateBitassetEvaluator;

impl OperationEvaluator for AssetUpdateBitassetEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetUpdateBitasset {
            issuer,
            asset_to_update,
            new_options,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ensure_issuer(ctx, *issuer, *asset_to_update)?;
        let asset = ctx.registry.asset(*asset_to_update)?;
        let bitasset = asset
            .bitasset
            .as_ref()
            .ok_or(ConsistencyError::NotMarketIssued(*asset_to_update))?;
        if new_options.backing_asset != bitasset.backing_asset
            && asset.dynamic.current_supply.is_positive()
        {
            return Err(ConsistencyError::BackingChangeWithSupply.into());
        }
        if !ctx.icr_active() && new_options.initial_collateral_ratio.is_some() {
            return Err(ConsistencyError::IcrBeforeActivation.into());
        }
        ctx.registry.asset(new_options.backing_asset)?;

        let pre_fix = ctx.feed_expiry_pre_fix();
        let now = ctx.block.time;
        let changed = ctx.registry.modify_asset(*asset_to_update, |asset| {
            let data = asset.bitasset.take().expect("checked market-issued above");
            let mut data = apply_bitasset_options(data, new_options);
            let changed = feeds::update_median_feeds(&mut data, now, pre_fix);
            asset.bitasset = Some(data);
            changed
        })??;
        if changed {
            matching::check_call_orders(ctx, *asset_to_update)?;
        }
        Ok(OperationOutcome::None)
    }
}

struct AssetUpdateFeedProducersEvaluator;

impl OperationEvaluator for AssetUpdateFeedProducersEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetUpdateFeedProducers {
            issuer,
            asset_to_update,
            new_feed_producers,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ensure_issuer(ctx, *issuer, *asset_to_update)?;
        for producer in new_feed_producers {
            ctx.registry.account(*producer)?;
        }
        ctx.registry
            .asset(*asset_to_update)?
            .bitasset
            .as_ref()
            .ok_or(ConsistencyError::NotMarketIssued(*asset_to_update))?;

        let pre_fix = ctx.feed_expiry_pre_fix();
        let now = ctx.block.time;
        let producers = new_feed_producers.clone();
        let changed = ctx.registry.modify_asset(*asset_to_update, |asset| {
            let bitasset = asset.bitasset.as_mut().expect("checked market-issued above");
            bitasset.feed_producers = producers;
            // Feeds from dropped producers no longer count.
            let keep = bitasset.feed_producers.clone();
            bitasset.feeds.retain(|producer, _| keep.contains(producer));
            feeds::update_median_feeds(bitasset, now, pre_fix)
        })??;
        if changed {
            matching::check_call_orders(ctx, *asset_to_update)?;
        }
        Ok(OperationOutcome::None)
    }
}

struct AssetUpdateIssuerEvaluator;

impl OperationEvaluator for AssetUpdateIssuerEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetUpdateIssuer {
            issuer,
            asset_to_update,
            new_issuer,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ensure_issuer(ctx, *issuer, *asset_to_update)?;
        ctx.registry.account(*new_issuer)?;
        let new_issuer = *new_issuer;
        ctx.registry.modify_asset(*asset_to_update, |asset| {
            asset.issuer = new_issuer;
        })?;
        Ok(OperationOutcome::None)
    }
}

struct AssetPublishFeedEvaluator;

impl OperationEvaluator for AssetPublishFeedEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetPublishFeed {
            publisher,
            asset_id,
            feed,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        let (bitasset, issuer) = {
            let asset = ctx.registry.asset(*asset_id)?;
            (
                asset
                    .bitasset
                    .clone()
                    .ok_or(ValidationError::FeedOnNonBitasset(*asset_id))?,
                asset.issuer,
            )
        };
        if *publisher != issuer && !bitasset.feed_producers.contains(publisher) {
            return Err(AuthorizationError::NotFeedProducer {
                account: *publisher,
                asset: *asset_id,
            }
            .into());
        }
        if feed.settlement_price.pair() != (*asset_id, bitasset.backing_asset) {
            return Err(ValidationError::PricePairMismatch.into());
        }
        if feed.core_exchange_rate.pair() != (*asset_id, ctx.core_asset) {
            return Err(ValidationError::PricePairMismatch.into());
        }
        if !ctx.icr_active() && feed.initial_collateral_ratio.is_some() {
            return Err(ConsistencyError::IcrBeforeActivation.into());
        }

        let pre_fix = ctx.feed_expiry_pre_fix();
        let now = ctx.block.time;
        let publisher = *publisher;
        let feed = *feed;
        let changed = ctx.registry.modify_asset(*asset_id, |asset| {
            let bitasset = asset.bitasset.as_mut().expect("checked market-issued above");
            // The issuer publishes without being in the producer set; count
            // it as a live feed all the same.
            if !bitasset.feed_producers.contains(&publisher) {
                bitasset.feed_producers.insert(publisher);
            }
            bitasset.feeds.insert(publisher, (now, feed));
            feeds::update_median_feeds(bitasset, now, pre_fix)
        })??;
        if changed {
            matching::check_call_orders(ctx, *asset_id)?;
        }
        Ok(OperationOutcome::None)
    }
}

struct AssetSettleEvaluator;

impl OperationEvaluator for AssetSettleEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetSettle { account, amount, .. } = op else {
            unreachable!("dispatch mismatch")
        };
        let asset_id = amount.asset_id;
        let (bitasset, can_force_settle) = {
            let asset = ctx.registry.asset(asset_id)?;
            (
                asset
                    .bitasset
                    .clone()
                    .ok_or(ConsistencyError::NotMarketIssued(asset_id))?,
                asset.can_force_settle(),
            )
        };
        ensure_authorized_with_backing(ctx.registry, *account, asset_id, ctx.backing_auth_active())?;

        if bitasset.has_settlement() {
            // Post-swan settlement is immediate and delay-free.
            ctx.registry.adjust_balance(*account, asset_id, -amount.amount)?;
            let received = settlement::redeem_from_fund(ctx, asset_id, *account, *amount)?;
            return Ok(OperationOutcome::Paid(received));
        }

        if bitasset.is_prediction_market {
            return Err(LifecycleError::PredictionMarketSettle(asset_id).into());
        }
        if !can_force_settle {
            return Err(ConsistencyError::ForceSettleDisabled(asset_id).into());
        }
        if bitasset.current_feed().is_none() {
            return Err(ConsistencyError::NoFeed(asset_id).into());
        }

        ctx.registry.adjust_balance(*account, asset_id, -amount.amount)?;
        let id = ctx.registry.insert_settlement(ForceSettlement {
            owner: *account,
            balance: *amount,
            settlement_date: ctx.block.time
                + chrono::Duration::seconds(bitasset.force_settlement_delay_sec),
        });
        Ok(OperationOutcome::Settlement(Some(id)))
    }
}

struct AssetGlobalSettleEvaluator;

impl OperationEvaluator for AssetGlobalSettleEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetGlobalSettle {
            issuer,
            asset_to_settle,
            settle_price,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ensure_issuer(ctx, *issuer, *asset_to_settle)?;
        let asset = ctx.registry.asset(*asset_to_settle)?;
        if !asset.can_global_settle() {
            return Err(ConsistencyError::GlobalSettleNotPermitted(*asset_to_settle).into());
        }
        let bitasset = asset
            .bitasset
            .as_ref()
            .ok_or(ConsistencyError::NotMarketIssued(*asset_to_settle))?;
        if bitasset.has_settlement() {
            return Err(ConsistencyError::AlreadyGloballySettled(*asset_to_settle).into());
        }
        if settle_price.pair() != (*asset_to_settle, bitasset.backing_asset) {
            return Err(ValidationError::PricePairMismatch.into());
        }
        settlement::globally_settle(ctx, *asset_to_settle, *settle_price)?;
        Ok(OperationOutcome::None)
    }
}

struct AssetIssueEvaluator;

impl OperationEvaluator for AssetIssueEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetIssue {
            issuer,
            asset_to_issue,
            issue_to_account,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        let asset_id = asset_to_issue.asset_id;
        ensure_issuer(ctx, *issuer, asset_id)?;
        let asset = ctx.registry.asset(asset_id)?;
        if asset.is_market_issued() {
            return Err(LifecycleError::IssueMarketIssued(asset_id).into());
        }
        let max_supply = asset.options.max_supply;
        let new_supply = asset
            .dynamic
            .current_supply
            .checked_add(asset_to_issue.amount)?;
        if new_supply.0 > max_supply.0 {
            return Err(ConsistencyError::SupplyExceeded {
                asset: asset_id,
                amount: asset_to_issue.amount.0,
                max: max_supply.0,
            }
            .into());
        }
        ensure_authorized(ctx.registry, *issue_to_account, asset_id)?;
        ctx.registry
            .adjust_balance(*issue_to_account, asset_id, asset_to_issue.amount)?;
        ctx.registry.modify_asset(asset_id, |asset| {
            asset.dynamic.current_supply = new_supply;
        })?;
        Ok(OperationOutcome::None)
    }
}

struct AssetReserveEvaluator;

impl OperationEvaluator for AssetReserveEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetReserve {
            payer,
            amount_to_reserve,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        let asset_id = amount_to_reserve.asset_id;
        if ctx.registry.asset(asset_id)?.is_market_issued() {
            return Err(LifecycleError::ReserveMarketIssued(asset_id).into());
        }
        ensure_authorized(ctx.registry, *payer, asset_id)?;
        ctx.registry
            .adjust_balance(*payer, asset_id, -amount_to_reserve.amount)?;
        ctx.registry.modify_asset(asset_id, |asset| -> TidepoolResult<()> {
            asset.dynamic.adjust_supply(-amount_to_reserve.amount)
        })??;
        Ok(OperationOutcome::None)
    }
}

struct AssetFundFeePoolEvaluator;

impl OperationEvaluator for AssetFundFeePoolEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AssetFundFeePool {
            from_account,
            asset_id,
            amount,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ctx.registry.asset(*asset_id)?;
        ctx.registry
            .adjust_balance(*from_account, ctx.core_asset, -*amount)?;
        let amount = *amount;
        ctx.registry.modify_asset(*asset_id, |asset| -> TidepoolResult<()> {
            asset.dynamic.fee_pool = asset.dynamic.fee_pool.checked_add(amount)?;
            Ok(())
        })??;
        Ok(OperationOutcome::None)
    }
}

struct VestingBalanceCreateEvaluator;

impl OperationEvaluator for VestingBalanceCreateEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::VestingBalanceCreate {
            creator,
            owner,
            amount,
            vesting_seconds,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ctx.registry.account(*owner)?;
        // Both sides of the escrow pass the holding gate: the creator is
        // giving the asset up, the owner will receive it back.
        ensure_authorized(ctx.registry, *creator, amount.asset_id)?;
        ensure_authorized(ctx.registry, *owner, amount.asset_id)?;
        ctx.registry
            .adjust_balance(*creator, amount.asset_id, -amount.amount)?;
        let id = ctx.registry.insert_vesting_balance(VestingBalance {
            owner: *owner,
            balance: *amount,
            policy: VestingPolicy::Cdd(CddVestingPolicy::new(*vesting_seconds, ctx.block.time)),
        });
        Ok(OperationOutcome::VestingBalance(id))
    }
}

struct VestingBalanceWithdrawEvaluator;

impl OperationEvaluator for VestingBalanceWithdrawEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::VestingBalanceWithdraw {
            vesting_balance,
            owner,
            amount,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        let record = ctx.registry.vesting_balance(*vesting_balance)?;
        if record.owner != *owner {
            return Err(AuthorizationError::NotVestingOwner { account: *owner }.into());
        }
        if record.balance.asset_id != amount.asset_id || amount.amount.0 > record.balance.amount.0 {
            return Err(FundsError::InsufficientBalance {
                account: *owner,
                asset: amount.asset_id,
                available: record.balance.amount.0,
                required: amount.amount.0,
            }
            .into());
        }
        let now = ctx.block.time;
        let withdraw = *amount;
        ctx.registry
            .modify_vesting_balance(*vesting_balance, |vb| vb.withdraw(withdraw.amount, now))?;
        ctx.registry
            .adjust_balance(*owner, amount.asset_id, amount.amount)?;
        if ctx
            .registry
            .vesting_balance(*vesting_balance)?
            .balance
            .amount
            .is_zero()
        {
            ctx.registry.remove_vesting_balance(*vesting_balance)?;
        }
        Ok(OperationOutcome::Paid(*amount))
    }
}

struct AccountWhitelistEvaluator;

impl OperationEvaluator for AccountWhitelistEvaluator {
    fn evaluate(
        &self,
        ctx: &mut EvalContext<'_>,
        op: &Operation,
    ) -> TidepoolResult<OperationOutcome> {
        let Operation::AccountWhitelist {
            authorizing_account,
            account_to_list,
            new_listing,
            ..
        } = op
        else {
            unreachable!("dispatch mismatch")
        };
        ctx.registry.account(*account_to_list)?;
        let target = *account_to_list;
        let listing = *new_listing;
        ctx.registry.modify_account(*authorizing_account, |account| {
            if listing.whitelists() {
                account.whitelisted.insert(target);
            } else {
                account.whitelisted.remove(&target);
            }
            if listing.blacklists() {
                account.blacklisted.insert(target);
            } else {
                account.blacklisted.remove(&target);
            }
        })?;
        Ok(OperationOutcome::None)
    }
}
