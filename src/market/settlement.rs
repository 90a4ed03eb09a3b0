//! Settlement protocols: the delayed force-settlement queue, global
//! settlement (black swan or issuer-invoked), and collateral bidding with
//! revival.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    chain::{driver::EvalContext, operations::Operation},
    error::{ConsistencyError, TidepoolResult},
    market::call_order::CallOrder,
    types::{
        AccountId, Amount, AssetAmount, AssetId, CollateralBidId, Price, COLLATERAL_RATIO_DENOM,
    },
    asset::records::GlobalSettlement,
};

/// A holder's escrowed request to redeem debt against collateral after the
/// per-asset delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceSettlement {
    pub owner: AccountId,
    pub balance: AssetAmount,
    pub settlement_date: DateTime<Utc>,
}

/// An offer to take over `debt` of a globally settled asset against
/// `collateral`, ranked by `collateral / debt` descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralBid {
    pub bidder: AccountId,
    pub collateral: AssetAmount,
    pub debt: AssetAmount,
}

impl CollateralBid {
    /// Collateral per debt: the inverse swan price the bidder is willing to
    /// revive at.
    pub fn price(&self) -> Price {
        Price::new(self.collateral, self.debt)
    }
}

/// Seizes every call order of `asset_id` at `price` (debt per collateral)
/// into the settlement fund. Excess collateral returns to the borrowers;
/// seizures are emitted ordered by borrower id then order id.
pub(crate) fn globally_settle(
    ctx: &mut EvalContext<'_>,
    asset_id: AssetId,
    price: Price,
) -> TidepoolResult<()> {
    if ctx
        .registry
        .asset(asset_id)?
        .bitasset
        .as_ref()
        .is_none_or(|b| b.has_settlement())
    {
        return Err(ConsistencyError::AlreadyGloballySettled(asset_id).into());
    }

    let mut seizures: Vec<(AccountId, crate::types::CallOrderId)> = Vec::new();
    for call_id in ctx.registry.call_orders_by_collateralization(asset_id) {
        seizures.push((ctx.registry.call_order(call_id)?.borrower, call_id));
    }
    seizures.sort();

    let mut fund = Amount::ZERO;
    for (borrower, call_id) in seizures {
        let call = ctx.registry.remove_call_order(call_id)?;
        let owed = price.convert_round_up(call.debt)?;
        let taken = owed.amount.min(call.collateral.amount);
        let refund = call.collateral.amount.checked_sub(taken)?;
        if refund.is_positive() {
            ctx.registry
                .adjust_balance(borrower, call.collateral.asset_id, refund)?;
        }
        fund = fund.checked_add(taken)?;
        ctx.emit_virtual(Operation::GlobalSettlementSeize {
            order: call_id,
            borrower,
            debt: call.debt,
            collateral_taken: AssetAmount::new(taken, call.collateral.asset_id),
        });
    }

    info!(%asset_id, %price, fund = fund.0, "global settlement");
    ctx.registry.modify_asset(asset_id, |asset| {
        let bitasset = asset.bitasset.as_mut().expect("checked market-issued above");
        bitasset.settlement = Some(GlobalSettlement { price, fund });
    })?;
    Ok(())
}

/// Pays a holder out of the settlement fund at the recorded seizure price.
/// Burns the redeemed supply. Used both for immediate post-swan settles and
/// for queued requests that matured into a settled asset.
pub(crate) fn redeem_from_fund(
    ctx: &mut EvalContext<'_>,
    asset_id: AssetId,
    owner: AccountId,
    amount: AssetAmount,
) -> TidepoolResult<AssetAmount> {
    let (settlement, backing_asset) = {
        let asset = ctx.registry.asset(asset_id)?;
        let bitasset = asset
            .bitasset
            .as_ref()
            .ok_or(ConsistencyError::NotMarketIssued(asset_id))?;
        (
            bitasset
                .settlement
                .ok_or(ConsistencyError::NotGloballySettled(asset_id))?,
            bitasset.backing_asset,
        )
    };

    let paid = settlement
        .price
        .convert(amount)?
        .amount
        .min(settlement.fund);
    ctx.registry.modify_asset(asset_id, |asset| -> TidepoolResult<()> {
        let bitasset = asset.bitasset.as_mut().expect("checked market-issued above");
        let fund = bitasset.settlement.as_mut().expect("checked settled above");
        fund.fund = fund.fund.checked_sub(paid)?;
        asset.dynamic.adjust_supply(-amount.amount)?;
        Ok(())
    })??;
    ctx.registry
        .adjust_balance(owner, backing_asset, paid)?;
    Ok(AssetAmount::new(paid, backing_asset))
}

/// Executes the due part of the settlement queue for one asset at
/// maintenance time, respecting the per-interval volume cap.
pub(crate) fn execute_due_settlements(
    ctx: &mut EvalContext<'_>,
    asset_id: AssetId,
) -> TidepoolResult<()> {
    let now = ctx.block.time;
    let due = ctx.registry.due_settlements(asset_id, now);
    if due.is_empty() {
        return Ok(());
    }

    let bitasset = ctx
        .registry
        .asset(asset_id)?
        .bitasset
        .clone()
        .ok_or(ConsistencyError::NotMarketIssued(asset_id))?;

    if bitasset.has_settlement() {
        // Post-swan: the whole queue redeems from the fund, cap-free.
        for settlement_id in due {
            let request = ctx.registry.remove_settlement(settlement_id)?;
            let received = redeem_from_fund(ctx, asset_id, request.owner, request.balance)?;
            ctx.emit_virtual(Operation::ExecuteSettlement {
                settlement: settlement_id,
                owner: request.owner,
                settled: request.balance,
                received,
            });
        }
        return Ok(());
    }

    let Some(feed) = bitasset.current_feed() else {
        // No price to settle at: requests are returned rather than left to
        // rot in the queue.
        for settlement_id in due {
            let request = ctx.registry.remove_settlement(settlement_id)?;
            ctx.registry
                .adjust_balance(request.owner, asset_id, request.balance.amount)?;
        }
        return Ok(());
    };

    // Payout price: collateral per debt, shaved by the settlement offset.
    let payout_price = feed.settlement_price.invert().mul_ratio(
        1000 - bitasset.force_settlement_offset_percent,
        1000,
    )?;

    let supply = ctx.registry.asset(asset_id)?.dynamic.current_supply;
    let interval_cap = Amount(
        (supply.0 as i128 * bitasset.maximum_force_settlement_volume as i128 / 1000) as i64,
    );
    let mut settled_so_far = bitasset.force_settled_volume;

    for settlement_id in due {
        let request = ctx.registry.settlement(settlement_id)?.clone();
        let budget = interval_cap.checked_sub(settled_so_far)?;
        if !budget.is_positive() {
            debug!(%asset_id, "force-settlement volume cap reached");
            break;
        }
        let to_settle = request.balance.amount.min(budget);
        let settled =
            settle_against_calls(ctx, asset_id, &request, to_settle, payout_price, settlement_id)?;
        settled_so_far = settled_so_far.checked_add(settled)?;
        if settled < request.balance.amount {
            // Partially done: the remainder waits for the next interval.
            if settled.is_positive() {
                ctx.registry.modify_settlement(settlement_id, |s| {
                    s.balance.amount -= settled;
                })?;
            }
            break;
        }
        ctx.registry.remove_settlement(settlement_id)?;
    }

    ctx.registry.modify_asset(asset_id, |asset| {
        let bitasset = asset.bitasset.as_mut().expect("checked market-issued above");
        bitasset.force_settled_volume = settled_so_far;
    })?;
    Ok(())
}

/// Fills a settlement request against the least collateralized calls at the
/// (offset-shaved) feed price. Returns how much debt actually settled.
fn settle_against_calls(
    ctx: &mut EvalContext<'_>,
    asset_id: AssetId,
    request: &ForceSettlement,
    cap: Amount,
    payout_price: Price,
    settlement_id: crate::types::ForceSettlementId,
) -> TidepoolResult<Amount> {
    let mut remaining = cap;
    let mut collected = Amount::ZERO;
    let mut settled = Amount::ZERO;

    while remaining.is_positive() {
        let Some(&call_id) = ctx
            .registry
            .call_orders_by_collateralization(asset_id)
            .first()
        else {
            break;
        };
        let call = ctx.registry.call_order(call_id)?.clone();
        let covered = remaining.min(call.debt.amount);
        let paid = payout_price
            .convert(AssetAmount::new(covered, asset_id))?
            .amount
            .min(call.collateral.amount);

        let debt_left = call.debt.amount.checked_sub(covered)?;
        let collateral_left = call.collateral.amount.checked_sub(paid)?;
        if debt_left.is_zero() {
            ctx.registry.remove_call_order(call_id)?;
            if collateral_left.is_positive() {
                ctx.registry
                    .adjust_balance(call.borrower, call.collateral.asset_id, collateral_left)?;
            }
        } else {
            ctx.registry.modify_call_order(call_id, |c| {
                c.debt.amount = debt_left;
                c.collateral.amount = collateral_left;
            })?;
        }

        remaining -= covered;
        settled = settled.checked_add(covered)?;
        collected = collected.checked_add(paid)?;
    }

    if settled.is_positive() {
        let backing = ctx
            .registry
            .asset(asset_id)?
            .bitasset
            .as_ref()
            .expect("market-issued")
            .backing_asset;
        ctx.registry.modify_asset(asset_id, |asset| -> TidepoolResult<()> {
            asset.dynamic.adjust_supply(-settled)
        })??;
        ctx.registry
            .adjust_balance(request.owner, backing, collected)?;
        ctx.emit_virtual(Operation::ExecuteSettlement {
            settlement: settlement_id,
            owner: request.owner,
            settled: AssetAmount::new(settled, asset_id),
            received: AssetAmount::new(collected, backing),
        });
    }
    Ok(settled)
}

/// Revives a globally settled asset from collateral bids when the best bids
/// jointly cover the outstanding supply at a price no worse than
/// `MCR * settlement`. Accepted bids become call orders and inherit the
/// settlement fund pro-rata; everything else is refunded.
pub(crate) fn check_bid_revival(ctx: &mut EvalContext<'_>, asset_id: AssetId) -> TidepoolResult<bool> {
    let bitasset = match ctx.registry.asset(asset_id)?.bitasset.clone() {
        Some(b) if b.has_settlement() => b,
        _ => return Ok(false),
    };
    let settlement = bitasset.settlement.expect("checked settled above");
    let outstanding = ctx.registry.asset(asset_id)?.dynamic.current_supply;

    if outstanding.is_zero() {
        // Everything redeemed; any fund residue is a rounding artifact.
        ctx.registry.modify_asset(asset_id, |asset| -> TidepoolResult<()> {
            let bitasset = asset.bitasset.as_mut().expect("market-issued");
            let residue = bitasset.settlement.take().map(|s| s.fund).unwrap_or(Amount::ZERO);
            asset.dynamic.accumulated_collateral_fees =
                asset.dynamic.accumulated_collateral_fees.checked_add(residue)?;
            Ok(())
        })??;
        info!(%asset_id, "revived with zero outstanding supply");
        return Ok(true);
    }

    // Bids must beat MCR times the current feed; without a live feed the
    // asset stays settled.
    let Some(feed) = bitasset.current_feed() else {
        return Ok(false);
    };
    let threshold = feed
        .settlement_price
        .invert()
        .mul_ratio(feed.maintenance_collateral_ratio, COLLATERAL_RATIO_DENOM)?;

    let mut taken: Vec<CollateralBidId> = Vec::new();
    let mut covered = Amount::ZERO;
    for bid_id in ctx.registry.bids_by_price(asset_id) {
        let bid = ctx.registry.bid(bid_id)?;
        if bid.price().cmp_ratio(&threshold)?.is_lt() {
            break;
        }
        covered = covered.checked_add(bid.debt.amount)?;
        taken.push(bid_id);
        if covered.0 >= outstanding.0 {
            break;
        }
    }
    if covered.0 < outstanding.0 {
        return Ok(false);
    }

    info!(%asset_id, bids = taken.len(), "reviving from collateral bids");

    // Accepted in bid order; the last bid is truncated to the remaining
    // debt, and the last fund share absorbs the division remainder.
    let total_debt = outstanding;
    let fund = settlement.fund;
    let mut remaining_debt = outstanding;
    let mut fund_distributed = Amount::ZERO;

    for (i, bid_id) in taken.iter().enumerate() {
        let bid = ctx.registry.remove_bid(*bid_id)?;
        let debt_part = bid.debt.amount.min(remaining_debt);
        let collateral_part = if debt_part == bid.debt.amount {
            bid.collateral.amount
        } else {
            Amount((bid.collateral.amount.0 as i128 * debt_part.0 as i128
                / bid.debt.amount.0 as i128) as i64)
        };
        let refund = bid.collateral.amount.checked_sub(collateral_part)?;
        if refund.is_positive() {
            ctx.registry
                .adjust_balance(bid.bidder, bid.collateral.asset_id, refund)?;
        }
        let fund_share = if i + 1 == taken.len() {
            fund.checked_sub(fund_distributed)?
        } else {
            Amount((fund.0 as i128 * debt_part.0 as i128 / total_debt.0 as i128) as i64)
        };
        fund_distributed = fund_distributed.checked_add(fund_share)?;
        remaining_debt -= debt_part;

        let collateral = AssetAmount::new(
            collateral_part.checked_add(fund_share)?,
            bid.collateral.asset_id,
        );
        let debt = AssetAmount::new(debt_part, asset_id);
        ctx.registry.insert_call_order(CallOrder {
            borrower: bid.bidder,
            collateral,
            debt,
            target_collateral_ratio: None,
        });
        ctx.emit_virtual(Operation::BidAccepted {
            bid: *bid_id,
            bidder: bid.bidder,
            debt_covered: debt,
            collateral,
        });
    }

    // Losing bids are cancelled with a full refund.
    for bid_id in ctx.registry.bids_by_price(asset_id) {
        let bid = ctx.registry.remove_bid(bid_id)?;
        ctx.registry
            .adjust_balance(bid.bidder, bid.collateral.asset_id, bid.collateral.amount)?;
    }

    ctx.registry.modify_asset(asset_id, |asset| {
        let bitasset = asset.bitasset.as_mut().expect("market-issued");
        bitasset.settlement = None;
        bitasset.force_settled_volume = Amount::ZERO;
    })?;
    Ok(true)
}
