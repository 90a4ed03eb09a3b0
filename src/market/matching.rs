//! Order matching: limit against limit, and limit against margin-called
//! call orders.
//!
//! Limit pairs fill at the maker's price. Margin calls fill at the maker
//! limit's ask, but only when that ask is at or above the margin-call order
//! price derived from the feed (`settlement * MSSR`); a cheaper ask is left
//! on the book and the call stays in margin-call territory rather than
//! trading through the squeeze guard. Rounding always favors the side whose
//! amount fixes the trade; residues stay with the orders until they are
//! culled as dust.

use tracing::{debug, trace};

use crate::{
    chain::{
        driver::EvalContext,
        operations::{Operation, OrderRef},
    },
    error::TidepoolResult,
    market::settlement,
    types::{Amount, AssetAmount, AssetId, CallOrderId, LimitOrderId, Price, PriceFeed},
};

/// Matches a freshly inserted limit order against the opposite book, then
/// lets margin calls lift whatever remains. Returns `true` when the order
/// left the book entirely.
pub(crate) fn match_new_limit_order(
    ctx: &mut EvalContext<'_>,
    taker_id: LimitOrderId,
) -> TidepoolResult<bool> {
    let (sell, receive) = {
        let taker = ctx.registry.limit_order(taker_id)?;
        (taker.sell_asset(), taker.receive_asset())
    };

    loop {
        if ctx.registry.limit_order(taker_id).is_err() {
            break;
        }
        let Some(&maker_id) = ctx.registry.book_orders(receive, sell).first() else {
            break;
        };
        let taker_price = ctx.registry.limit_order(taker_id)?.sell_price;
        let maker_price = ctx.registry.limit_order(maker_id)?.sell_price;
        if !crosses(taker_price, maker_price) {
            break;
        }
        trace!(%taker_id, %maker_id, "limit orders cross");
        fill_limit_pair(ctx, taker_id, maker_id)?;
    }

    // A remainder selling a debt asset (or the backing of one) may still be
    // what a margin call has been waiting for.
    check_call_orders(ctx, sell)?;
    check_call_orders(ctx, receive)?;

    Ok(ctx.registry.limit_order(taker_id).is_err())
}

/// Taker demands no more than the maker offers:
/// `taker.quote/taker.base <= maker.base/maker.quote`, cross-multiplied.
fn crosses(taker: Price, maker: Price) -> bool {
    let lhs = taker.quote.amount.0 as i128 * maker.quote.amount.0 as i128;
    let rhs = taker.base.amount.0 as i128 * maker.base.amount.0 as i128;
    lhs <= rhs
}

/// Fills one crossing pair at the maker's price. Exactly one side is
/// exhausted per call (both when the amounts line up), so the match loop
/// always makes progress.
fn fill_limit_pair(
    ctx: &mut EvalContext<'_>,
    taker_id: LimitOrderId,
    maker_id: LimitOrderId,
) -> TidepoolResult<()> {
    let taker = ctx.registry.limit_order(taker_id)?.clone();
    let maker = ctx.registry.limit_order(maker_id)?.clone();

    // Maker price oriented from the taker's side: base = taker's sell asset.
    let match_price = maker.sell_price.invert();

    let taker_receives_full = match_price.convert(taker.amount_for_sale())?;
    let (taker_pays, taker_receives) = if taker_receives_full.amount.0 <= maker.for_sale.0 {
        (taker.amount_for_sale(), taker_receives_full)
    } else {
        let maker_gives = maker.amount_for_sale();
        (match_price.convert(maker_gives)?, maker_gives)
    };

    if taker_receives.amount.is_zero() {
        // The remainder cannot buy a single unit at this price; write it off.
        return cull_dust(ctx, taker_id);
    }
    if taker_pays.amount.is_zero() {
        return cull_dust(ctx, maker_id);
    }

    fill_limit_order(ctx, taker_id, taker_pays, taker_receives, false)?;
    fill_limit_order(ctx, maker_id, taker_receives, taker_pays, true)?;
    Ok(())
}

/// Applies one fill to a limit order: deduct the escrow, charge the market
/// fee on the received side, credit the seller, emit the fill record, and
/// cull the order if its remainder can no longer trade.
pub(crate) fn fill_limit_order(
    ctx: &mut EvalContext<'_>,
    order_id: LimitOrderId,
    pays: AssetAmount,
    receives: AssetAmount,
    is_maker: bool,
) -> TidepoolResult<()> {
    let order = ctx.registry.limit_order(order_id)?.clone();
    let seller = order.seller;

    let fee = market_fee(ctx, receives)?;
    let credited = receives.amount.checked_sub(fee)?;
    ctx.registry
        .adjust_balance(seller, receives.asset_id, credited)?;

    ctx.emit_virtual(Operation::FillOrder {
        order: OrderRef::Limit(order_id),
        account: seller,
        pays,
        receives,
        fee: AssetAmount::new(fee, receives.asset_id),
        is_maker,
    });

    let remaining = order.for_sale.checked_sub(pays.amount)?;
    if remaining.is_zero() {
        settle_deferred_fee(ctx, &order)?;
        ctx.registry.remove_limit_order(order_id)?;
        return Ok(());
    }
    ctx.registry
        .modify_limit_order(order_id, |o| o.for_sale = remaining)?;
    if ctx
        .registry
        .limit_order(order_id)?
        .amount_to_receive()?
        .amount
        .is_zero()
    {
        return cull_dust(ctx, order_id);
    }
    Ok(())
}

/// Removes an order whose remainder is below one receivable unit; the
/// residue is written off into the sold asset's accumulated fees.
fn cull_dust(ctx: &mut EvalContext<'_>, order_id: LimitOrderId) -> TidepoolResult<()> {
    let order = ctx.registry.remove_limit_order(order_id)?;
    debug!(%order_id, residue = order.for_sale.0, "culling dust remainder");
    let sell_asset = order.sell_asset();
    ctx.registry.modify_asset(sell_asset, |asset| -> TidepoolResult<()> {
        asset.dynamic.accumulated_fees =
            asset.dynamic.accumulated_fees.checked_add(order.for_sale)?;
        Ok(())
    })??;
    settle_deferred_fee(ctx, &order)?;
    Ok(())
}

/// An order leaving the book by fill or cull forfeits its deferred fee to
/// the core asset's fee pot; only an explicit cancel refunds it.
fn settle_deferred_fee(
    ctx: &mut EvalContext<'_>,
    order: &crate::market::limit_order::LimitOrder,
) -> TidepoolResult<()> {
    if order.deferred_fee.is_zero() {
        return Ok(());
    }
    let core = ctx.core_asset;
    let fee = order.deferred_fee;
    ctx.registry.modify_asset(core, |asset| -> TidepoolResult<()> {
        asset.dynamic.accumulated_fees = asset.dynamic.accumulated_fees.checked_add(fee)?;
        Ok(())
    })??;
    Ok(())
}

/// Per-mille market fee on the received side, accrued to the receiving
/// asset.
fn market_fee(ctx: &mut EvalContext<'_>, receives: AssetAmount) -> TidepoolResult<Amount> {
    let asset = ctx.registry.asset(receives.asset_id)?;
    if !asset.charges_market_fees() || asset.options.market_fee_percent == 0 {
        return Ok(Amount::ZERO);
    }
    let fee = Amount(
        (receives.amount.0 as i128 * asset.options.market_fee_percent as i128 / 1000) as i64,
    );
    if fee.is_positive() {
        ctx.registry.modify_asset(receives.asset_id, |a| -> TidepoolResult<()> {
            a.dynamic.accumulated_fees = a.dynamic.accumulated_fees.checked_add(fee)?;
            Ok(())
        })??;
    }
    Ok(fee)
}

/// Walks margin calls of `asset_id` from least collateralized outward,
/// lifting qualifying limit orders, and hands over to global settlement when
/// the worst position cannot fill even at the squeeze price.
///
/// Returns `true` when any call was filled or the asset black-swanned.
pub(crate) fn check_call_orders(
    ctx: &mut EvalContext<'_>,
    asset_id: AssetId,
) -> TidepoolResult<bool> {
    let Some(bitasset) = ctx.registry.asset(asset_id)?.bitasset.clone() else {
        return Ok(false);
    };
    if bitasset.has_settlement() {
        return Ok(false);
    }
    let Some(feed) = bitasset.current_feed() else {
        return Ok(false);
    };
    let Some(maintenance) = bitasset.current_maintenance_collateralization else {
        return Ok(false);
    };
    let call_price = feed.margin_call_price()?;

    // Black swan first: the worst position must still be able to buy its
    // entire debt back at the squeeze price.
    if let Some(&worst_id) = ctx
        .registry
        .call_orders_by_collateralization(asset_id)
        .first()
    {
        let worst = ctx.registry.call_order(worst_id)?.clone();
        if worst.collateralization().cmp_ratio(&call_price)?.is_lt() {
            if bitasset.is_prediction_market && ctx.pm_swan_guard_active() {
                // A feed can no longer sink a prediction market.
                return Ok(false);
            }
            let swan_price = swan_price(&worst, feed.settlement_price)?;
            debug!(%asset_id, %swan_price, "black swan");
            settlement::globally_settle(ctx, asset_id, swan_price)?;
            return Ok(true);
        }
    }

    if bitasset.is_prediction_market {
        // One-to-one positions have no margin to call.
        return Ok(false);
    }

    let mut margin_called = false;
    loop {
        let Some(&call_id) = ctx
            .registry
            .call_orders_by_collateralization(asset_id)
            .first()
        else {
            break;
        };
        let call = ctx.registry.call_order(call_id)?.clone();
        if !call.is_called(maintenance)? {
            break;
        }

        if !try_fill_call(ctx, call_id, asset_id, &bitasset_params(&bitasset), &feed, call_price)? {
            // Nothing on the book qualifies; the call sits until something
            // does or the feed moves.
            break;
        }
        margin_called = true;
    }
    Ok(margin_called)
}

struct CallFillParams {
    backing_asset: AssetId,
    margin_call_fee_ratio: u16,
}

fn bitasset_params(bitasset: &crate::asset::records::BitassetData) -> CallFillParams {
    CallFillParams {
        backing_asset: bitasset.backing_asset,
        margin_call_fee_ratio: bitasset.margin_call_fee_ratio,
    }
}

/// One round of margin-call matching for the least collateralized position.
/// Returns `true` if any fill happened.
fn try_fill_call(
    ctx: &mut EvalContext<'_>,
    call_id: CallOrderId,
    debt_asset: AssetId,
    params: &CallFillParams,
    feed: &PriceFeed,
    call_price: Price,
) -> TidepoolResult<bool> {
    let squeeze_guard = ctx.squeeze_guard_active();

    for order_id in ctx.registry.book_orders(debt_asset, params.backing_asset) {
        let order = ctx.registry.limit_order(order_id)?.clone();
        // The seller's demanded collateral per unit of debt.
        let ask = order.sell_price.invert();
        if squeeze_guard && ask.cmp_ratio(&call_price)?.is_lt() {
            // Below the squeeze level; leave it on the book.
            continue;
        }

        let call = ctx.registry.call_order(call_id)?.clone();
        let cover_cap = call.max_debt_to_cover(
            ask,
            feed.settlement_price,
            feed.maintenance_collateral_ratio,
        )?;
        if cover_cap.is_zero() {
            return Ok(false);
        }
        let debt_covered = cover_cap.min(order.for_sale).min(call.debt.amount);
        let debt_amount = AssetAmount::new(debt_covered, debt_asset);
        let collateral_paid = ask.convert(debt_amount)?;

        let fee = Amount(
            (collateral_paid.amount.0 as i128 * params.margin_call_fee_ratio as i128 / 1000)
                as i64,
        );
        let total_out = collateral_paid.amount.checked_add(fee)?;
        if total_out.0 > call.collateral.amount.0 {
            // The position cannot pay this ask in full; it stays called.
            return Ok(false);
        }

        debug!(%call_id, %order_id, debt = debt_covered.0, "margin call fill");

        // Call side: give collateral (plus the margin-call fee), burn debt.
        let remaining_debt = call.debt.amount.checked_sub(debt_covered)?;
        let remaining_collateral = call.collateral.amount.checked_sub(total_out)?;
        if remaining_debt.is_zero() {
            ctx.registry.remove_call_order(call_id)?;
            if remaining_collateral.is_positive() {
                ctx.registry.adjust_balance(
                    call.borrower,
                    params.backing_asset,
                    remaining_collateral,
                )?;
            }
        } else {
            ctx.registry.modify_call_order(call_id, |c| {
                c.debt.amount = remaining_debt;
                c.collateral.amount = remaining_collateral;
            })?;
        }
        ctx.registry.modify_asset(debt_asset, |asset| -> TidepoolResult<()> {
            asset.dynamic.adjust_supply(-debt_covered)?;
            asset.dynamic.accumulated_collateral_fees =
                asset.dynamic.accumulated_collateral_fees.checked_add(fee)?;
            Ok(())
        })??;
        ctx.emit_virtual(Operation::FillOrder {
            order: OrderRef::Call(call_id),
            account: call.borrower,
            pays: AssetAmount::new(total_out, params.backing_asset),
            receives: debt_amount,
            fee: AssetAmount::new(fee, params.backing_asset),
            is_maker: false,
        });

        // Limit side: give debt, receive the collateral (market fee inside).
        fill_limit_order(ctx, order_id, debt_amount, collateral_paid, true)?;
        return Ok(true);
    }
    Ok(false)
}

/// The seizure price of a black swan: the feed, degraded to the worst
/// position's own ratio when even that position cannot cover at the feed.
/// Seizing at this price guarantees the fund covers the remaining supply.
fn swan_price(
    worst: &crate::market::call_order::CallOrder,
    settlement_price: Price,
) -> TidepoolResult<Price> {
    let worst_ratio = Price::new(worst.debt, worst.collateral);
    Ok(if settlement_price.cmp_ratio(&worst_ratio)?.is_ge() {
        settlement_price
    } else {
        worst_ratio
    })
}
