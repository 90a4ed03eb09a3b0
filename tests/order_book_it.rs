mod test_configurations;

use test_configurations::{assert_supply_conservation, TestChain};
use tidepool::{
    types::{AssetAmount, LimitOrderId},
    Operation, OperationOutcome,
};

fn placed_order(applied: &[tidepool::AppliedOperation]) -> Option<LimitOrderId> {
    applied.iter().find_map(|a| match a.result {
        OperationOutcome::LimitOrder(id) => Some(id),
        _ => None,
    })
}

/// Placing and cancelling returns the entire escrow to the seller.
#[test]
fn create_then_cancel_round_trip() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia(sam, "GOLD");
    chain.issue(sam, gold, 100_000, dan).unwrap();

    let before = chain.balance(dan, gold);
    let applied = chain
        .limit_order(
            dan,
            AssetAmount::new(10_000, gold),
            AssetAmount::new(5_000, core),
        )
        .unwrap();
    let order = placed_order(&applied).unwrap();
    assert_eq!(chain.balance(dan, gold), before - 10_000);

    let fee = chain.fee();
    chain
        .apply(Operation::LimitOrderCancel {
            fee,
            fee_paying_account: dan,
            order,
        })
        .unwrap();
    assert_eq!(chain.balance(dan, gold), before);
    assert_supply_conservation(&chain.ledger);
}

#[test]
fn only_the_owner_may_cancel() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia(sam, "GOLD");
    chain.issue(sam, gold, 100_000, dan).unwrap();

    let applied = chain
        .limit_order(
            dan,
            AssetAmount::new(100, gold),
            AssetAmount::new(100, core),
        )
        .unwrap();
    let order = placed_order(&applied).unwrap();
    let fee = chain.fee();
    assert!(chain
        .apply(Operation::LimitOrderCancel {
            fee,
            fee_paying_account: sam,
            order,
        })
        .is_err());
}

/// Crossing orders fill at the maker's price; the taker keeps the surplus of
/// its own, more generous limit.
#[test]
fn fills_execute_at_maker_price() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia(sam, "GOLD");
    chain.issue(sam, gold, 100_000, sam).unwrap();

    // Maker: sam sells 1000 GOLD for 500 CORE (2 GOLD per CORE).
    chain
        .limit_order(
            sam,
            AssetAmount::new(1000, gold),
            AssetAmount::new(500, core),
        )
        .unwrap();

    // Taker: dan offers 600 CORE for 1000 GOLD (1.67 GOLD per CORE demanded).
    let applied = chain
        .limit_order(
            dan,
            AssetAmount::new(600, core),
            AssetAmount::new(1000, gold),
        )
        .unwrap();
    let taker = placed_order(&applied).unwrap();

    // Filled at the maker's 2:1: dan paid only 500 CORE for the full 1000.
    assert_eq!(chain.balance(dan, gold), 1000);
    assert_eq!(chain.balance(sam, core), 10_000_000 + 500);

    // The taker's unspent 100 CORE remains on the book.
    let rest = chain.ledger.registry().limit_order(taker).unwrap();
    assert_eq!(rest.for_sale.0, 100);

    let fills: Vec<_> = applied
        .iter()
        .filter(|a| matches!(a.operation, Operation::FillOrder { .. }))
        .collect();
    assert_eq!(fills.len(), 2, "one fill record per side");
    assert!(fills.iter().all(|a| a.is_virtual));
    assert_supply_conservation(&chain.ledger);
}

#[test]
fn equal_prices_match_in_insertion_order() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia(sam, "GOLD");
    chain.issue(sam, gold, 100_000, sam).unwrap();
    chain.issue(sam, gold, 100_000, dan).unwrap();

    let first = placed_order(
        &chain
            .limit_order(sam, AssetAmount::new(300, gold), AssetAmount::new(300, core))
            .unwrap(),
    )
    .unwrap();
    let second = placed_order(
        &chain
            .limit_order(dan, AssetAmount::new(300, gold), AssetAmount::new(300, core))
            .unwrap(),
    )
    .unwrap();

    // A taker for half the liquidity consumes the older order first.
    chain
        .limit_order(sam, AssetAmount::new(300, core), AssetAmount::new(300, gold))
        .unwrap();
    assert!(chain.ledger.registry().limit_order(first).is_err());
    assert!(chain.ledger.registry().limit_order(second).is_ok());
}

#[test]
fn fill_or_kill_rejects_on_empty_book_and_fills_on_exact_match() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia(sam, "GOLD");
    chain.issue(sam, gold, 100_000, sam).unwrap();

    let fee = chain.fee();
    let rejected = chain.apply(Operation::LimitOrderCreate {
        fee,
        seller: dan,
        amount_to_sell: AssetAmount::new(500, core),
        min_to_receive: AssetAmount::new(1000, gold),
        expiration: None,
        fill_or_kill: true,
    });
    assert!(rejected.is_err());
    // The rejected escrow never left.
    assert_eq!(chain.balance(dan, core), 10_000_000);

    chain
        .limit_order(
            sam,
            AssetAmount::new(1000, gold),
            AssetAmount::new(500, core),
        )
        .unwrap();
    let fee = chain.fee();
    chain
        .apply(Operation::LimitOrderCreate {
            fee,
            seller: dan,
            amount_to_sell: AssetAmount::new(500, core),
            min_to_receive: AssetAmount::new(1000, gold),
            expiration: None,
            fill_or_kill: true,
        })
        .unwrap();
    assert_eq!(chain.balance(dan, gold), 1000);
}

#[test]
fn expired_orders_refund_at_maintenance() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia(sam, "GOLD");
    chain.issue(sam, gold, 100_000, dan).unwrap();

    let fee = chain.fee();
    let applied = chain
        .apply(Operation::LimitOrderCreate {
            fee,
            seller: dan,
            amount_to_sell: AssetAmount::new(1000, gold),
            min_to_receive: AssetAmount::new(1000, core),
            expiration: Some(chain.time + chrono::Duration::seconds(60)),
            fill_or_kill: false,
        })
        .unwrap();
    let order = placed_order(&applied).unwrap();

    chain.maintenance();
    assert!(chain.ledger.registry().limit_order(order).is_ok(), "not yet expired");

    chain.advance(120);
    chain.maintenance();
    assert!(chain.ledger.registry().limit_order(order).is_err());
    assert_eq!(chain.balance(dan, gold), 100_000);
}

/// Per-mille market fee is taken from the receiving side and accrues to the
/// received asset.
#[test]
fn market_fee_accrues_to_receiving_asset() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia_with(sam, "GOLD", |options| {
        options.market_fee_percent = 20; // 2%
        options.issuer_permissions |= tidepool::asset::flags::CHARGE_MARKET_FEE;
        options.flags |= tidepool::asset::flags::CHARGE_MARKET_FEE;
    });
    chain.issue(sam, gold, 100_000, sam).unwrap();

    chain
        .limit_order(
            sam,
            AssetAmount::new(1000, gold),
            AssetAmount::new(1000, core),
        )
        .unwrap();
    chain
        .limit_order(
            dan,
            AssetAmount::new(1000, core),
            AssetAmount::new(1000, gold),
        )
        .unwrap();

    // dan received 1000 GOLD minus the 2% fee.
    assert_eq!(chain.balance(dan, gold), 980);
    let asset = chain.ledger.registry().asset(gold).unwrap();
    assert_eq!(asset.dynamic.accumulated_fees.0, 20);
    assert_supply_conservation(&chain.ledger);
}

/// Partial fills round the computed side down; the residue stays with the
/// order rather than being conjured into either balance.
#[test]
fn partial_fill_rounding_residue_stays_with_the_order() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();
    let gold = chain.create_uia(sam, "GOLD");
    chain.issue(sam, gold, 100_000, sam).unwrap();

    // Maker: 10 GOLD for 3 CORE. Taker offers 2 CORE for at most 6 GOLD
    // (price 1 CORE : 3 GOLD, more generous than the maker's 10:3).
    chain
        .limit_order(sam, AssetAmount::new(10, gold), AssetAmount::new(3, core))
        .unwrap();
    let applied = chain
        .limit_order(dan, AssetAmount::new(2, core), AssetAmount::new(6, gold))
        .unwrap();

    // At the maker price, 2 CORE buys floor(2 * 10 / 3) = 6 GOLD.
    assert!(placed_order(&applied).is_some());
    assert_eq!(chain.balance(dan, gold), 6);
    assert_eq!(chain.balance(dan, core), 10_000_000 - 2);
    let maker_rest: Vec<_> = chain
        .ledger
        .registry()
        .limit_orders()
        .map(|(_, o)| o.for_sale.0)
        .collect();
    assert_eq!(maker_rest, vec![4], "maker keeps the unsold residue");
    assert_supply_conservation(&chain.ledger);
}
