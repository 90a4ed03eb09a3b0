mod test_configurations;

use test_configurations::{assert_supply_conservation, TestChain};
use tidepool::{types::AssetAmount, Operation};

/// Scenario: a feed crash sends the asset into global settlement. All
/// collateral of the underwater position is seized, borrowing freezes, and
/// settlement becomes immediate at the seizure price.
#[test]
fn feed_crash_triggers_global_settlement() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();

    let usdbit = chain.create_bitasset(sam, "USDBIT");
    chain
        .publish_feed(sam, usdbit, 100, 100, 1750, 1100)
        .unwrap();
    chain.borrow(dan, usdbit, 1000, 2000).unwrap();
    assert!(!chain.has_settlement(usdbit));

    // The crash: 10 debt now worth 100 collateral. The worst (only)
    // position is far below the squeeze level; the swan fires on publish.
    let applied = chain
        .publish_feed(sam, usdbit, 10, 100, 1750, 1100)
        .unwrap();
    assert!(chain.has_settlement(usdbit));
    assert!(applied
        .iter()
        .any(|a| matches!(a.operation, Operation::GlobalSettlementSeize { .. }) && a.is_virtual));

    // The position could not even cover at its own ratio, so everything was
    // seized: the fund is the entire collateral.
    let asset = chain.ledger.registry().asset(usdbit).unwrap();
    let settlement = asset.bitasset.as_ref().unwrap().settlement.unwrap();
    assert_eq!(settlement.fund.0, 2000);
    assert_eq!(chain.call_position(dan, usdbit), None);
    assert_eq!(chain.balance(dan, core), 10_000_000 - 2000);
    assert_supply_conservation(&chain.ledger);

    // Borrowing against a settled asset fails.
    assert!(chain.borrow(sam, usdbit, 100, 10_000).is_err());

    // Settlement is immediate at the seizure price (2 core per debt here).
    chain
        .settle(dan, AssetAmount::new(500, usdbit))
        .unwrap();
    assert_eq!(chain.balance(dan, usdbit), 500);
    assert_eq!(chain.balance(dan, core), 10_000_000 - 2000 + 1000);

    // The fund still covers what remains redeemable, exactly.
    let asset = chain.ledger.registry().asset(usdbit).unwrap();
    let settlement = asset.bitasset.as_ref().unwrap().settlement.unwrap();
    assert_eq!(settlement.fund.0, 1000);
    assert_eq!(asset.dynamic.current_supply.0, 500);
    assert_supply_conservation(&chain.ledger);

    // A second global settlement is impossible.
    let fee = chain.fee();
    let err = chain.apply(Operation::AssetGlobalSettle {
        fee,
        issuer: sam,
        asset_to_settle: usdbit,
        settle_price: tidepool::Price::from_amounts(100, usdbit, 100, core),
    });
    assert!(err.is_err());
}

/// Positions above the swan price only lose what the seizure price demands;
/// the excess returns to the borrower.
#[test]
fn better_collateralized_positions_keep_their_excess() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let core = chain.core();

    let usdbit = chain.create_bitasset(sam, "USDBIT");
    chain
        .publish_feed(sam, usdbit, 1000, 1000, 1750, 1100)
        .unwrap();
    chain.borrow(dan, usdbit, 1000, 2000).unwrap();
    chain.borrow(sam, usdbit, 1000, 4000).unwrap();

    // Crash to 1 debt : 10 collateral. Seizure price is the worst ratio,
    // 1000:2000: dan pays all 2000, sam pays 2000 of 4000.
    chain
        .publish_feed(sam, usdbit, 100, 1000, 1750, 1100)
        .unwrap();
    assert!(chain.has_settlement(usdbit));

    let asset = chain.ledger.registry().asset(usdbit).unwrap();
    let settlement = asset.bitasset.as_ref().unwrap().settlement.unwrap();
    assert_eq!(settlement.fund.0, 4000);
    assert_eq!(chain.balance(dan, core), 10_000_000 - 2000);
    assert_eq!(chain.balance(sam, core), 10_000_000 - 4000 + 2000);
    assert_supply_conservation(&chain.ledger);
}
