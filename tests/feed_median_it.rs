mod test_configurations;

use rand::{rngs::StdRng, Rng, SeedableRng};
use test_configurations::TestChain;
use tidepool::{
    types::{AccountId, AssetId},
    HardforkSchedule, Operation, PriceFeed,
};

fn set_producers(chain: &mut TestChain, issuer: AccountId, asset: AssetId, producers: &[AccountId]) {
    let fee = chain.fee();
    chain
        .apply(Operation::AssetUpdateFeedProducers {
            fee,
            issuer,
            asset_to_update: asset,
            new_feed_producers: producers.iter().copied().collect(),
        })
        .unwrap();
}

fn current_feed(chain: &TestChain, asset: AssetId) -> Option<PriceFeed> {
    chain
        .ledger
        .registry()
        .asset(asset)
        .unwrap()
        .bitasset
        .as_ref()
        .unwrap()
        .current_feed()
}

/// The median is per-field: each component is the sorted lower-middle of the
/// live publications, independent of which publisher supplied it.
#[test]
fn median_is_field_wise_over_publishers() {
    let mut chain = TestChain::new();
    let sam = chain.sam;
    let p1 = chain.ledger.create_account("p1");
    let p2 = chain.ledger.create_account("p2");
    let p3 = chain.ledger.create_account("p3");

    let usdbit = chain.create_bitasset(sam, "USDBIT");
    set_producers(&mut chain, sam, usdbit, &[p1, p2, p3]);

    chain.publish_feed(p1, usdbit, 1000, 1100, 1600, 1500).unwrap();
    chain.publish_feed(p2, usdbit, 1000, 900, 2000, 1100).unwrap();
    chain.publish_feed(p3, usdbit, 1000, 1000, 1750, 1200).unwrap();

    let median = current_feed(&chain, usdbit).unwrap();
    assert_eq!(
        median.settlement_price,
        tidepool::Price::from_amounts(1000, usdbit, 1000, chain.core())
    );
    assert_eq!(median.maintenance_collateral_ratio, 1750);
    assert_eq!(median.maximum_short_squeeze_ratio, 1200);
}

/// Recomputing over an unchanged feed set yields an identical result.
#[test]
fn median_is_idempotent_across_republish() {
    let mut chain = TestChain::new();
    let sam = chain.sam;
    let usdbit = chain.create_bitasset(sam, "USDBIT");
    chain.publish_feed(sam, usdbit, 1000, 950, 1750, 1100).unwrap();
    let first = current_feed(&chain, usdbit).unwrap();

    chain.publish_feed(sam, usdbit, 1000, 950, 1750, 1100).unwrap();
    assert_eq!(current_feed(&chain, usdbit).unwrap(), first);
}

/// Dropping a publisher from the producer set drops its feed immediately.
#[test]
fn producer_removal_prunes_feeds() {
    let mut chain = TestChain::new();
    let sam = chain.sam;
    let p1 = chain.ledger.create_account("p1");
    let p2 = chain.ledger.create_account("p2");

    let usdbit = chain.create_bitasset(sam, "USDBIT");
    set_producers(&mut chain, sam, usdbit, &[p1, p2]);
    chain.publish_feed(p1, usdbit, 1000, 500, 1750, 1100).unwrap();
    chain.publish_feed(p2, usdbit, 1000, 2000, 1750, 1100).unwrap();

    set_producers(&mut chain, sam, usdbit, &[p2]);
    let median = current_feed(&chain, usdbit).unwrap();
    assert_eq!(
        median.settlement_price,
        tidepool::Price::from_amounts(1000, usdbit, 2000, chain.core())
    );
}

#[test]
fn unauthorized_publisher_is_rejected() {
    let mut chain = TestChain::new();
    let (dan, sam) = (chain.dan, chain.sam);
    let usdbit = chain.create_bitasset(sam, "USDBIT");
    assert!(chain.publish_feed(dan, usdbit, 1000, 1000, 1750, 1100).is_err());
}

/// The feed-expiry comparison changed sense at its fix: exactly at the
/// deadline, the old code had already retired the feed while the fixed code
/// keeps it for that final second.
#[test]
fn expiry_boundary_depends_on_activation() {
    for (schedule, alive_at_deadline) in [
        (HardforkSchedule::all_active(), true),
        (HardforkSchedule::none_active(), false),
    ] {
        let mut chain = TestChain::with_hardforks(schedule);
        let sam = chain.sam;
        let usdbit = chain.create_bitasset_with(sam, "USDBIT", |options| {
            options.feed_lifetime_sec = 100;
        });
        chain.publish_feed(sam, usdbit, 1000, 1000, 1750, 1100).unwrap();

        chain.advance(100);
        chain.maintenance();
        assert_eq!(
            current_feed(&chain, usdbit).is_some(),
            alive_at_deadline,
            "deadline behavior under {:?}",
            chain.ledger.hardforks()
        );

        // One second later both sides agree the feed is stale, and a fresh
        // borrow fails closed.
        chain.advance(1);
        chain.maintenance();
        assert!(current_feed(&chain, usdbit).is_none());
        let dan = chain.dan;
        assert!(chain.borrow(dan, usdbit, 100, 1000).is_err());
    }
}

/// Agreement corpus: the engine's median must equal an independently written
/// reference over randomized feed sets. Guards against implementation-
/// specific tie-breaks leaking into consensus.
#[test]
fn median_agrees_with_reference_over_random_corpus() {
    let mut rng = StdRng::seed_from_u64(0x5EED_CAFE);

    for round in 0..50 {
        let mut chain = TestChain::new();
        let sam = chain.sam;
        let usdbit = chain.create_bitasset(sam, "USDBIT");

        let count = rng.random_range(1..=7usize);
        let producers: Vec<AccountId> = (0..count)
            .map(|i| chain.ledger.create_account(format!("producer{i}")))
            .collect();
        set_producers(&mut chain, sam, usdbit, &producers);

        let mut published: Vec<PriceFeed> = Vec::new();
        for producer in &producers {
            let quote = rng.random_range(500..=2000i64);
            let mcr = rng.random_range(1001..=3000u16);
            let mssr = rng.random_range(1001..=2000u16);
            let icr = if rng.random_bool(0.5) {
                Some(rng.random_range(1001..=3200u16))
            } else {
                None
            };
            let feed = chain.feed_of(usdbit, 1000, quote, mcr, mssr, icr);
            published.push(feed);
            let fee = chain.fee();
            chain
                .apply(Operation::AssetPublishFeed {
                    fee,
                    publisher: *producer,
                    asset_id: usdbit,
                    feed,
                })
                .unwrap();
        }

        let engine = current_feed(&chain, usdbit).unwrap();
        let reference = reference_median(&published);
        assert_eq!(engine.settlement_price, reference.settlement_price, "round {round}");
        assert_eq!(
            engine.maintenance_collateral_ratio,
            reference.maintenance_collateral_ratio,
            "round {round}"
        );
        assert_eq!(
            engine.maximum_short_squeeze_ratio,
            reference.maximum_short_squeeze_ratio,
            "round {round}"
        );
        assert_eq!(
            engine.initial_collateral_ratio,
            reference.initial_collateral_ratio,
            "round {round}"
        );
    }
}

/// A deliberately naive re-implementation of the per-field lower-middle
/// median, written against the specification rather than the engine.
fn reference_median(feeds: &[PriceFeed]) -> PriceFeed {
    fn lower_middle<T: Clone>(sorted: Vec<T>) -> T {
        sorted[(sorted.len() - 1) / 2].clone()
    }

    let mut prices = feeds.iter().map(|f| f.settlement_price).collect::<Vec<_>>();
    prices.sort_by(|a, b| {
        let lhs = a.base.amount.0 as i128 * b.quote.amount.0 as i128;
        let rhs = b.base.amount.0 as i128 * a.quote.amount.0 as i128;
        lhs.cmp(&rhs)
    });

    let mut mcrs: Vec<u16> = feeds.iter().map(|f| f.maintenance_collateral_ratio).collect();
    mcrs.sort_unstable();
    let mut mssrs: Vec<u16> = feeds.iter().map(|f| f.maximum_short_squeeze_ratio).collect();
    mssrs.sort_unstable();
    let mut icrs: Vec<u16> = feeds.iter().filter_map(|f| f.initial_collateral_ratio).collect();
    icrs.sort_unstable();

    PriceFeed {
        settlement_price: lower_middle(prices),
        core_exchange_rate: feeds[0].core_exchange_rate,
        maintenance_collateral_ratio: lower_middle(mcrs),
        maximum_short_squeeze_ratio: lower_middle(mssrs),
        initial_collateral_ratio: if icrs.is_empty() {
            None
        } else {
            Some(lower_middle(icrs))
        },
    }
}
