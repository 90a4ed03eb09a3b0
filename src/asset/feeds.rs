//! Per-field median aggregation over publisher feeds.
//!
//! The median is the sorted middle (lower middle for even counts), taken
//! independently per field: settlement price, core exchange rate, MCR, MSSR
//! and ICR each get their own median over the live publications. The result
//! is consensus-visible, so everything here is exact integer arithmetic with
//! a fully specified comparator.

use chrono::{DateTime, Utc};
use itertools::Itertools;

use crate::{
    asset::records::BitassetData,
    error::TidepoolResult,
    types::PriceFeed,
};

/// Recomputes the median feed and the derived trigger prices.
///
/// Call on feed publication, feed-producer changes and maintenance (expiry).
/// Returns `true` when the effective feed changed, in which case the caller
/// must re-run the margin-call check for the asset.
pub fn update_median_feeds(
    bitasset: &mut BitassetData,
    now: DateTime<Utc>,
    pre_expiry_fix: bool,
) -> TidepoolResult<bool> {
    let before = bitasset.current_feed();

    let live: Vec<(DateTime<Utc>, PriceFeed)> = bitasset
        .feeds
        .iter()
        .filter(|(producer, (time, _))| {
            bitasset.feed_producers.contains(*producer)
                && !bitasset.feed_is_expired(*time, now, pre_expiry_fix)
        })
        .map(|(_, entry)| *entry)
        .collect();

    if live.len() < bitasset.minimum_feeds as usize {
        bitasset.median_feed = None;
        bitasset.current_feed_publication_time = None;
        bitasset.current_maintenance_collateralization = None;
        bitasset.current_initial_collateralization = None;
        return Ok(before.is_some());
    }

    let median_feed = median_of(live.iter().map(|(_, feed)| feed));
    bitasset.current_feed_publication_time = live.iter().map(|(time, _)| *time).min();
    bitasset.median_feed = Some(median_feed);

    // Trigger prices come from the effective feed, which may carry the
    // asset-level ICR override.
    let effective = bitasset
        .current_feed()
        .expect("median was just assigned");
    bitasset.current_maintenance_collateralization =
        Some(effective.maintenance_collateralization()?);
    bitasset.current_initial_collateralization = effective.initial_collateralization()?;

    Ok(before != bitasset.current_feed())
}

/// Lower-middle index for `n` sorted samples: the exact middle when `n` is
/// odd, the lower of the two middles when even.
fn median_index(n: usize) -> usize {
    (n - 1) / 2
}

fn median_of<'a>(feeds: impl Iterator<Item = &'a PriceFeed> + Clone) -> PriceFeed {
    let n = feeds.clone().count();
    let mid = median_index(n);

    let settlement_price = feeds
        .clone()
        .map(|f| f.settlement_price)
        .sorted()
        .nth(mid)
        .expect("non-empty by minimum_feeds check");
    let core_exchange_rate = feeds
        .clone()
        .map(|f| f.core_exchange_rate)
        .sorted()
        .nth(mid)
        .expect("non-empty by minimum_feeds check");
    let maintenance_collateral_ratio = feeds
        .clone()
        .map(|f| f.maintenance_collateral_ratio)
        .sorted()
        .nth(mid)
        .expect("non-empty by minimum_feeds check");
    let maximum_short_squeeze_ratio = feeds
        .clone()
        .map(|f| f.maximum_short_squeeze_ratio)
        .sorted()
        .nth(mid)
        .expect("non-empty by minimum_feeds check");

    // ICR is optional per publication: the median is taken over the
    // publishers that supplied one, and absent when none did.
    let icrs: Vec<u16> = feeds
        .filter_map(|f| f.initial_collateral_ratio)
        .sorted()
        .collect();
    let initial_collateral_ratio = if icrs.is_empty() {
        None
    } else {
        Some(icrs[median_index(icrs.len())])
    };

    PriceFeed {
        settlement_price,
        core_exchange_rate,
        maintenance_collateral_ratio,
        maximum_short_squeeze_ratio,
        initial_collateral_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, AssetAmount, AssetId, Price};
    use chrono::TimeZone;

    const DEBT: AssetId = AssetId(5);
    const CORE: AssetId = AssetId(0);

    fn feed(settlement_quote: i64, mcr: u16, mssr: u16, icr: Option<u16>) -> PriceFeed {
        PriceFeed {
            settlement_price: Price::new(
                AssetAmount::new(1000, DEBT),
                AssetAmount::new(settlement_quote, CORE),
            ),
            core_exchange_rate: Price::new(
                AssetAmount::new(1000, DEBT),
                AssetAmount::new(settlement_quote, CORE),
            ),
            maintenance_collateral_ratio: mcr,
            maximum_short_squeeze_ratio: mssr,
            initial_collateral_ratio: icr,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
    }

    fn bitasset_with(feeds: Vec<(u64, PriceFeed)>) -> BitassetData {
        let mut b = BitassetData::new(CORE);
        for (producer, f) in feeds {
            b.feed_producers.insert(AccountId(producer));
            b.feeds.insert(AccountId(producer), (now(), f));
        }
        b
    }

    #[test]
    fn median_is_per_field() {
        // Settlement quotes 900 / 1000 / 1100; MCR 1600 / 1750 / 2000 in a
        // different publisher order. Each field medians independently.
        let mut b = bitasset_with(vec![
            (1, feed(1100, 1600, 1100, None)),
            (2, feed(900, 2000, 1500, None)),
            (3, feed(1000, 1750, 1200, None)),
        ]);
        let changed = update_median_feeds(&mut b, now(), false).unwrap();
        assert!(changed);

        let median = b.median_feed.unwrap();
        assert_eq!(
            median.settlement_price,
            Price::new(AssetAmount::new(1000, DEBT), AssetAmount::new(1000, CORE))
        );
        assert_eq!(median.maintenance_collateral_ratio, 1750);
        assert_eq!(median.maximum_short_squeeze_ratio, 1200);
        assert_eq!(median.initial_collateral_ratio, None);
    }

    #[test]
    fn even_count_takes_lower_middle() {
        let mut b = bitasset_with(vec![
            (1, feed(900, 1600, 1100, None)),
            (2, feed(1100, 1800, 1300, None)),
        ]);
        update_median_feeds(&mut b, now(), false).unwrap();
        let median = b.median_feed.unwrap();
        // Prices sort by ratio: 1000:1100 < 1000:900. The lower middle of a
        // two-element set is the first, so the cheaper debt price wins.
        assert_eq!(
            median.settlement_price,
            Price::new(AssetAmount::new(1000, DEBT), AssetAmount::new(1100, CORE))
        );
        assert_eq!(median.maintenance_collateral_ratio, 1600);
    }

    #[test]
    fn below_minimum_feeds_fails_closed() {
        let mut b = bitasset_with(vec![(1, feed(1000, 1750, 1100, None))]);
        b.minimum_feeds = 2;
        update_median_feeds(&mut b, now(), false).unwrap();
        assert!(b.median_feed.is_none());
        assert!(b.current_feed().is_none());
        assert!(b.current_maintenance_collateralization.is_none());
    }

    #[test]
    fn icr_medians_over_publishers_that_set_it() {
        let mut b = bitasset_with(vec![
            (1, feed(1000, 1750, 1100, Some(1900))),
            (2, feed(1000, 1750, 1100, None)),
            (3, feed(1000, 1750, 1100, Some(2100))),
        ]);
        update_median_feeds(&mut b, now(), false).unwrap();
        assert_eq!(b.median_feed.unwrap().initial_collateral_ratio, Some(1900));
        assert!(b.current_initial_collateralization.is_some());
    }

    #[test]
    fn expired_feeds_drop_out() {
        let mut b = bitasset_with(vec![
            (1, feed(900, 1750, 1100, None)),
            (2, feed(1100, 1750, 1100, None)),
        ]);
        b.feed_lifetime_sec = 100;
        // Producer 1 published 200s in the past.
        b.feeds
            .insert(AccountId(1), (now() - chrono::Duration::seconds(200), feed(900, 1750, 1100, None)));
        update_median_feeds(&mut b, now(), false).unwrap();
        let median = b.median_feed.unwrap();
        assert_eq!(
            median.settlement_price,
            Price::new(AssetAmount::new(1000, DEBT), AssetAmount::new(1100, CORE))
        );
    }

    #[test]
    fn expiry_comparison_sense_per_activation() {
        let b = {
            let mut b = BitassetData::new(CORE);
            b.feed_lifetime_sec = 100;
            b
        };
        let published = now();
        let exactly_at_deadline = now() + chrono::Duration::seconds(100);
        // The pre-fix comparison retires a feed exactly at its deadline; the
        // fixed comparison keeps it for that final second.
        assert!(b.feed_is_expired(published, exactly_at_deadline, true));
        assert!(!b.feed_is_expired(published, exactly_at_deadline, false));
    }

    #[test]
    fn median_is_idempotent() {
        let mut b = bitasset_with(vec![
            (1, feed(900, 1600, 1100, None)),
            (2, feed(1000, 1750, 1200, None)),
            (3, feed(1100, 2000, 1500, None)),
        ]);
        update_median_feeds(&mut b, now(), false).unwrap();
        let first = b.median_feed;
        let changed = update_median_feeds(&mut b, now(), false).unwrap();
        assert!(!changed);
        assert_eq!(first, b.median_feed);
    }
}
