//! Shared ledger fixture for the integration scenarios.
//!
//! Every scenario starts from a fresh ledger with the core asset and two
//! funded actors, `dan` and `sam`, and drives the engine exclusively through
//! operations so the whole evaluator/session path is exercised.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use tidepool::{
    asset::flags,
    chain::operations::BitassetOptions,
    error::TidepoolResult,
    types::{AccountId, Amount, AssetAmount, AssetId},
    AppliedOperation, BlockContext, HardforkSchedule, Ledger, Operation, Price, PriceFeed,
    Transaction,
};

pub const FUNDING: i64 = 10_000_000;

pub fn genesis_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()
}

pub struct TestChain {
    pub ledger: Ledger,
    pub dan: AccountId,
    pub sam: AccountId,
    pub block: u64,
    pub time: DateTime<Utc>,
}

impl TestChain {
    /// Fresh ledger, every hardfork active, dan and sam funded with
    /// 10,000,000 core each.
    pub fn new() -> Self {
        Self::with_hardforks(HardforkSchedule::all_active())
    }

    pub fn with_hardforks(hardforks: HardforkSchedule) -> Self {
        let mut ledger = Ledger::new(hardforks);
        let dan = ledger.create_account("dan");
        let sam = ledger.create_account("sam");
        ledger.genesis_fund(dan, Amount(FUNDING)).unwrap();
        ledger.genesis_fund(sam, Amount(FUNDING)).unwrap();
        Self {
            ledger,
            dan,
            sam,
            block: 1,
            time: genesis_time(),
        }
    }

    pub fn core(&self) -> AssetId {
        self.ledger.core_asset()
    }

    pub fn ctx(&self) -> BlockContext {
        BlockContext {
            number: self.block,
            time: self.time,
        }
    }

    pub fn advance(&mut self, seconds: i64) {
        self.block += 1;
        self.time += Duration::seconds(seconds);
    }

    /// Applies a single operation as its own transaction. The block number
    /// advances; time moves only through explicit `advance` calls so tests
    /// control vesting and expiry timings exactly.
    pub fn apply(&mut self, op: Operation) -> TidepoolResult<Vec<AppliedOperation>> {
        let tx = Transaction {
            operations: vec![op],
            expiration: self.time + Duration::seconds(300),
        };
        let applied = self.ledger.push_transaction(&tx, self.ctx());
        self.block += 1;
        applied
    }

    pub fn maintenance(&mut self) -> Vec<AppliedOperation> {
        let applied = self.ledger.apply_maintenance(self.ctx()).unwrap();
        self.block += 1;
        applied
    }

    pub fn balance(&self, account: AccountId, asset: AssetId) -> i64 {
        self.ledger.registry().balance(account, asset).0
    }

    pub fn fee(&self) -> AssetAmount {
        AssetAmount::new(0, self.core())
    }

    // ============================================================================================
    // Operation builders
    // ============================================================================================

    pub fn transfer(&mut self, from: AccountId, to: AccountId, amount: AssetAmount) -> TidepoolResult<Vec<AppliedOperation>> {
        let fee = self.fee();
        self.apply(Operation::Transfer {
            fee,
            from,
            to,
            amount,
        })
    }

    /// Creates a bitasset issued by `issuer` and backed by core, with wide-
    /// open defaults: one feed producer suffices, no fees, one-day windows.
    pub fn create_bitasset(&mut self, issuer: AccountId, symbol: &str) -> AssetId {
        self.create_bitasset_with(issuer, symbol, |_| {})
    }

    pub fn create_bitasset_with(
        &mut self,
        issuer: AccountId,
        symbol: &str,
        tweak: impl FnOnce(&mut BitassetOptions),
    ) -> AssetId {
        let core = self.core();
        let mut bitasset_options = BitassetOptions {
            backing_asset: core,
            feed_lifetime_sec: 24 * 60 * 60,
            minimum_feeds: 1,
            force_settlement_delay_sec: 24 * 60 * 60,
            force_settlement_offset_percent: 0,
            maximum_force_settlement_volume: 200,
            margin_call_fee_ratio: 0,
            initial_collateral_ratio: None,
        };
        tweak(&mut bitasset_options);
        let op = Operation::AssetCreate {
            fee: self.fee(),
            issuer,
            symbol: symbol.to_string(),
            precision: 5,
            common_options: default_mia_options(core),
            bitasset_options: Some(bitasset_options),
            is_prediction_market: false,
        };
        let applied = self.apply(op).unwrap();
        extract_asset_id(&applied)
    }

    pub fn create_prediction_market(&mut self, issuer: AccountId, symbol: &str) -> AssetId {
        let core = self.core();
        let op = Operation::AssetCreate {
            fee: self.fee(),
            issuer,
            symbol: symbol.to_string(),
            precision: 5,
            common_options: default_mia_options(core),
            bitasset_options: Some(BitassetOptions {
                backing_asset: core,
                feed_lifetime_sec: 24 * 60 * 60,
                minimum_feeds: 1,
                force_settlement_delay_sec: 0,
                force_settlement_offset_percent: 0,
                maximum_force_settlement_volume: 1000,
                margin_call_fee_ratio: 0,
                initial_collateral_ratio: None,
            }),
            is_prediction_market: true,
        };
        let applied = self.apply(op).unwrap();
        extract_asset_id(&applied)
    }

    /// Publishes a feed quoting `debt_amount` debt per `collateral_amount`
    /// core collateral.
    pub fn publish_feed(
        &mut self,
        publisher: AccountId,
        asset: AssetId,
        debt_amount: i64,
        collateral_amount: i64,
        mcr: u16,
        mssr: u16,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        let feed = self.feed_of(asset, debt_amount, collateral_amount, mcr, mssr, None);
        let fee = self.fee();
        self.apply(Operation::AssetPublishFeed {
            fee,
            publisher,
            asset_id: asset,
            feed,
        })
    }

    pub fn feed_of(
        &self,
        asset: AssetId,
        debt_amount: i64,
        collateral_amount: i64,
        mcr: u16,
        mssr: u16,
        icr: Option<u16>,
    ) -> PriceFeed {
        let core = self.core();
        PriceFeed {
            settlement_price: Price::from_amounts(debt_amount, asset, collateral_amount, core),
            core_exchange_rate: Price::from_amounts(debt_amount, asset, collateral_amount, core),
            maintenance_collateral_ratio: mcr,
            maximum_short_squeeze_ratio: mssr,
            initial_collateral_ratio: icr,
        }
    }

    /// `call_order_update` with positive deltas: mint `debt` against
    /// `collateral` core.
    pub fn borrow(
        &mut self,
        who: AccountId,
        asset: AssetId,
        debt: i64,
        collateral: i64,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        self.call_order_update(who, asset, debt, collateral, None)
    }

    /// `call_order_update` with negative deltas: burn `debt` and withdraw
    /// `collateral` core.
    pub fn cover(
        &mut self,
        who: AccountId,
        asset: AssetId,
        debt: i64,
        collateral: i64,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        self.call_order_update(who, asset, -debt, -collateral, None)
    }

    pub fn call_order_update(
        &mut self,
        who: AccountId,
        asset: AssetId,
        delta_debt: i64,
        delta_collateral: i64,
        target_collateral_ratio: Option<u16>,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        let core = self.core();
        let fee = self.fee();
        self.apply(Operation::CallOrderUpdate {
            fee,
            funding_account: who,
            delta_collateral: AssetAmount::new(delta_collateral, core),
            delta_debt: AssetAmount::new(delta_debt, asset),
            target_collateral_ratio,
        })
    }

    pub fn limit_order(
        &mut self,
        seller: AccountId,
        sell: AssetAmount,
        receive: AssetAmount,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        let fee = self.fee();
        self.apply(Operation::LimitOrderCreate {
            fee,
            seller,
            amount_to_sell: sell,
            min_to_receive: receive,
            expiration: None,
            fill_or_kill: false,
        })
    }

    pub fn settle(
        &mut self,
        account: AccountId,
        amount: AssetAmount,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        let fee = self.fee();
        self.apply(Operation::AssetSettle {
            fee,
            account,
            amount,
        })
    }

    /// Creates a plain user-issued asset with no market fees or listings.
    pub fn create_uia(&mut self, issuer: AccountId, symbol: &str) -> AssetId {
        self.create_uia_with(issuer, symbol, |_| {})
    }

    pub fn create_uia_with(
        &mut self,
        issuer: AccountId,
        symbol: &str,
        tweak: impl FnOnce(&mut tidepool::asset::records::AssetOptions),
    ) -> AssetId {
        let core = self.core();
        let mut common_options = tidepool::asset::records::AssetOptions {
            max_supply: Amount(1_000_000_000_000),
            market_fee_percent: 0,
            issuer_permissions: flags::UIA_PERMISSION_MASK,
            flags: 0,
            core_exchange_rate: Price::identity(core),
            whitelist_authorities: Default::default(),
            blacklist_authorities: Default::default(),
        };
        tweak(&mut common_options);
        let op = Operation::AssetCreate {
            fee: self.fee(),
            issuer,
            symbol: symbol.to_string(),
            precision: 5,
            common_options,
            bitasset_options: None,
            is_prediction_market: false,
        };
        let applied = self.apply(op).unwrap();
        extract_asset_id(&applied)
    }

    pub fn issue(
        &mut self,
        issuer: AccountId,
        asset: AssetId,
        amount: i64,
        to: AccountId,
    ) -> TidepoolResult<Vec<AppliedOperation>> {
        let fee = self.fee();
        self.apply(Operation::AssetIssue {
            fee,
            issuer,
            asset_to_issue: AssetAmount::new(amount, asset),
            issue_to_account: to,
        })
    }

    pub fn has_settlement(&self, asset: AssetId) -> bool {
        self.ledger
            .registry()
            .asset(asset)
            .unwrap()
            .bitasset
            .as_ref()
            .unwrap()
            .has_settlement()
    }

    pub fn call_position(&self, who: AccountId, asset: AssetId) -> Option<(i64, i64)> {
        let registry = self.ledger.registry();
        registry.find_call_order(who, asset).map(|id| {
            let call = registry.call_order(id).unwrap();
            (call.debt.amount.0, call.collateral.amount.0)
        })
    }
}

pub fn default_mia_options(core: AssetId) -> tidepool::asset::records::AssetOptions {
    tidepool::asset::records::AssetOptions {
        max_supply: Amount(1_000_000_000_000),
        market_fee_percent: 0,
        issuer_permissions: flags::MIA_PERMISSION_MASK,
        flags: 0,
        core_exchange_rate: Price::identity(core),
        whitelist_authorities: Default::default(),
        blacklist_authorities: Default::default(),
    }
}

pub fn extract_asset_id(applied: &[AppliedOperation]) -> AssetId {
    applied
        .iter()
        .find_map(|a| match a.result {
            tidepool::OperationOutcome::Asset(id) => Some(id),
            _ => None,
        })
        .expect("asset create returns its id")
}

/// Supply conservation (the strongest global invariant): for every asset,
/// circulating balances plus every escrow role equal the recorded supply.
pub fn assert_supply_conservation(ledger: &Ledger) {
    let registry = ledger.registry();
    let core = ledger.core_asset();

    for (asset_id, asset) in registry.assets() {
        let mut held: i128 = 0;

        for ((_, balance_asset), amount) in registry.balances() {
            if balance_asset == asset_id {
                held += amount.0 as i128;
            }
        }
        for (_, order) in registry.limit_orders() {
            if order.sell_asset() == asset_id {
                held += order.for_sale.0 as i128;
            }
        }
        for (_, call) in registry.call_orders() {
            if call.collateral.asset_id == asset_id {
                held += call.collateral.amount.0 as i128;
            }
        }
        for (_, settlement) in registry.settlements_iter() {
            if settlement.balance.asset_id == asset_id {
                held += settlement.balance.amount.0 as i128;
            }
        }
        for (_, bid) in registry.bids_iter() {
            if bid.collateral.asset_id == asset_id {
                held += bid.collateral.amount.0 as i128;
            }
        }
        for (_, vesting) in registry.vesting_balances() {
            if vesting.balance.asset_id == asset_id {
                held += vesting.balance.amount.0 as i128;
            }
        }
        for (_, other) in registry.assets() {
            if let Some(bitasset) = &other.bitasset {
                if bitasset.backing_asset == asset_id {
                    if let Some(settlement) = &bitasset.settlement {
                        held += settlement.fund.0 as i128;
                    }
                    held += other.dynamic.accumulated_collateral_fees.0 as i128;
                }
            }
            if asset_id == core {
                held += other.dynamic.fee_pool.0 as i128;
            }
        }
        held += asset.dynamic.accumulated_fees.0 as i128;

        assert_eq!(
            held, asset.dynamic.current_supply.0 as i128,
            "supply conservation broken for asset {asset_id}"
        );
    }
}
