//! The object registry: typed arenas, derived ordered indices and nested
//! undo sessions.
//!
//! Entities are records in per-kind arenas addressed by monotonically
//! increasing ids. Cross-entity references are stored as ids and dereferenced
//! through the registry. The ordered indices (order book, call
//! collateralization, expiration and bid queues) are projections over the
//! arenas: every mutation goes through the helpers here, which keep the
//! projections in sync and log before-images into the active session.

pub mod index;
pub mod session;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::{
    asset::records::AssetRecord,
    authority::AccountRecord,
    error::{FundsError, RegistryError, TidepoolResult, ValidationError},
    market::{
        call_order::CallOrder,
        limit_order::LimitOrder,
        settlement::{CollateralBid, ForceSettlement},
    },
    registry::{
        index::{BidKey, BookKey, CallKey},
        session::{IdCounters, UndoEntry, UndoFrame},
    },
    types::{
        AccountId, Amount, AssetId, CallOrderId, CollateralBidId, ForceSettlementId, LimitOrderId,
        VestingBalanceId,
    },
    vesting::VestingBalance,
};

/// The id of an object a committed block touched, for observers. Deltas are
/// reported per entity, deduplicated, in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangedObject {
    Account(AccountId),
    Asset(AssetId),
    LimitOrder(LimitOrderId),
    CallOrder(CallOrderId),
    Settlement(ForceSettlementId),
    Bid(CollateralBidId),
    VestingBalance(VestingBalanceId),
    Balance(AccountId, AssetId),
}

impl UndoEntry {
    fn changed_object(&self) -> ChangedObject {
        match self {
            UndoEntry::Account(id, _) => ChangedObject::Account(*id),
            UndoEntry::Asset(id, _) => ChangedObject::Asset(*id),
            UndoEntry::LimitOrder(id, _) => ChangedObject::LimitOrder(*id),
            UndoEntry::CallOrder(id, _) => ChangedObject::CallOrder(*id),
            UndoEntry::Settlement(id, _) => ChangedObject::Settlement(*id),
            UndoEntry::Bid(id, _) => ChangedObject::Bid(*id),
            UndoEntry::Vesting(id, _) => ChangedObject::VestingBalance(*id),
            UndoEntry::Balance(account, asset, _) => ChangedObject::Balance(*account, *asset),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    accounts: BTreeMap<AccountId, AccountRecord>,
    assets: BTreeMap<AssetId, AssetRecord>,
    limit_orders: BTreeMap<LimitOrderId, LimitOrder>,
    call_orders: BTreeMap<CallOrderId, CallOrder>,
    settlements: BTreeMap<ForceSettlementId, ForceSettlement>,
    bids: BTreeMap<CollateralBidId, CollateralBid>,
    vesting_balances: BTreeMap<VestingBalanceId, VestingBalance>,
    balances: BTreeMap<(AccountId, AssetId), Amount>,

    // Derived projections, rebuilt entry-by-entry on every arena mutation.
    book: BTreeSet<BookKey>,
    order_expirations: BTreeSet<(DateTime<Utc>, LimitOrderId)>,
    call_index: BTreeSet<CallKey>,
    call_by_position: BTreeMap<(AccountId, AssetId), CallOrderId>,
    settle_queue: BTreeSet<(AssetId, DateTime<Utc>, ForceSettlementId)>,
    bid_index: BTreeSet<BidKey>,
    bid_by_bidder: BTreeMap<(AccountId, AssetId), CollateralBidId>,

    counters: IdCounters,
    sessions: Vec<UndoFrame>,
    changed_objects: BTreeSet<ChangedObject>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================================================
    // Sessions
    // ============================================================================================

    /// Opens a nested undo frame. Every mutation until the matching commit or
    /// discard is logged with its before-image.
    pub fn start_session(&mut self) {
        self.sessions.push(UndoFrame::new(self.counters.clone()));
    }

    /// Merges the innermost frame into its parent, or finalizes it at the
    /// outermost level (the block boundary), where the touched ids feed the
    /// changed-object stream.
    pub fn commit_session(&mut self) {
        let frame = self
            .sessions
            .pop()
            .expect("commit without an open session");
        if let Some(parent) = self.sessions.last_mut() {
            parent.entries.extend(frame.entries);
        } else {
            self.changed_objects
                .extend(frame.entries.iter().map(UndoEntry::changed_object));
        }
    }

    /// Ids touched by effects committed since the last drain. Observers are
    /// notified only of committed state; discarded sessions leave no trace.
    pub fn drain_changed_objects(&mut self) -> Vec<ChangedObject> {
        std::mem::take(&mut self.changed_objects).into_iter().collect()
    }

    /// Reverse-applies the innermost frame, restoring records, projections
    /// and id counters to their state at `start_session`.
    pub fn discard_session(&mut self) {
        let frame = self
            .sessions
            .pop()
            .expect("discard without an open session");
        for entry in frame.entries.into_iter().rev() {
            self.restore(entry);
        }
        self.counters = frame.counters_before;
    }

    pub fn session_depth(&self) -> usize {
        self.sessions.len()
    }

    fn log(&mut self, entry: UndoEntry) {
        if let Some(frame) = self.sessions.last_mut() {
            frame.entries.push(entry);
        }
    }

    fn restore(&mut self, entry: UndoEntry) {
        match entry {
            UndoEntry::Account(id, image) => match image {
                Some(record) => {
                    self.accounts.insert(id, record);
                }
                None => {
                    self.accounts.remove(&id);
                }
            },
            UndoEntry::Asset(id, image) => match image {
                Some(record) => {
                    self.assets.insert(id, record);
                }
                None => {
                    self.assets.remove(&id);
                }
            },
            UndoEntry::LimitOrder(id, image) => {
                if let Some(current) = self.limit_orders.remove(&id) {
                    self.unindex_limit_order(id, &current);
                }
                if let Some(record) = image {
                    self.index_limit_order(id, &record);
                    self.limit_orders.insert(id, record);
                }
            }
            UndoEntry::CallOrder(id, image) => {
                if let Some(current) = self.call_orders.remove(&id) {
                    self.unindex_call_order(id, &current);
                }
                if let Some(record) = image {
                    self.index_call_order(id, &record);
                    self.call_orders.insert(id, record);
                }
            }
            UndoEntry::Settlement(id, image) => {
                if let Some(current) = self.settlements.remove(&id) {
                    self.settle_queue.remove(&(
                        current.balance.asset_id,
                        current.settlement_date,
                        id,
                    ));
                }
                if let Some(record) = image {
                    self.settle_queue
                        .insert((record.balance.asset_id, record.settlement_date, id));
                    self.settlements.insert(id, record);
                }
            }
            UndoEntry::Bid(id, image) => {
                if let Some(current) = self.bids.remove(&id) {
                    self.unindex_bid(id, &current);
                }
                if let Some(record) = image {
                    self.index_bid(id, &record);
                    self.bids.insert(id, record);
                }
            }
            UndoEntry::Vesting(id, image) => match image {
                Some(record) => {
                    self.vesting_balances.insert(id, record);
                }
                None => {
                    self.vesting_balances.remove(&id);
                }
            },
            UndoEntry::Balance(account, asset, image) => match image {
                Some(amount) => {
                    self.balances.insert((account, asset), amount);
                }
                None => {
                    self.balances.remove(&(account, asset));
                }
            },
        }
    }

    // ============================================================================================
    // Accounts
    // ============================================================================================

    pub fn create_account(&mut self, name: impl Into<String>) -> AccountId {
        let id = AccountId(self.counters.next_account);
        self.counters.next_account += 1;
        self.log(UndoEntry::Account(id, None));
        self.accounts.insert(
            id,
            AccountRecord {
                name: name.into(),
                whitelisted: BTreeSet::new(),
                blacklisted: BTreeSet::new(),
            },
        );
        id
    }

    pub fn account(&self, id: AccountId) -> TidepoolResult<&AccountRecord> {
        self.accounts
            .get(&id)
            .ok_or_else(|| RegistryError::UnknownAccount(id).into())
    }

    pub fn modify_account(
        &mut self,
        id: AccountId,
        f: impl FnOnce(&mut AccountRecord),
    ) -> TidepoolResult<()> {
        let record = self
            .accounts
            .get_mut(&id)
            .ok_or(RegistryError::UnknownAccount(id))?;
        let before = record.clone();
        f(record);
        self.log(UndoEntry::Account(id, Some(before)));
        Ok(())
    }

    // ============================================================================================
    // Assets
    // ============================================================================================

    pub fn create_asset(&mut self, record: AssetRecord) -> TidepoolResult<AssetId> {
        if self.assets.values().any(|a| a.symbol == record.symbol) {
            return Err(ValidationError::InvalidSymbol(record.symbol).into());
        }
        let id = AssetId(self.counters.next_asset);
        self.counters.next_asset += 1;
        self.log(UndoEntry::Asset(id, None));
        self.assets.insert(id, record);
        Ok(id)
    }

    pub fn asset(&self, id: AssetId) -> TidepoolResult<&AssetRecord> {
        self.assets
            .get(&id)
            .ok_or_else(|| RegistryError::UnknownAsset(id).into())
    }

    pub fn modify_asset<R>(
        &mut self,
        id: AssetId,
        f: impl FnOnce(&mut AssetRecord) -> R,
    ) -> TidepoolResult<R> {
        let record = self
            .assets
            .get_mut(&id)
            .ok_or(RegistryError::UnknownAsset(id))?;
        let before = record.clone();
        let out = f(record);
        self.log(UndoEntry::Asset(id, Some(before)));
        Ok(out)
    }

    pub fn assets(&self) -> impl Iterator<Item = (AssetId, &AssetRecord)> {
        self.assets.iter().map(|(id, record)| (*id, record))
    }

    // ============================================================================================
    // Balances
    // ============================================================================================

    pub fn balance(&self, account: AccountId, asset: AssetId) -> Amount {
        self.balances
            .get(&(account, asset))
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Adjusts a balance by a signed delta, rejecting results outside the
    /// valid on-hand range.
    pub fn adjust_balance(
        &mut self,
        account: AccountId,
        asset: AssetId,
        delta: Amount,
    ) -> TidepoolResult<()> {
        self.account(account)?;
        let before = self.balances.get(&(account, asset)).copied();
        let current = before.unwrap_or(Amount::ZERO);
        let next = current.checked_add(delta)?;
        if next.is_negative() {
            return Err(FundsError::InsufficientBalance {
                account,
                asset,
                available: current.0,
                required: -delta.0,
            }
            .into());
        }
        if !next.is_valid_supply() {
            return Err(ValidationError::AmountOutOfRange(next.0).into());
        }
        self.log(UndoEntry::Balance(account, asset, before));
        self.balances.insert((account, asset), next);
        Ok(())
    }

    pub fn balances(&self) -> impl Iterator<Item = ((AccountId, AssetId), Amount)> + '_ {
        self.balances.iter().map(|(k, v)| (*k, *v))
    }

    // ============================================================================================
    // Limit orders
    // ============================================================================================

    fn index_limit_order(&mut self, id: LimitOrderId, order: &LimitOrder) {
        self.book.insert(BookKey::of(id, order));
        if let Some(exp) = order.expiration {
            self.order_expirations.insert((exp, id));
        }
    }

    fn unindex_limit_order(&mut self, id: LimitOrderId, order: &LimitOrder) {
        self.book.remove(&BookKey::of(id, order));
        if let Some(exp) = order.expiration {
            self.order_expirations.remove(&(exp, id));
        }
    }

    pub fn insert_limit_order(&mut self, order: LimitOrder) -> LimitOrderId {
        let id = LimitOrderId(self.counters.next_limit_order);
        self.counters.next_limit_order += 1;
        self.log(UndoEntry::LimitOrder(id, None));
        self.index_limit_order(id, &order);
        self.limit_orders.insert(id, order);
        id
    }

    pub fn limit_order(&self, id: LimitOrderId) -> TidepoolResult<&LimitOrder> {
        self.limit_orders
            .get(&id)
            .ok_or_else(|| RegistryError::UnknownLimitOrder(id).into())
    }

    pub fn modify_limit_order(
        &mut self,
        id: LimitOrderId,
        f: impl FnOnce(&mut LimitOrder),
    ) -> TidepoolResult<()> {
        let mut record = self
            .limit_orders
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownLimitOrder(id))?;
        self.unindex_limit_order(id, &record);
        self.log(UndoEntry::LimitOrder(id, Some(record.clone())));
        f(&mut record);
        self.index_limit_order(id, &record);
        self.limit_orders.insert(id, record);
        Ok(())
    }

    pub fn remove_limit_order(&mut self, id: LimitOrderId) -> TidepoolResult<LimitOrder> {
        let record = self
            .limit_orders
            .remove(&id)
            .ok_or(RegistryError::UnknownLimitOrder(id))?;
        self.unindex_limit_order(id, &record);
        self.log(UndoEntry::LimitOrder(id, Some(record.clone())));
        Ok(record)
    }

    /// Ids of live orders selling `sell` for `receive`, best price first,
    /// insertion order within a price level.
    pub fn book_orders(&self, sell: AssetId, receive: AssetId) -> Vec<LimitOrderId> {
        self.book
            .range(BookKey::pair_range(sell, receive))
            .map(|key| key.id)
            .collect()
    }

    /// Orders expiring at or before `now`.
    pub fn expired_orders(&self, now: DateTime<Utc>) -> Vec<LimitOrderId> {
        self.order_expirations
            .iter()
            .take_while(|(exp, _)| *exp <= now)
            .map(|(_, id)| *id)
            .collect()
    }

    // ============================================================================================
    // Call orders
    // ============================================================================================

    fn index_call_order(&mut self, id: CallOrderId, order: &CallOrder) {
        self.call_index.insert(CallKey::of(id, order));
        self.call_by_position
            .insert((order.borrower, order.debt_asset()), id);
    }

    fn unindex_call_order(&mut self, id: CallOrderId, order: &CallOrder) {
        self.call_index.remove(&CallKey::of(id, order));
        self.call_by_position
            .remove(&(order.borrower, order.debt_asset()));
    }

    pub fn insert_call_order(&mut self, order: CallOrder) -> CallOrderId {
        let id = CallOrderId(self.counters.next_call_order);
        self.counters.next_call_order += 1;
        self.log(UndoEntry::CallOrder(id, None));
        self.index_call_order(id, &order);
        self.call_orders.insert(id, order);
        id
    }

    pub fn call_order(&self, id: CallOrderId) -> TidepoolResult<&CallOrder> {
        self.call_orders
            .get(&id)
            .ok_or_else(|| RegistryError::UnknownCallOrder(id).into())
    }

    pub fn find_call_order(&self, borrower: AccountId, debt_asset: AssetId) -> Option<CallOrderId> {
        self.call_by_position.get(&(borrower, debt_asset)).copied()
    }

    pub fn modify_call_order(
        &mut self,
        id: CallOrderId,
        f: impl FnOnce(&mut CallOrder),
    ) -> TidepoolResult<()> {
        let mut record = self
            .call_orders
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownCallOrder(id))?;
        self.unindex_call_order(id, &record);
        self.log(UndoEntry::CallOrder(id, Some(record.clone())));
        f(&mut record);
        self.index_call_order(id, &record);
        self.call_orders.insert(id, record);
        Ok(())
    }

    pub fn remove_call_order(&mut self, id: CallOrderId) -> TidepoolResult<CallOrder> {
        let record = self
            .call_orders
            .remove(&id)
            .ok_or(RegistryError::UnknownCallOrder(id))?;
        self.unindex_call_order(id, &record);
        self.log(UndoEntry::CallOrder(id, Some(record.clone())));
        Ok(record)
    }

    /// Ids of call orders in `debt_asset`, least collateralized first.
    pub fn call_orders_by_collateralization(&self, debt_asset: AssetId) -> Vec<CallOrderId> {
        self.call_index
            .range(CallKey::asset_range(debt_asset))
            .map(|key| key.id)
            .collect()
    }

    // ============================================================================================
    // Force settlements
    // ============================================================================================

    pub fn insert_settlement(&mut self, settlement: ForceSettlement) -> ForceSettlementId {
        let id = ForceSettlementId(self.counters.next_settlement);
        self.counters.next_settlement += 1;
        self.log(UndoEntry::Settlement(id, None));
        self.settle_queue.insert((
            settlement.balance.asset_id,
            settlement.settlement_date,
            id,
        ));
        self.settlements.insert(id, settlement);
        id
    }

    pub fn settlement(&self, id: ForceSettlementId) -> TidepoolResult<&ForceSettlement> {
        self.settlements
            .get(&id)
            .ok_or_else(|| RegistryError::UnknownSettlement.into())
    }

    pub fn modify_settlement(
        &mut self,
        id: ForceSettlementId,
        f: impl FnOnce(&mut ForceSettlement),
    ) -> TidepoolResult<()> {
        let mut record = self
            .settlements
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownSettlement)?;
        self.settle_queue
            .remove(&(record.balance.asset_id, record.settlement_date, id));
        self.log(UndoEntry::Settlement(id, Some(record.clone())));
        f(&mut record);
        self.settle_queue
            .insert((record.balance.asset_id, record.settlement_date, id));
        self.settlements.insert(id, record);
        Ok(())
    }

    pub fn remove_settlement(&mut self, id: ForceSettlementId) -> TidepoolResult<ForceSettlement> {
        let record = self
            .settlements
            .remove(&id)
            .ok_or(RegistryError::UnknownSettlement)?;
        self.settle_queue
            .remove(&(record.balance.asset_id, record.settlement_date, id));
        self.log(UndoEntry::Settlement(id, Some(record.clone())));
        Ok(record)
    }

    /// Settlement requests of `asset` due at or before `now`, oldest first.
    pub fn due_settlements(&self, asset: AssetId, now: DateTime<Utc>) -> Vec<ForceSettlementId> {
        self.settle_queue
            .range((asset, DateTime::<Utc>::MIN_UTC, ForceSettlementId(0))..)
            .take_while(|(a, date, _)| *a == asset && *date <= now)
            .map(|(_, _, id)| *id)
            .collect()
    }

    // ============================================================================================
    // Collateral bids
    // ============================================================================================

    fn index_bid(&mut self, id: CollateralBidId, bid: &CollateralBid) {
        self.bid_index.insert(BidKey::of(id, bid));
        self.bid_by_bidder
            .insert((bid.bidder, bid.debt.asset_id), id);
    }

    fn unindex_bid(&mut self, id: CollateralBidId, bid: &CollateralBid) {
        self.bid_index.remove(&BidKey::of(id, bid));
        self.bid_by_bidder
            .remove(&(bid.bidder, bid.debt.asset_id));
    }

    pub fn insert_bid(&mut self, bid: CollateralBid) -> CollateralBidId {
        let id = CollateralBidId(self.counters.next_bid);
        self.counters.next_bid += 1;
        self.log(UndoEntry::Bid(id, None));
        self.index_bid(id, &bid);
        self.bids.insert(id, bid);
        id
    }

    pub fn bid(&self, id: CollateralBidId) -> TidepoolResult<&CollateralBid> {
        self.bids
            .get(&id)
            .ok_or_else(|| RegistryError::UnknownBid.into())
    }

    pub fn find_bid(&self, bidder: AccountId, debt_asset: AssetId) -> Option<CollateralBidId> {
        self.bid_by_bidder.get(&(bidder, debt_asset)).copied()
    }

    pub fn remove_bid(&mut self, id: CollateralBidId) -> TidepoolResult<CollateralBid> {
        let record = self.bids.remove(&id).ok_or(RegistryError::UnknownBid)?;
        self.unindex_bid(id, &record);
        self.log(UndoEntry::Bid(id, Some(record.clone())));
        Ok(record)
    }

    /// Ids of bids on `debt_asset`, highest collateral-per-debt first.
    pub fn bids_by_price(&self, debt_asset: AssetId) -> Vec<CollateralBidId> {
        self.bid_index
            .range(BidKey::asset_range(debt_asset))
            .map(|key| key.id)
            .collect()
    }

    // ============================================================================================
    // Vesting balances
    // ============================================================================================

    pub fn insert_vesting_balance(&mut self, balance: VestingBalance) -> VestingBalanceId {
        let id = VestingBalanceId(self.counters.next_vesting);
        self.counters.next_vesting += 1;
        self.log(UndoEntry::Vesting(id, None));
        self.vesting_balances.insert(id, balance);
        id
    }

    pub fn vesting_balance(&self, id: VestingBalanceId) -> TidepoolResult<&VestingBalance> {
        self.vesting_balances
            .get(&id)
            .ok_or_else(|| RegistryError::UnknownVestingBalance.into())
    }

    pub fn modify_vesting_balance<R>(
        &mut self,
        id: VestingBalanceId,
        f: impl FnOnce(&mut VestingBalance) -> TidepoolResult<R>,
    ) -> TidepoolResult<R> {
        let record = self
            .vesting_balances
            .get_mut(&id)
            .ok_or(RegistryError::UnknownVestingBalance)?;
        let before = record.clone();
        match f(record) {
            Ok(out) => {
                self.log(UndoEntry::Vesting(id, Some(before)));
                Ok(out)
            }
            Err(err) => {
                // The closure may have partially mutated; put the image back.
                self.vesting_balances.insert(id, before);
                Err(err)
            }
        }
    }

    pub fn remove_vesting_balance(&mut self, id: VestingBalanceId) -> TidepoolResult<VestingBalance> {
        let record = self
            .vesting_balances
            .remove(&id)
            .ok_or(RegistryError::UnknownVestingBalance)?;
        self.log(UndoEntry::Vesting(id, Some(record.clone())));
        Ok(record)
    }

    pub fn vesting_balances(
        &self,
    ) -> impl Iterator<Item = (VestingBalanceId, &VestingBalance)> {
        self.vesting_balances.iter().map(|(id, record)| (*id, record))
    }

    pub fn limit_orders(&self) -> impl Iterator<Item = (LimitOrderId, &LimitOrder)> {
        self.limit_orders.iter().map(|(id, record)| (*id, record))
    }

    pub fn call_orders(&self) -> impl Iterator<Item = (CallOrderId, &CallOrder)> {
        self.call_orders.iter().map(|(id, record)| (*id, record))
    }

    pub fn settlements_iter(&self) -> impl Iterator<Item = (ForceSettlementId, &ForceSettlement)> {
        self.settlements.iter().map(|(id, record)| (*id, record))
    }

    pub fn bids_iter(&self) -> impl Iterator<Item = (CollateralBidId, &CollateralBid)> {
        self.bids.iter().map(|(id, record)| (*id, record))
    }
}
