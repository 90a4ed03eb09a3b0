//! Write-ahead undo log.
//!
//! Each frame records `(entity id, before-image | tombstone)` pairs in
//! mutation order. Committing concatenates into the parent frame; discarding
//! reverse-applies. The outermost frame is the block boundary. Projections
//! are not logged: they are derived from the records being restored.

use crate::{
    asset::records::AssetRecord,
    authority::AccountRecord,
    market::{
        call_order::CallOrder,
        limit_order::LimitOrder,
        settlement::{CollateralBid, ForceSettlement},
    },
    types::{
        AccountId, Amount, AssetId, CallOrderId, CollateralBidId, ForceSettlementId, LimitOrderId,
        VestingBalanceId,
    },
    vesting::VestingBalance,
};

/// `Some(image)` restores the record to the image; `None` deletes the record
/// that the logged mutation created.
#[derive(Debug, Clone)]
pub(crate) enum UndoEntry {
    Account(AccountId, Option<AccountRecord>),
    Asset(AssetId, Option<AssetRecord>),
    LimitOrder(LimitOrderId, Option<LimitOrder>),
    CallOrder(CallOrderId, Option<CallOrder>),
    Settlement(ForceSettlementId, Option<ForceSettlement>),
    Bid(CollateralBidId, Option<CollateralBid>),
    Vesting(VestingBalanceId, Option<VestingBalance>),
    Balance(AccountId, AssetId, Option<Amount>),
}

/// Monotonic id allocation state. Snapshotted per frame so a discard also
/// rolls allocation back and ids stay dense across rejected transactions.
#[derive(Debug, Clone, Default)]
pub(crate) struct IdCounters {
    pub next_account: u64,
    pub next_asset: u64,
    pub next_limit_order: u64,
    pub next_call_order: u64,
    pub next_settlement: u64,
    pub next_bid: u64,
    pub next_vesting: u64,
}

#[derive(Debug)]
pub(crate) struct UndoFrame {
    pub entries: Vec<UndoEntry>,
    pub counters_before: IdCounters,
}

impl UndoFrame {
    pub fn new(counters_before: IdCounters) -> Self {
        Self {
            entries: Vec::new(),
            counters_before,
        }
    }
}
