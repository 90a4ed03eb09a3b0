use thiserror::Error;

use crate::types::ids::{AccountId, AssetId, CallOrderId, LimitOrderId};

pub type TidepoolResult<T> = Result<T, TidepoolError>;

/// No error is caught inside the core: every failure unwinds the active
/// transactional session, and the driver surfaces the kind plus context chain
/// to the caller.
#[derive(Debug, Error)]
pub enum TidepoolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Funds(#[from] FundsError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The operation is ill-formed independent of ledger state. Never recovered.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Amount out of range: {0}")]
    AmountOutOfRange(i64),

    #[error("Amount arithmetic overflow")]
    AmountOverflow,

    #[error("Operation fee may not be negative")]
    NegativeFee,

    #[error("Amount must be strictly positive")]
    NonPositiveAmount,

    #[error("Price must have strictly positive base and quote")]
    InvalidPrice,

    #[error("Price multiplication does not involve asset {0}")]
    PriceAssetMismatch(AssetId),

    #[error("Prices quote different asset pairs")]
    PricePairMismatch,

    #[error("Sell and receive asset must differ")]
    IdenticalAssetPair,

    #[error("Debt and collateral asset must differ")]
    IdenticalDebtCollateral,

    #[error("Invalid asset symbol: '{0}'")]
    InvalidSymbol(String),

    #[error("Asset precision {0} exceeds the maximum of 12")]
    InvalidPrecision(u8),

    #[error("Maximum supply out of range: {0}")]
    InvalidMaxSupply(i64),

    #[error("Maintenance collateral ratio {0} outside [1001, 32000]")]
    McrOutOfRange(u16),

    #[error("Maximum short squeeze ratio {0} outside [1001, 32000]")]
    MssrOutOfRange(u16),

    #[error("Initial collateral ratio {0} outside [1001, 32000]")]
    IcrOutOfRange(u16),

    #[error("Market fee {0}\u{2030} exceeds 1000\u{2030}")]
    MarketFeeOutOfRange(u16),

    #[error("Flags {flags:#x} not covered by issuer permissions {permissions:#x}")]
    FlagsOutsidePermissions { flags: u16, permissions: u16 },

    #[error("Transaction expired at {0}")]
    TransactionExpired(chrono::DateTime<chrono::Utc>),

    #[error("Transaction contains no operations")]
    EmptyTransaction,

    #[error("An account may not list itself")]
    SelfListing,

    #[error("Transfer source and destination must differ")]
    SelfTransfer,

    #[error("A prediction market must be created as a market-issued asset")]
    PredictionMarketRequiresBitasset,

    #[error("Invalid bitasset parameter: {0}")]
    InvalidBitassetParameter(&'static str),

    #[error("Feed publication for {0} is not a market-issued asset")]
    FeedOnNonBitasset(AssetId),
}

/// An account or publisher is not permitted to take part in the operation.
#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("Account {account} is not authorized to transact in asset {asset}")]
    AssetHolding { account: AccountId, asset: AssetId },

    #[error("Account {account} is not an approved feed producer for asset {asset}")]
    NotFeedProducer { account: AccountId, asset: AssetId },

    #[error("Account {account} is not the issuer of asset {asset}")]
    NotIssuer { account: AccountId, asset: AssetId },

    #[error("Account {account} does not own the order being cancelled")]
    NotOrderOwner { account: AccountId },

    #[error("Account {account} does not own the vesting balance")]
    NotVestingOwner { account: AccountId },
}

/// A balance, fee pool or collateral position would go negative.
#[derive(Debug, Error)]
pub enum FundsError {
    #[error("Account {account} holds {available} of asset {asset}, needs {required}")]
    InsufficientBalance {
        account: AccountId,
        asset: AssetId,
        available: i64,
        required: i64,
    },

    #[error("Fee pool of asset {asset} holds {available} core, needs {required}")]
    InsufficientFeePool {
        asset: AssetId,
        available: i64,
        required: i64,
    },

    #[error("Call order {order} holds {available} collateral, needs {required}")]
    InsufficientCollateral {
        order: CallOrderId,
        available: i64,
        required: i64,
    },

    #[error("Vesting balance has not matured: earned {earned} coin-seconds, required {required}")]
    VestingImmature { earned: i128, required: i128 },
}

/// The action is forbidden by the current ledger state.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("Covering {cover} exceeds outstanding debt {debt}")]
    CoverExceedsDebt { cover: i64, debt: i64 },

    #[error("Closing a debt position must withdraw all collateral")]
    ResidualCollateral,

    #[error("Asset {0} is already in global settlement")]
    AlreadyGloballySettled(AssetId),

    #[error("Asset {0} is not in global settlement")]
    NotGloballySettled(AssetId),

    #[error("Asset {0} is not market-issued")]
    NotMarketIssued(AssetId),

    #[error("Asset {0} has no valid price feed")]
    NoFeed(AssetId),

    #[error("Mutation would leave call order {order} below the required collateralization")]
    Undercollateralized { order: CallOrderId },

    #[error("Mutation would trigger a global settlement of asset {0}")]
    WouldTriggerGlobalSettlement(AssetId),

    #[error("Prediction market positions must hold collateral equal to debt")]
    PredictionMarketMismatch,

    #[error("Force settlement is disabled for asset {0}")]
    ForceSettleDisabled(AssetId),

    #[error("Issuing {amount} would exceed the maximum supply {max} of asset {asset}")]
    SupplyExceeded {
        asset: AssetId,
        amount: i64,
        max: i64,
    },

    #[error("Asset {0} still has outstanding supply")]
    SupplyOutstanding(AssetId),

    #[error("Permissions may only be narrowed once supply exists")]
    PermissionWiden,

    #[error("Backing asset may not change while supply exists")]
    BackingChangeWithSupply,

    #[error("Initial collateral ratio is not recognized before its activation time")]
    IcrBeforeActivation,

    #[error("Collateral bids are only accepted while the asset is globally settled")]
    BidOutsideSettlement,

    #[error("Asset {0} does not carry the global-settle permission")]
    GlobalSettleNotPermitted(AssetId),
}

/// The object is in the wrong phase of its lifecycle for the operation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Virtual operations may not appear in a transaction body")]
    VirtualOperationSubmitted,

    #[error("Market-issued asset {0} cannot be reserved; cover or settle instead")]
    ReserveMarketIssued(AssetId),

    #[error("Market-issued asset {0} mints only against collateral")]
    IssueMarketIssued(AssetId),

    #[error("Fill-or-kill order was not fully filled")]
    FillOrKillUnfilled,

    #[error("Prediction market {0} can only resolve by global settlement")]
    PredictionMarketSettle(AssetId),
}

/// A dangling or mistyped object reference. Indicates a malformed operation
/// rather than an engine defect; surfaces like a validation failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown account id {0}")]
    UnknownAccount(AccountId),

    #[error("Unknown asset id {0}")]
    UnknownAsset(AssetId),

    #[error("Unknown limit order id {0}")]
    UnknownLimitOrder(LimitOrderId),

    #[error("Unknown call order id {0}")]
    UnknownCallOrder(CallOrderId),

    #[error("No call order for this owner and debt asset")]
    NoCallPosition,

    #[error("Unknown force settlement id")]
    UnknownSettlement,

    #[error("Unknown collateral bid id")]
    UnknownBid,

    #[error("Unknown vesting balance id")]
    UnknownVestingBalance,
}
