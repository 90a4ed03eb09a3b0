//! Typed object ids in the `(space, type, instance)` scheme.
//!
//! Every entity the registry owns is addressed by one of these ids. They are
//! allocated monotonically, never reused, and stored wherever the source
//! material would hold a pointer. Cross-entity references always go through
//! the registry, never through in-memory references.

use crate::impl_object_id;

/// The protocol object space. A second space is reserved for implementation
/// objects should the host ever need one.
pub const PROTOCOL_SPACE: u8 = 1;

impl_object_id!(AccountId, 1, 2);
impl_object_id!(AssetId, 1, 3);
impl_object_id!(ForceSettlementId, 1, 4);
impl_object_id!(LimitOrderId, 1, 7);
impl_object_id!(CallOrderId, 1, 8);
impl_object_id!(VestingBalanceId, 1, 13);
impl_object_id!(CollateralBidId, 1, 17);
