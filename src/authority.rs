//! Per-asset holding authorization.
//!
//! Assets may delegate holder vetting to authority accounts. The gate is
//! asymmetric: a non-empty whitelist demands a positive listing, otherwise a
//! non-empty blacklist demands the absence of a negative one. Listings are
//! mutable, so the gate is evaluated at operation time and never cached.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    asset::records::AssetRecord,
    error::{AuthorizationError, TidepoolResult},
    registry::Registry,
    types::{AccountId, AssetId},
};

/// An account. The core only needs the authority-side listings this account
/// maintains over others; keys, memos and owner histories live with the
/// collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub name: String,
    /// Accounts this account vouches for, as an authority.
    pub whitelisted: BTreeSet<AccountId>,
    /// Accounts this account bans, as an authority.
    pub blacklisted: BTreeSet<AccountId>,
}

/// Whether `account` may hold, trade or settle `asset`.
pub fn is_authorized_asset(registry: &Registry, account: AccountId, asset: &AssetRecord) -> bool {
    if !asset.options.whitelist_authorities.is_empty() {
        let vouched = asset
            .options
            .whitelist_authorities
            .iter()
            .any(|authority| lists(registry, *authority, account, Listing::White));
        if !vouched {
            return false;
        }
    }
    !asset
        .options
        .blacklist_authorities
        .iter()
        .any(|authority| lists(registry, *authority, account, Listing::Black))
}

/// Gate failure as an error, for evaluator call sites.
pub fn ensure_authorized(
    registry: &Registry,
    account: AccountId,
    asset_id: AssetId,
) -> TidepoolResult<()> {
    let asset = registry.asset(asset_id)?;
    if !is_authorized_asset(registry, account, asset) {
        return Err(AuthorizationError::AssetHolding {
            account,
            asset: asset_id,
        }
        .into());
    }
    Ok(())
}

/// The gate for a market-issued asset, optionally extended to its backing
/// asset. The extension activated at a hardfork; before it, `force_settle`
/// and `bid_collateral` skipped the backing check, and replays must too.
pub fn ensure_authorized_with_backing(
    registry: &Registry,
    account: AccountId,
    asset_id: AssetId,
    check_backing: bool,
) -> TidepoolResult<()> {
    ensure_authorized(registry, account, asset_id)?;
    if check_backing {
        if let Some(bitasset) = &registry.asset(asset_id)?.bitasset {
            ensure_authorized(registry, account, bitasset.backing_asset)?;
        }
    }
    Ok(())
}

enum Listing {
    White,
    Black,
}

fn lists(registry: &Registry, authority: AccountId, account: AccountId, side: Listing) -> bool {
    let Ok(record) = registry.account(authority) else {
        return false;
    };
    match side {
        Listing::White => record.whitelisted.contains(&account),
        Listing::Black => record.blacklisted.contains(&account),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asset::{records::AssetOptions, AssetDynamicData},
        types::{Amount, Price},
    };

    fn plain_asset(
        issuer: AccountId,
        whitelist: BTreeSet<AccountId>,
        blacklist: BTreeSet<AccountId>,
    ) -> AssetRecord {
        AssetRecord {
            symbol: "GATE".to_string(),
            precision: 5,
            issuer,
            options: AssetOptions {
                max_supply: Amount(1_000_000),
                market_fee_percent: 0,
                issuer_permissions: 0,
                flags: 0,
                core_exchange_rate: Price::identity(AssetId(0)),
                whitelist_authorities: whitelist,
                blacklist_authorities: blacklist,
            },
            dynamic: AssetDynamicData::default(),
            bitasset: None,
        }
    }

    #[test]
    fn no_authorities_means_open_to_all() {
        let mut reg = Registry::new();
        let issuer = reg.create_account("issuer");
        let anyone = reg.create_account("anyone");
        let asset = plain_asset(issuer, BTreeSet::new(), BTreeSet::new());
        assert!(is_authorized_asset(&reg, anyone, &asset));
    }

    #[test]
    fn whitelist_requires_a_positive_listing() {
        let mut reg = Registry::new();
        let issuer = reg.create_account("issuer");
        let authority = reg.create_account("authority");
        let member = reg.create_account("member");
        let outsider = reg.create_account("outsider");

        reg.modify_account(authority, |a| {
            a.whitelisted.insert(member);
        })
        .unwrap();

        let asset = plain_asset(issuer, BTreeSet::from([authority]), BTreeSet::new());
        assert!(is_authorized_asset(&reg, member, &asset));
        assert!(!is_authorized_asset(&reg, outsider, &asset));
    }

    #[test]
    fn blacklist_overrides_whitelist() {
        let mut reg = Registry::new();
        let issuer = reg.create_account("issuer");
        let authority = reg.create_account("authority");
        let censor = reg.create_account("censor");
        let member = reg.create_account("member");

        reg.modify_account(authority, |a| {
            a.whitelisted.insert(member);
        })
        .unwrap();
        reg.modify_account(censor, |a| {
            a.blacklisted.insert(member);
        })
        .unwrap();

        let asset = plain_asset(
            issuer,
            BTreeSet::from([authority]),
            BTreeSet::from([censor]),
        );
        assert!(!is_authorized_asset(&reg, member, &asset));
    }

    #[test]
    fn blacklist_alone_permits_everyone_else() {
        let mut reg = Registry::new();
        let issuer = reg.create_account("issuer");
        let censor = reg.create_account("censor");
        let banned = reg.create_account("banned");
        let anyone = reg.create_account("anyone");

        reg.modify_account(censor, |a| {
            a.blacklisted.insert(banned);
        })
        .unwrap();

        let asset = plain_asset(issuer, BTreeSet::new(), BTreeSet::from([censor]));
        assert!(!is_authorized_asset(&reg, banned, &asset));
        assert!(is_authorized_asset(&reg, anyone, &asset));
    }
}
