use serde::{Deserialize, Serialize};

use crate::{
    error::TidepoolResult,
    types::{AccountId, Amount, AssetAmount, AssetId, Price, COLLATERAL_RATIO_DENOM},
};

/// One collateralized-debt position: at most one per `(borrower, debt asset)`.
///
/// The position is live while `debt > 0` and `collateral > 0`. It leaves the
/// ledger when fully covered, consumed by margin calls, or seized by a global
/// settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOrder {
    pub borrower: AccountId,
    /// Backing-asset collateral held by the position.
    pub collateral: AssetAmount,
    /// Outstanding debt; this much supply of the debt asset exists because of
    /// this position.
    pub debt: AssetAmount,
    /// Per-mille ratio the position should be left at after a margin call,
    /// instead of being liquidated in full. `None` or `0` disables the cap.
    pub target_collateral_ratio: Option<u16>,
}

impl CallOrder {
    pub fn debt_asset(&self) -> AssetId {
        self.debt.asset_id
    }

    pub fn collateral_asset(&self) -> AssetId {
        self.collateral.asset_id
    }

    /// Collateral-per-debt ratio as a price, directly comparable to the
    /// feed-derived trigger prices.
    pub fn collateralization(&self) -> Price {
        Price::new(self.collateral, self.debt)
    }

    /// Whether the position sits in margin-call territory under `threshold`
    /// (the current maintenance collateralization). The boundary itself is
    /// callable: safety requires strictly more collateral than the threshold.
    pub fn is_called(&self, threshold: Price) -> TidepoolResult<bool> {
        Ok(self
            .collateralization()
            .cmp_ratio(&threshold)?
            .is_le())
    }

    /// How much debt a margin call should cover at `fill_price`
    /// (collateral-per-debt).
    ///
    /// Without a target ratio the whole debt is put up for liquidation. With
    /// one, covering stops once the position would sit at or above
    /// `max(target, mcr)`; the division rounds up and a one-unit slack absorbs
    /// the round-up on the collateral payout, so the landing ratio never
    /// undershoots. Positions the cap cannot save are liquidated in full.
    pub fn max_debt_to_cover(
        &self,
        fill_price: Price,
        settlement_price: Price,
        mcr: u16,
    ) -> TidepoolResult<Amount> {
        let tcr = match self.target_collateral_ratio {
            Some(t) if t > 0 => t.max(mcr),
            _ => return Ok(self.debt.amount),
        };

        let target = settlement_price
            .invert()
            .mul_ratio(tcr, COLLATERAL_RATIO_DENOM)?;

        // Covering d debt pays d * fill_price collateral. Solve
        //   (C - d*pc/pd) / (D - d) >= tc/td
        // for the smallest d. A fill at or above the target ratio cannot
        // restore the position no matter how much is covered.
        let (pc, pd) = (fill_price.base.amount.0 as i128, fill_price.quote.amount.0 as i128);
        let (tc, td) = (target.base.amount.0 as i128, target.quote.amount.0 as i128);
        let c = self.collateral.amount.0 as i128;
        let d = self.debt.amount.0 as i128;

        let denom = tc * pd - pc * td;
        if denom <= 0 {
            return Ok(self.debt.amount);
        }
        let numer = d * tc * pd - c * pd * td;
        if numer <= 0 {
            // Already at or above target; nothing needs covering.
            return Ok(Amount::ZERO);
        }
        let cover = (numer + denom - 1) / denom + 1;
        Ok(Amount(cover.min(d) as i64))
    }
}
