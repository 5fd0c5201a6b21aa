//! Capital vault: depositor shares, idle assets and the withdrawal queue.
//!
//! The vault owns the withdrawal-request list exclusively. Requests are
//! fulfilled out of a monotonically increasing processed-assets counter;
//! a request becomes claimable as soon as processed liquidity is
//! attributable to its watermark region, and a claim never pays more than
//! what has actually been processed. Under a liquidity crunch this
//! degrades to partial, delayed payout instead of failing.

use crate::utils::decimal::{safe_div, saturating_sub};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Vault operation failures.
#[derive(Debug, Error, PartialEq)]
pub enum VaultError {
    #[error("withdraw of {requested} exceeds total assets {available}")]
    InsufficientAssets {
        requested: Decimal,
        available: Decimal,
    },
    #[error("zero amount")]
    ZeroAmount,
    #[error("unknown withdraw request {0}")]
    UnknownRequest(u64),
    #[error("withdraw request {0} already fully claimed")]
    AlreadyClaimed(u64),
    #[error("withdraw request {0} has nothing claimable yet")]
    NothingClaimable(u64),
}

/// A queued withdrawal.
///
/// `watermark` is the cumulative requested total up to and including this
/// request; the liquidity attributable to it is whatever slice of the
/// processed counter falls inside `(watermark - requested, watermark]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: u64,
    pub requested: Decimal,
    pub watermark: Decimal,
    pub claimed: Decimal,
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

/// Tokenized-vault capital ledger.
#[derive(Debug)]
pub struct CapitalVault {
    idle: Decimal,
    shares: Decimal,
    requests: Vec<WithdrawRequest>,
    total_requested: Decimal,
    total_processed: Decimal,
    total_claimed: Decimal,
    next_request_id: u64,
}

impl CapitalVault {
    pub fn new() -> Self {
        Self {
            idle: Decimal::ZERO,
            shares: Decimal::ZERO,
            requests: Vec::new(),
            total_requested: Decimal::ZERO,
            total_processed: Decimal::ZERO,
            total_claimed: Decimal::ZERO,
            next_request_id: 1,
        }
    }

    /// Assets sitting in the vault and not yet earmarked for claims.
    pub fn idle_assets(&self) -> Decimal {
        self.idle
    }

    /// Total ownership shares outstanding.
    pub fn total_supply(&self) -> Decimal {
        self.shares
    }

    /// Withdrawal demand not yet backed by processed liquidity.
    pub fn total_pending_withdraw(&self) -> Decimal {
        saturating_sub(self.total_requested, self.total_processed)
    }

    /// Cumulative assets moved from idle into the claimable pool.
    pub fn total_processed(&self) -> Decimal {
        self.total_processed
    }

    /// Cumulative assets paid out to claimants.
    pub fn total_claimed(&self) -> Decimal {
        self.total_claimed
    }

    pub fn requests(&self) -> &[WithdrawRequest] {
        &self.requests
    }

    /// Deposit assets, minting shares at the current share price.
    ///
    /// `total_assets` is the vault NAV before this deposit (idle + spot
    /// exposure value + hedge net balance), supplied by the caller since
    /// the vault does not see the other components.
    pub fn deposit(&mut self, assets: Decimal, total_assets: Decimal) -> Result<Decimal, VaultError> {
        if assets <= Decimal::ZERO {
            return Err(VaultError::ZeroAmount);
        }

        let minted = if self.shares == Decimal::ZERO {
            assets
        } else {
            assets * safe_div(self.shares, total_assets)
        };

        self.idle += assets;
        self.shares += minted;

        info!(%assets, %minted, total_shares = %self.shares, "Deposit accepted");
        Ok(minted)
    }

    /// Queue a withdrawal of `assets`, burning the proportional shares.
    ///
    /// The request is always queued; callers service the queue with
    /// whatever idle liquidity is available, so a request fully covered by
    /// idle assets becomes claimable immediately.
    pub fn request_withdraw(
        &mut self,
        assets: Decimal,
        total_assets: Decimal,
    ) -> Result<u64, VaultError> {
        if assets <= Decimal::ZERO {
            return Err(VaultError::ZeroAmount);
        }
        if assets > total_assets {
            return Err(VaultError::InsufficientAssets {
                requested: assets,
                available: total_assets,
            });
        }

        let burned = (assets * safe_div(self.shares, total_assets)).min(self.shares);
        self.shares -= burned;
        self.total_requested += assets;

        let id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.push(WithdrawRequest {
            id,
            requested: assets,
            watermark: self.total_requested,
            claimed: Decimal::ZERO,
            done: false,
            created_at: Utc::now(),
        });

        info!(
            request_id = id,
            %assets,
            %burned,
            pending = %self.total_pending_withdraw(),
            "Withdraw request queued"
        );
        Ok(id)
    }

    /// Move up to `available` idle assets into the claimable pool.
    ///
    /// Returns the amount actually processed. Cumulative processed assets
    /// never exceed cumulative requested assets.
    pub fn process_pending_withdraws(&mut self, available: Decimal) -> Decimal {
        let outstanding = self.total_pending_withdraw();
        let take = available.min(outstanding).min(self.idle).max(Decimal::ZERO);
        if take == Decimal::ZERO {
            return Decimal::ZERO;
        }

        self.idle -= take;
        self.total_processed += take;

        debug!(
            processed = %take,
            total_processed = %self.total_processed,
            remaining_demand = %self.total_pending_withdraw(),
            "Withdrawal queue advanced"
        );
        take
    }

    /// Liquidity currently attributable to a request but not yet claimed.
    fn claimable_for(&self, request: &WithdrawRequest) -> Decimal {
        let prior_watermark = request.watermark - request.requested;
        let attributable = saturating_sub(self.total_processed, prior_watermark)
            .min(request.requested);
        saturating_sub(attributable, request.claimed)
    }

    /// Claim whatever is payable on a request.
    ///
    /// Pays `min(requested, processed - prior watermark)` less what was
    /// already claimed; repeated claims after further processing are
    /// allowed until the request is fully paid.
    pub fn claim(&mut self, id: u64) -> Result<Decimal, VaultError> {
        let idx = self
            .requests
            .iter()
            .position(|r| r.id == id)
            .ok_or(VaultError::UnknownRequest(id))?;

        if self.requests[idx].done {
            return Err(VaultError::AlreadyClaimed(id));
        }

        let payable = self.claimable_for(&self.requests[idx]);
        if payable == Decimal::ZERO {
            return Err(VaultError::NothingClaimable(id));
        }

        let request = &mut self.requests[idx];
        request.claimed += payable;
        if request.claimed >= request.requested {
            request.done = true;
        }
        self.total_claimed += payable;

        info!(
            request_id = id,
            paid = %payable,
            done = request.done,
            "Withdraw claimed"
        );
        Ok(payable)
    }

    /// Credit assets into the idle balance (spot proceeds, released hedge
    /// collateral, claimed funding).
    pub fn credit_idle(&mut self, assets: Decimal) {
        self.idle += assets;
    }

    /// Debit assets from the idle balance for deployment. Clamps at zero;
    /// the caller is expected to have sized the debit from `idle_assets`.
    pub fn debit_idle(&mut self, assets: Decimal) -> Decimal {
        let take = assets.min(self.idle);
        self.idle -= take;
        take
    }

    /// Restore accounting state from a persisted snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        idle: Decimal,
        shares: Decimal,
        requests: Vec<WithdrawRequest>,
        total_requested: Decimal,
        total_processed: Decimal,
        total_claimed: Decimal,
    ) -> Self {
        let next_request_id = requests.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        Self {
            idle,
            shares,
            requests,
            total_requested,
            total_processed,
            total_claimed,
            next_request_id,
        }
    }
}

impl Default for CapitalVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn vault_with_deposit(assets: Decimal) -> CapitalVault {
        let mut vault = CapitalVault::new();
        vault.deposit(assets, Decimal::ZERO).unwrap();
        vault
    }

    #[test]
    fn test_first_deposit_mints_one_to_one() {
        let mut vault = CapitalVault::new();
        let minted = vault.deposit(dec!(10000), Decimal::ZERO).unwrap();
        assert_eq!(minted, dec!(10000));
        assert_eq!(vault.idle_assets(), dec!(10000));
        assert_eq!(vault.total_supply(), dec!(10000));
    }

    #[test]
    fn test_second_deposit_mints_at_nav() {
        let mut vault = vault_with_deposit(dec!(10000));
        // NAV doubled to 20k with supply still 10k: share price 2.0
        let minted = vault.deposit(dec!(5000), dec!(20000)).unwrap();
        assert_eq!(minted, dec!(2500));
    }

    #[test]
    fn test_zero_deposit_rejected() {
        let mut vault = CapitalVault::new();
        assert_eq!(
            vault.deposit(Decimal::ZERO, Decimal::ZERO),
            Err(VaultError::ZeroAmount)
        );
    }

    #[test]
    fn test_withdraw_request_burns_shares_and_tracks_watermark() {
        let mut vault = vault_with_deposit(dec!(10000));
        let id = vault.request_withdraw(dec!(4000), dec!(10000)).unwrap();

        assert_eq!(vault.total_supply(), dec!(6000));
        assert_eq!(vault.total_pending_withdraw(), dec!(4000));
        let request = &vault.requests()[0];
        assert_eq!(request.id, id);
        assert_eq!(request.watermark, dec!(4000));
    }

    #[test]
    fn test_withdraw_beyond_nav_rejected() {
        let mut vault = vault_with_deposit(dec!(1000));
        assert!(matches!(
            vault.request_withdraw(dec!(2000), dec!(1000)),
            Err(VaultError::InsufficientAssets { .. })
        ));
    }

    #[test]
    fn test_processing_is_capped_by_demand_and_idle() {
        let mut vault = vault_with_deposit(dec!(10000));
        vault.request_withdraw(dec!(3000), dec!(10000)).unwrap();

        // More liquidity offered than demanded: only demand is processed
        assert_eq!(vault.process_pending_withdraws(dec!(5000)), dec!(3000));
        assert_eq!(vault.total_pending_withdraw(), Decimal::ZERO);
        assert_eq!(vault.idle_assets(), dec!(7000));

        // Nothing left to process
        assert_eq!(vault.process_pending_withdraws(dec!(1000)), Decimal::ZERO);
    }

    #[test]
    fn test_claim_caps_at_processed_liquidity() {
        let mut vault = vault_with_deposit(dec!(10000));
        // Drain idle so the queue starves: simulate deployed capital
        vault.debit_idle(dec!(9000));
        let id = vault.request_withdraw(dec!(5000), dec!(10000)).unwrap();

        // Only 1000 idle available to service 5000 of demand
        assert_eq!(vault.process_pending_withdraws(dec!(1000)), dec!(1000));

        // Partial-liquidity claim pays less than the nominal request
        assert_eq!(vault.claim(id).unwrap(), dec!(1000));

        // A second claim with no new liquidity has nothing to pay
        assert_eq!(vault.claim(id), Err(VaultError::NothingClaimable(id)));

        // Deutilization returns capital; the remainder becomes claimable
        vault.credit_idle(dec!(4000));
        vault.process_pending_withdraws(dec!(4000));
        assert_eq!(vault.claim(id).unwrap(), dec!(4000));
        assert_eq!(vault.claim(id), Err(VaultError::AlreadyClaimed(id)));
    }

    #[test]
    fn test_claims_ordered_by_watermark() {
        let mut vault = vault_with_deposit(dec!(10000));
        vault.debit_idle(dec!(10000));
        let first = vault.request_withdraw(dec!(2000), dec!(10000)).unwrap();
        let second = vault.request_withdraw(dec!(3000), dec!(8000)).unwrap();

        // Liquidity covers the first request and half the second
        vault.credit_idle(dec!(3500));
        vault.process_pending_withdraws(dec!(3500));

        assert_eq!(vault.claim(first).unwrap(), dec!(2000));
        assert_eq!(vault.claim(second).unwrap(), dec!(1500));

        // Sum of claims never exceeds total processed
        assert_eq!(vault.total_claimed(), dec!(3500));
        assert_eq!(vault.total_claimed(), vault.total_processed());
    }

    #[test]
    fn test_unknown_request_rejected() {
        let mut vault = vault_with_deposit(dec!(1000));
        assert_eq!(vault.claim(42), Err(VaultError::UnknownRequest(42)));
    }

    #[test]
    fn test_processed_never_exceeds_requested() {
        let mut vault = vault_with_deposit(dec!(10000));
        vault.request_withdraw(dec!(1000), dec!(10000)).unwrap();

        vault.process_pending_withdraws(dec!(10000));
        vault.process_pending_withdraws(dec!(10000));
        assert_eq!(vault.total_processed(), dec!(1000));
    }
}
