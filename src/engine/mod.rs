//! Engine wiring: owns the vault, oracle, spot and hedge managers and the
//! strategy controller, routes commands out and execution reports back.
//!
//! The engine is the only component that touches more than one leaf: it
//! assembles the [`PositionView`] snapshot before every controller call,
//! executes the commands the controller returns, and moves assets between
//! the vault and the venues as fills and callbacks arrive. Venue
//! execution stays asynchronous: `step()` drains whatever reports have
//! accumulated and dispatches them in arrival order.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hedge::{
    AdjustmentTotals, HedgeCallback, HedgePosition, HedgePositionManager, HedgeVenue,
};
use crate::oracle::PriceOracle;
use crate::spot::{SpotExposureManager, SpotVenue, SwapSide};
use crate::strategy::{
    HedgeCommand, PositionView, SpotCommand, StrategyController, StrategyStatus, UpkeepAction,
};
use crate::utils::decimal::saturating_sub;
use crate::vault::{CapitalVault, WithdrawRequest};

/// Serializable state snapshot, used by persistence and the status CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub timestamp: DateTime<Utc>,
    pub status: StrategyStatus,
    pub paused: bool,
    pub stopped: bool,
    pub processing_rebalance_down: bool,
    pub idle_assets: Decimal,
    pub total_shares: Decimal,
    pub total_requested: Decimal,
    pub total_processed: Decimal,
    pub total_claimed: Decimal,
    pub spot_exposure: Decimal,
    pub hedge_size: Decimal,
    pub hedge_collateral: Decimal,
    pub total_funding_accrued: Decimal,
    pub total_borrowing_paid: Decimal,
    pub pending_funding: Decimal,
    pub funding_watermark: Decimal,
    pub borrowing_watermark: Decimal,
    pub withdraw_requests: Vec<WithdrawRequest>,
}

/// Coordinator for one strategy instance.
pub struct BasisEngine {
    config: Config,
    oracle: Arc<dyn PriceOracle>,
    vault: CapitalVault,
    spot: SpotExposureManager,
    hedge: HedgePositionManager,
    controller: StrategyController,
}

impl BasisEngine {
    pub fn new(
        config: Config,
        oracle: Arc<dyn PriceOracle>,
        spot_venue: Arc<dyn SpotVenue>,
        hedge_venue: Arc<dyn HedgeVenue>,
    ) -> Result<Self> {
        config.validate()?;
        let spot = SpotExposureManager::new(spot_venue);
        let hedge = HedgePositionManager::new(
            hedge_venue,
            oracle.clone(),
            config.market.product.clone(),
            config.venue_limits.clone(),
        );
        let controller =
            StrategyController::new(config.leverage.clone(), config.thresholds.clone());
        Ok(Self {
            config,
            oracle,
            vault: CapitalVault::new(),
            spot,
            hedge,
            controller,
        })
    }

    pub fn vault(&self) -> &CapitalVault {
        &self.vault
    }

    pub fn controller(&self) -> &StrategyController {
        &self.controller
    }

    pub fn hedge(&self) -> &HedgePositionManager {
        &self.hedge
    }

    pub fn spot_exposure(&self) -> Decimal {
        self.spot.exposure()
    }

    /// Vault NAV: idle assets plus both deployed legs.
    pub fn total_assets(&self) -> Result<Decimal> {
        let spot_value = self.oracle.convert(
            &self.config.market.product,
            &self.config.market.asset,
            self.spot.exposure(),
        )?;
        Ok(self.vault.idle_assets()
            + spot_value
            + self.hedge.position_net_balance()
            + self.hedge.idle_collateral())
    }

    fn build_view(&self) -> Result<PositionView> {
        let price = self.oracle.price(&self.config.market.product)?;
        Ok(PositionView {
            idle_assets: self.vault.idle_assets(),
            total_shares: self.vault.total_supply(),
            pending_withdraw: self.vault.total_pending_withdraw(),
            spot_exposure: self.spot.exposure(),
            hedge_size: self.hedge.position_size_in_tokens(),
            hedge_net_balance: self.hedge.position_net_balance(),
            leverage: self.hedge.current_leverage()?,
            need_keep: self.hedge.need_keep(self.config.thresholds.min_keep_amount),
            product_price: price,
            min_size_delta: self.hedge.limits().min_size_delta,
            min_collateral_delta: self.hedge.limits().min_collateral_delta,
            hedge_busy: self.hedge.adjustment_in_flight() || self.spot.swap_pending(),
        })
    }

    /// Deposit assets into the vault, minting shares at NAV. Inflows
    /// service the withdrawal queue before anything else.
    pub fn deposit(&mut self, assets: Decimal) -> Result<Decimal> {
        let total = self.total_assets()?;
        let minted = self.vault.deposit(assets, total)?;
        self.service_withdrawals();
        Ok(minted)
    }

    /// Queue a withdrawal; idle liquidity is applied to it immediately.
    pub fn request_withdraw(&mut self, assets: Decimal) -> Result<u64> {
        let total = self.total_assets()?;
        let id = self.vault.request_withdraw(assets, total)?;
        self.service_withdrawals();
        Ok(id)
    }

    /// Claim whatever is payable on a withdrawal request.
    pub fn claim(&mut self, id: u64) -> Result<Decimal> {
        Ok(self.vault.claim(id)?)
    }

    /// Both pending amounts, mutually exclusive by construction.
    pub fn pending_utilizations(&self) -> Result<(Decimal, Decimal)> {
        let view = self.build_view()?;
        Ok(self.controller.pending_utilizations(&view))
    }

    /// Move `amount` idle assets into the spot+hedge pair.
    ///
    /// The assets are debited up front so the withdrawal queue cannot be
    /// serviced from capital an in-flight buy is about to spend; any
    /// unfilled remainder is refunded when the fill arrives.
    pub async fn utilize(&mut self, amount: Decimal) -> Result<()> {
        let view = self.build_view()?;
        let command = self.controller.utilize(amount, &view)?;
        if let SpotCommand::Buy { assets } = command {
            self.vault.debit_idle(assets);
            if let Err(e) = self.spot.buy(assets).await {
                self.vault.credit_idle(assets);
                self.controller.abort_entry();
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Sell `amount` product units out of the pair.
    pub async fn deutilize(&mut self, amount: Decimal) -> Result<()> {
        let view = self.build_view()?;
        let command = self.controller.deutilize(amount, &view)?;
        if let SpotCommand::Sell { size } = command {
            if let Err(e) = self.spot.sell(size).await {
                self.controller.abort_entry();
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn pause(&mut self) {
        self.controller.pause();
    }

    pub fn unpause(&mut self) {
        self.controller.unpause();
    }

    pub fn stop(&mut self) {
        self.controller.stop();
    }

    /// Evaluate the control loop without acting.
    pub fn check_upkeep(&self) -> Result<UpkeepAction> {
        let view = self.build_view()?;
        Ok(self.controller.check_upkeep(&view))
    }

    /// Evaluate and execute one corrective step. Returns the action
    /// taken; calling again with no state change is a no-op for `None`.
    pub async fn perform_upkeep(&mut self) -> Result<UpkeepAction> {
        let view = self.build_view()?;
        let action = self.controller.check_upkeep(&view);
        match action {
            UpkeepAction::None => {}

            UpkeepAction::EmergencyDeleverage { size } => {
                warn!(%size, leverage = %view.leverage, "Emergency deleverage");
                self.controller.begin_rebalance_down();
                let command = self.controller.deutilize(size, &view)?;
                if let SpotCommand::Sell { size } = command {
                    if let Err(e) = self.spot.sell(size).await {
                        self.controller.abort_entry();
                        return Err(e.into());
                    }
                }
            }

            UpkeepAction::AddCollateral { amount } => {
                info!(%amount, leverage = %view.leverage, "Rebalance down: adding collateral");
                self.controller.begin_rebalance_down();
                self.controller.register_request(AdjustmentTotals {
                    size_delta: Decimal::ZERO,
                    collateral_delta: amount,
                    is_increase: true,
                });
                match self.hedge.adjust_position(Decimal::ZERO, amount, true).await {
                    Ok(external) => {
                        self.vault.debit_idle(external);
                    }
                    Err(e) => {
                        warn!(error = %e, "Collateral add rejected");
                        self.controller.abort_entry();
                    }
                }
            }

            UpkeepAction::ClearRebalanceDown => {
                self.controller.clear_rebalance_down();
            }

            UpkeepAction::Rehedge {
                size_delta,
                is_increase,
            } => {
                info!(%size_delta, is_increase, "Re-hedging drift");
                self.controller.register_request(AdjustmentTotals {
                    size_delta,
                    collateral_delta: Decimal::ZERO,
                    is_increase,
                });
                if let Err(e) = self
                    .hedge
                    .adjust_position(size_delta, Decimal::ZERO, is_increase)
                    .await
                {
                    warn!(error = %e, "Re-hedge rejected");
                    self.controller.abort_entry();
                    if is_increase {
                        // The hedge could not grow to meet spot: shrink
                        // spot to meet the hedge instead
                        self.controller.register_compensation(size_delta);
                        if let Err(e) = self.spot.sell(size_delta).await {
                            warn!(error = %e, "Compensating spot sell rejected");
                        }
                    }
                }
            }

            UpkeepAction::Keep => {
                debug!("Keeping: claiming accrued funding");
                self.controller.begin_keep()?;
                if let Err(e) = self.hedge.keep().await {
                    warn!(error = %e, "Keep rejected");
                    self.controller.abort_entry();
                }
            }

            UpkeepAction::RemoveCollateral { amount } => {
                info!(%amount, leverage = %view.leverage, "Rebalance up: withdrawing collateral");
                self.controller.register_request(AdjustmentTotals {
                    size_delta: Decimal::ZERO,
                    collateral_delta: amount,
                    is_increase: false,
                });
                if let Err(e) = self
                    .hedge
                    .adjust_position(Decimal::ZERO, amount, false)
                    .await
                {
                    warn!(error = %e, "Collateral withdrawal rejected");
                    self.controller.abort_entry();
                }
            }
        }
        Ok(action)
    }

    /// Drain venue reports and dispatch callbacks in arrival order.
    pub async fn step(&mut self) -> Result<()> {
        // Spot leg completions first: within a cycle the spot leg always
        // completes before the paired hedge leg is issued
        let fills = self.spot.poll_completed().await;
        for fill in fills {
            match fill.side {
                SwapSide::Buy => {
                    // Debited in full at submission; refund what the
                    // fill did not spend
                    let unspent = saturating_sub(fill.requested, fill.asset_delta);
                    if unspent > Decimal::ZERO {
                        self.vault.credit_idle(unspent);
                    }
                    let view = self.build_view()?;
                    match self.controller.on_spot_buy_completed(
                        fill.asset_delta,
                        fill.product_delta,
                        &view,
                    ) {
                        Ok(Some(command)) => {
                            self.pair_hedge_increase(command, fill.product_delta).await;
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Dropping unexpected buy callback"),
                    }
                }
                SwapSide::Sell => {
                    self.vault.credit_idle(fill.asset_delta);
                    let view = self.build_view()?;
                    match self.controller.on_spot_sell_completed(
                        fill.asset_delta,
                        fill.product_delta,
                        &view,
                    ) {
                        Ok(Some(command)) => {
                            if let Err(e) = self.submit_hedge(command).await {
                                // The spot leg is already sold; nothing to
                                // compensate with, so require intervention
                                warn!(error = %e, "Hedge decrease rejected, pausing");
                                self.controller.abort_entry();
                                self.controller.pause();
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Dropping unexpected sell callback"),
                    }
                }
            }
        }

        // Re-arm any interrupted re-open leg; retries ride on the loop
        self.hedge.resume_interrupted().await;

        // Hedge leg completions
        let callbacks = self.hedge.poll_completed().await;
        for callback in callbacks {
            match callback {
                HedgeCallback::Adjusted {
                    requested,
                    executed,
                    cancelled,
                } => {
                    // Collateral released by a decrease returns to idle
                    if !executed.is_increase && executed.collateral_delta > Decimal::ZERO {
                        self.vault.credit_idle(executed.collateral_delta);
                    }
                    // A full close leaves nothing for idle venue
                    // collateral to offset; return it to the vault
                    if self.hedge.position_size_in_tokens() == Decimal::ZERO {
                        let leftover = self.hedge.take_idle_collateral();
                        if leftover > Decimal::ZERO {
                            self.vault.credit_idle(leftover);
                        }
                    }
                    let view = self.build_view()?;
                    match self.controller.after_adjust_position(
                        &requested,
                        &executed,
                        cancelled,
                        &view,
                    ) {
                        Ok(outcome) => {
                            if let Some(SpotCommand::Sell { size }) = outcome.compensation {
                                if let Err(e) = self.spot.sell(size).await {
                                    warn!(error = %e, "Compensating sell-back rejected");
                                }
                            }
                            if outcome.service_withdrawals {
                                self.service_withdrawals();
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping unauthenticated hedge callback"),
                    }
                }
                HedgeCallback::Kept { claimed, cancelled } => {
                    if claimed > Decimal::ZERO {
                        self.vault.credit_idle(claimed);
                        info!(%claimed, "Funding returned to vault");
                    }
                    self.controller.after_keep(cancelled);
                }
            }
        }

        // Any inflow beyond demand also advances the queue
        self.service_withdrawals();
        Ok(())
    }

    /// Issue the hedge increase paired to a spot buy. A synchronous
    /// rejection sells the fresh spot back and pauses.
    async fn pair_hedge_increase(&mut self, command: HedgeCommand, bought: Decimal) {
        if let Err(e) = self.submit_hedge(command).await {
            warn!(error = %e, "Hedge increase rejected, selling spot back");
            self.controller.abort_entry();
            self.controller.pause();
            self.controller.register_compensation(bought);
            if let Err(e) = self.spot.sell(bought).await {
                warn!(error = %e, "Compensating sell-back rejected");
            }
        }
    }

    async fn submit_hedge(&mut self, command: HedgeCommand) -> Result<()> {
        let external = self
            .hedge
            .adjust_position(
                command.size_delta,
                command.collateral_delta,
                command.is_increase,
            )
            .await?;
        if external > Decimal::ZERO {
            self.vault.debit_idle(external);
        }
        Ok(())
    }

    fn service_withdrawals(&mut self) {
        let available = self.vault.idle_assets();
        if available > Decimal::ZERO && self.vault.total_pending_withdraw() > Decimal::ZERO {
            self.vault.process_pending_withdraws(available);
        }
    }

    /// Capture the current state for persistence or display.
    pub fn snapshot(&self) -> EngineSnapshot {
        let position = self.hedge.position();
        EngineSnapshot {
            timestamp: Utc::now(),
            status: self.controller.status(),
            paused: self.controller.is_paused(),
            stopped: self.controller.is_stopped(),
            processing_rebalance_down: self.controller.processing_rebalance_down(),
            idle_assets: self.vault.idle_assets(),
            total_shares: self.vault.total_supply(),
            total_requested: self.vault.total_pending_withdraw() + self.vault.total_processed(),
            total_processed: self.vault.total_processed(),
            total_claimed: self.vault.total_claimed(),
            spot_exposure: self.spot.exposure(),
            hedge_size: position.size_in_tokens,
            hedge_collateral: position.collateral,
            total_funding_accrued: position.total_funding_accrued,
            total_borrowing_paid: position.total_borrowing_paid,
            pending_funding: self.hedge.pending_funding(),
            funding_watermark: self.hedge.funding_watermark(),
            borrowing_watermark: self.hedge.borrowing_watermark(),
            withdraw_requests: self.vault.requests().to_vec(),
        }
    }

    /// Restore accounting state from a snapshot. In-flight statuses are
    /// not restored; a restarted engine reconciles via the upkeep loop.
    pub fn restore(&mut self, snapshot: EngineSnapshot) {
        self.vault = CapitalVault::restore(
            snapshot.idle_assets,
            snapshot.total_shares,
            snapshot.withdraw_requests,
            snapshot.total_requested,
            snapshot.total_processed,
            snapshot.total_claimed,
        );
        self.spot.restore_exposure(snapshot.spot_exposure);
        self.hedge.restore(
            HedgePosition {
                size_in_tokens: snapshot.hedge_size,
                collateral: snapshot.hedge_collateral,
                total_funding_accrued: snapshot.total_funding_accrued,
                total_borrowing_paid: snapshot.total_borrowing_paid,
            },
            snapshot.funding_watermark,
            snapshot.borrowing_watermark,
            snapshot.pending_funding,
        );
        self.controller.restore(
            snapshot.processing_rebalance_down,
            snapshot.paused,
            snapshot.stopped,
        );
        info!("Engine state restored from snapshot");
    }
}
