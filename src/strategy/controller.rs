//! Strategy controller: the capital-movement state machine.
//!
//! The controller decides how much capital moves between the vault, the
//! spot leg and the hedge position. It is a synchronous state machine:
//! every decision is a pure function of its own state plus a
//! [`PositionView`] snapshot of the collaborators, and every side effect
//! is returned as a command for the engine to execute. The status field
//! is the concurrency gate: no two capital-moving operations are ever in
//! flight at once.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LeverageConfig, ThresholdConfig};
use crate::hedge::AdjustmentTotals;
use crate::utils::decimal::{exceeds_deviation, proportional, safe_div, saturating_sub};

/// Strategy operation failures.
#[derive(Debug, Error, PartialEq)]
pub enum ControllerError {
    #[error("strategy is busy ({0:?})")]
    NotIdle(StrategyStatus),
    #[error("strategy is paused")]
    Paused,
    #[error("strategy is stopped")]
    Stopped,
    #[error("zero amount")]
    ZeroAmount,
    #[error("amount {requested} exceeds pending utilization {available}")]
    ExceedsPendingUtilization {
        requested: Decimal,
        available: Decimal,
    },
    #[error("nothing to deutilize")]
    NothingToDeutilize,
    #[error("unexpected callback in status {0:?}")]
    UnexpectedCallback(StrategyStatus),
}

/// Lifecycle of the strategy instance. Exactly one non-Idle status is
/// active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Idle,
    /// Spot buy in flight, hedge increase to follow
    Utilizing,
    /// Spot sell in flight
    Deutilizing,
    /// Paired hedge decrease in flight
    AwaitingFinalDeutilization,
    /// Funding keep in flight
    Keeping,
}

/// Why a deutilization was started; selects the collateral formula for
/// the paired hedge decrease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeutilizeKind {
    /// Freeing capital for queued withdrawals
    Withdrawal,
    /// Unwinding size to bring leverage down
    RebalanceDown,
}

/// Read-only snapshot of collaborator state, assembled by the engine
/// before each controller call.
#[derive(Debug, Clone)]
pub struct PositionView {
    /// Vault assets not earmarked for claims
    pub idle_assets: Decimal,
    /// Vault shares outstanding
    pub total_shares: Decimal,
    /// Withdrawal demand not yet backed by processed liquidity
    pub pending_withdraw: Decimal,
    /// Spot leg product units
    pub spot_exposure: Decimal,
    /// Hedge position product units
    pub hedge_size: Decimal,
    /// Hedge net collateral value
    pub hedge_net_balance: Decimal,
    /// Hedge notional / net collateral
    pub leverage: Decimal,
    /// Hedge manager has claimable funding
    pub need_keep: bool,
    /// Product price in asset units
    pub product_price: Decimal,
    /// Venue minimum actionable size delta
    pub min_size_delta: Decimal,
    /// Venue minimum actionable collateral delta
    pub min_collateral_delta: Decimal,
    /// A hedge adjustment or spot swap is still in flight
    pub hedge_busy: bool,
}

/// Spot-leg command for the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpotCommand {
    Buy { assets: Decimal },
    Sell { size: Decimal },
}

/// Hedge-leg command for the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HedgeCommand {
    pub size_delta: Decimal,
    pub collateral_delta: Decimal,
    pub is_increase: bool,
}

/// Result of reconciling a hedge-adjustment callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Execution deviated beyond the response threshold
    pub flagged: bool,
    /// The deviation paused the strategy
    pub paused: bool,
    /// Sell-back of spot left unmatched by a deviated increase
    pub compensation: Option<SpotCommand>,
    /// A deutilization completed; the withdrawal queue should be serviced
    pub service_withdrawals: bool,
}

pub struct StrategyController {
    leverage: LeverageConfig,
    thresholds: ThresholdConfig,
    status: StrategyStatus,
    processing_rebalance_down: bool,
    paused: bool,
    stopped: bool,
    /// Outstanding hedge-adjustment request awaiting reconciliation
    request: Option<AdjustmentTotals>,
    deutilize_kind: Option<DeutilizeKind>,
    /// The in-flight deutilization covers all remaining demand
    final_step: bool,
    /// Product units of an in-flight compensating sell-back
    pending_compensation: Option<Decimal>,
}

impl StrategyController {
    pub fn new(leverage: LeverageConfig, thresholds: ThresholdConfig) -> Self {
        Self {
            leverage,
            thresholds,
            status: StrategyStatus::Idle,
            processing_rebalance_down: false,
            paused: false,
            stopped: false,
            request: None,
            deutilize_kind: None,
            final_step: false,
            pending_compensation: None,
        }
    }

    pub fn status(&self) -> StrategyStatus {
        self.status
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn processing_rebalance_down(&self) -> bool {
        self.processing_rebalance_down
    }

    pub fn leverage_config(&self) -> &LeverageConfig {
        &self.leverage
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn outstanding_request(&self) -> Option<&AdjustmentTotals> {
        self.request.as_ref()
    }

    /// Block further utilize/deutilize until manually resumed.
    pub fn pause(&mut self) {
        if !self.paused {
            warn!("Strategy paused");
            self.paused = true;
        }
    }

    /// Manual resume after a pause.
    pub fn unpause(&mut self) {
        if self.paused {
            info!("Strategy unpaused");
            self.paused = false;
        }
    }

    /// Terminal wind-down: blocks new utilization; deutilization of the
    /// full position remains allowed.
    pub fn stop(&mut self) {
        if !self.stopped {
            warn!("Strategy stopped");
            self.stopped = true;
        }
    }

    /// Mark a multi-step deleveraging sequence as in progress. Forces
    /// `pending_utilization` to zero until cleared by the upkeep loop.
    pub fn begin_rebalance_down(&mut self) {
        if !self.processing_rebalance_down {
            info!("Rebalance-down in progress");
            self.processing_rebalance_down = true;
        }
    }

    /// Clear the rebalance-down flag once leverage is back near target.
    pub fn clear_rebalance_down(&mut self) {
        if self.processing_rebalance_down {
            info!("Rebalance-down complete");
            self.processing_rebalance_down = false;
        }
    }

    /// Record a hedge adjustment issued outside the utilize/deutilize
    /// paths (collateral rebalances, re-hedges) so its callback can be
    /// reconciled.
    pub fn register_request(&mut self, totals: AdjustmentTotals) {
        self.request = Some(totals);
    }

    /// Assets that may be moved into the spot+hedge pair right now.
    ///
    /// `idle * L / (1 + L)` over the idle capital not reserved for
    /// withdrawals, so that the paired hedge collateral (`amount / L`)
    /// is also covered. Forced to zero during a rebalance-down, while
    /// paused or stopped, and when no shares exist.
    pub fn pending_utilization(&self, view: &PositionView) -> Decimal {
        if self.paused
            || self.stopped
            || self.processing_rebalance_down
            || view.total_shares == Decimal::ZERO
        {
            return Decimal::ZERO;
        }
        let usable = saturating_sub(view.idle_assets, view.pending_withdraw);
        let target = self.leverage.target;
        usable * target / (Decimal::ONE + target)
    }

    /// Product units that should be sold out of the pair right now.
    ///
    /// Rebalance-down demand is the size reduction that returns leverage
    /// to target; withdrawal demand is the size whose sale proceeds plus
    /// proportionally released collateral cover the unmet demand. Zero
    /// shares (or a stop) call for a full exit.
    pub fn pending_deutilization(&self, view: &PositionView) -> Decimal {
        if self.paused || view.spot_exposure == Decimal::ZERO {
            return Decimal::ZERO;
        }
        if view.total_shares == Decimal::ZERO || self.stopped {
            return view.spot_exposure;
        }
        if self.processing_rebalance_down {
            let excess = saturating_sub(view.leverage, self.leverage.target);
            return (view.hedge_size * safe_div(excess, view.leverage))
                .min(view.spot_exposure);
        }

        let unmet = saturating_sub(view.pending_withdraw, view.idle_assets);
        if unmet == Decimal::ZERO {
            return Decimal::ZERO;
        }
        // Selling s tokens frees price*s from spot plus a proportional
        // slice of hedge collateral: s * net_balance / size
        let freed_per_token = view.product_price
            + safe_div(view.hedge_net_balance, view.hedge_size.max(view.spot_exposure));
        safe_div(unmet, freed_per_token).min(view.spot_exposure)
    }

    /// Both pending amounts; by construction never both non-zero.
    pub fn pending_utilizations(&self, view: &PositionView) -> (Decimal, Decimal) {
        (
            self.pending_utilization(view),
            self.pending_deutilization(view),
        )
    }

    /// Move `amount` of idle assets into the pair. Issues the spot leg;
    /// the hedge leg follows from the buy callback.
    pub fn utilize(
        &mut self,
        amount: Decimal,
        view: &PositionView,
    ) -> Result<SpotCommand, ControllerError> {
        self.ensure_idle()?;
        if self.stopped {
            return Err(ControllerError::Stopped);
        }
        if self.paused {
            return Err(ControllerError::Paused);
        }
        if amount <= Decimal::ZERO {
            return Err(ControllerError::ZeroAmount);
        }
        let available = self.pending_utilization(view);
        if amount > available {
            return Err(ControllerError::ExceedsPendingUtilization {
                requested: amount,
                available,
            });
        }

        self.status = StrategyStatus::Utilizing;
        info!(%amount, "Utilizing: spot buy issued");
        Ok(SpotCommand::Buy { assets: amount })
    }

    /// Sell `amount` product units out of the pair. Issues the spot leg;
    /// the paired hedge decrease follows from the sell callback.
    pub fn deutilize(
        &mut self,
        amount: Decimal,
        view: &PositionView,
    ) -> Result<SpotCommand, ControllerError> {
        self.ensure_idle()?;
        if self.paused {
            return Err(ControllerError::Paused);
        }
        if amount <= Decimal::ZERO {
            return Err(ControllerError::ZeroAmount);
        }
        let pending = self.pending_deutilization(view);
        if pending == Decimal::ZERO {
            return Err(ControllerError::NothingToDeutilize);
        }

        // Clamp into the actionable range [venue min size, pending]
        let clamped = if pending <= view.min_size_delta {
            pending
        } else {
            amount.clamp(view.min_size_delta, pending)
        };

        self.deutilize_kind = Some(if self.processing_rebalance_down {
            DeutilizeKind::RebalanceDown
        } else {
            DeutilizeKind::Withdrawal
        });
        self.final_step = clamped >= pending;
        self.status = StrategyStatus::Deutilizing;
        info!(
            requested = %amount,
            %clamped,
            kind = ?self.deutilize_kind,
            final_step = self.final_step,
            "Deutilizing: spot sell issued"
        );
        Ok(SpotCommand::Sell { size: clamped })
    }

    /// Spot buy completed: size the paired hedge increase.
    ///
    /// The hedge is sized to the product actually received, with
    /// collateral `assets_spent / target`, keeping position leverage at
    /// target regardless of the fill price.
    pub fn on_spot_buy_completed(
        &mut self,
        asset_delta: Decimal,
        product_delta: Decimal,
        _view: &PositionView,
    ) -> Result<Option<HedgeCommand>, ControllerError> {
        if self.status != StrategyStatus::Utilizing {
            return Err(ControllerError::UnexpectedCallback(self.status));
        }
        if product_delta == Decimal::ZERO {
            warn!("Spot buy returned nothing, utilization abandoned");
            self.status = StrategyStatus::Idle;
            return Ok(None);
        }

        let command = HedgeCommand {
            size_delta: product_delta,
            collateral_delta: asset_delta / self.leverage.target,
            is_increase: true,
        };
        self.request = Some(AdjustmentTotals {
            size_delta: command.size_delta,
            collateral_delta: command.collateral_delta,
            is_increase: true,
        });
        debug!(
            size = %command.size_delta,
            collateral = %command.collateral_delta,
            "Hedge increase paired to spot buy"
        );
        Ok(Some(command))
    }

    /// Spot sell completed: size the paired hedge decrease.
    ///
    /// Collateral selection: full close when no shares remain or the spot
    /// leg is fully sold; the exact liquidity shortfall on the final step
    /// of a withdrawal batch; a proportional slice otherwise. The view is
    /// taken after the sell, so `spot_exposure` is post-sale and the sale
    /// proceeds are already in `idle_assets`.
    pub fn on_spot_sell_completed(
        &mut self,
        _asset_delta: Decimal,
        product_delta: Decimal,
        view: &PositionView,
    ) -> Result<Option<HedgeCommand>, ControllerError> {
        if let Some(expected) = self.pending_compensation {
            debug!(sold = %product_delta, %expected, "Compensating sell-back completed");
            self.pending_compensation = None;
            return Ok(None);
        }
        if self.status != StrategyStatus::Deutilizing {
            return Err(ControllerError::UnexpectedCallback(self.status));
        }
        if product_delta == Decimal::ZERO {
            warn!("Spot sell returned nothing, deutilization abandoned");
            self.status = StrategyStatus::Idle;
            self.deutilize_kind = None;
            return Ok(None);
        }

        let full_close =
            view.total_shares == Decimal::ZERO || view.spot_exposure == Decimal::ZERO;
        let (size_delta, collateral_delta) = if full_close {
            (view.hedge_size, view.hedge_net_balance)
        } else if self.deutilize_kind == Some(DeutilizeKind::RebalanceDown) {
            // Deleveraging: shrink size but keep collateral in the
            // position so leverage actually falls
            (product_delta, Decimal::ZERO)
        } else {
            let unmet = saturating_sub(view.pending_withdraw, view.idle_assets);
            let liquidity_driven = self.final_step && unmet > Decimal::ZERO;
            if liquidity_driven {
                (product_delta, unmet.min(view.hedge_net_balance))
            } else {
                (
                    product_delta,
                    proportional(view.hedge_net_balance, product_delta, view.hedge_size),
                )
            }
        };

        let command = HedgeCommand {
            size_delta: size_delta.min(view.hedge_size),
            collateral_delta,
            is_increase: false,
        };
        self.request = Some(AdjustmentTotals {
            size_delta: command.size_delta,
            collateral_delta: command.collateral_delta,
            is_increase: false,
        });
        self.status = StrategyStatus::AwaitingFinalDeutilization;
        debug!(
            size = %command.size_delta,
            collateral = %command.collateral_delta,
            full_close,
            "Hedge decrease paired to spot sell"
        );
        Ok(Some(command))
    }

    /// Reconcile a completed hedge adjustment against what was requested.
    ///
    /// Deviation beyond the response threshold flags the operation: a
    /// flagged increase sells back the unmatched spot and pauses; a
    /// flagged decrease or collateral deviation pauses without a
    /// compensating trade. A venue cancellation regresses cleanly with
    /// no flag; drift it leaves behind is picked up by the upkeep loop.
    pub fn after_adjust_position(
        &mut self,
        requested: &AdjustmentTotals,
        executed: &AdjustmentTotals,
        cancelled: bool,
        _view: &PositionView,
    ) -> Result<ReconcileOutcome, ControllerError> {
        if self.request.is_none() {
            return Err(ControllerError::UnexpectedCallback(self.status));
        }
        self.request = None;

        let prior_status = self.status;
        self.status = StrategyStatus::Idle;
        let was_deutilizing = prior_status == StrategyStatus::AwaitingFinalDeutilization;
        if was_deutilizing {
            self.deutilize_kind = None;
            self.final_step = false;
        }

        let mut outcome = ReconcileOutcome::default();
        if cancelled {
            info!("Hedge adjustment cancelled, state regressed");
            return Ok(outcome);
        }

        let threshold = self.thresholds.response_deviation;
        let size_deviates = requested.size_delta > Decimal::ZERO
            && exceeds_deviation(requested.size_delta, executed.size_delta, threshold);
        let collateral_deviates = requested.collateral_delta > Decimal::ZERO
            && exceeds_deviation(
                requested.collateral_delta,
                executed.collateral_delta,
                threshold,
            );

        if size_deviates || collateral_deviates {
            outcome.flagged = true;
            warn!(
                requested_size = %requested.size_delta,
                executed_size = %executed.size_delta,
                requested_collateral = %requested.collateral_delta,
                executed_collateral = %executed.collateral_delta,
                "Execution deviated beyond response threshold"
            );

            if size_deviates && requested.is_increase {
                // Unwind the spot bought against the unfilled hedge size
                let unmatched = saturating_sub(requested.size_delta, executed.size_delta);
                if unmatched > Decimal::ZERO {
                    self.pending_compensation = Some(unmatched);
                    outcome.compensation = Some(SpotCommand::Sell { size: unmatched });
                }
            }
            self.pause();
            outcome.paused = true;
        }

        outcome.service_withdrawals = was_deutilizing && !requested.is_increase;
        Ok(outcome)
    }

    /// Enter the Keeping state ahead of a funding keep.
    pub fn begin_keep(&mut self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        self.status = StrategyStatus::Keeping;
        Ok(())
    }

    /// Funding keep completed (or cancelled); back to Idle.
    pub fn after_keep(&mut self, cancelled: bool) {
        if self.status == StrategyStatus::Keeping {
            self.status = StrategyStatus::Idle;
        }
        if cancelled {
            warn!("Keep cancelled by venue");
        }
    }

    /// Abandon an entered state after a synchronous submission failure.
    /// The spot/hedge leg was never issued, so Idle is consistent.
    pub fn abort_entry(&mut self) {
        self.status = StrategyStatus::Idle;
        self.request = None;
        self.deutilize_kind = None;
        self.final_step = false;
    }

    /// Track a compensating sell issued by the engine after a failed
    /// re-hedge increase.
    pub fn register_compensation(&mut self, size: Decimal) {
        self.pending_compensation = Some(size);
    }

    fn ensure_idle(&self) -> Result<(), ControllerError> {
        if self.status != StrategyStatus::Idle {
            return Err(ControllerError::NotIdle(self.status));
        }
        Ok(())
    }

    /// Restore flags from a persisted snapshot. In-flight statuses are
    /// not restored: a restart reconciles through the upkeep loop.
    pub fn restore(&mut self, processing_rebalance_down: bool, paused: bool, stopped: bool) {
        self.processing_rebalance_down = processing_rebalance_down;
        self.paused = paused;
        self.stopped = stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_controller() -> StrategyController {
        StrategyController::new(LeverageConfig::default(), ThresholdConfig::default())
    }

    fn idle_view() -> PositionView {
        PositionView {
            idle_assets: dec!(10000),
            total_shares: dec!(10000),
            pending_withdraw: Decimal::ZERO,
            spot_exposure: Decimal::ZERO,
            hedge_size: Decimal::ZERO,
            hedge_net_balance: Decimal::ZERO,
            leverage: Decimal::ZERO,
            need_keep: false,
            product_price: dec!(2000),
            min_size_delta: dec!(0.01),
            min_collateral_delta: dec!(10),
            hedge_busy: false,
        }
    }

    fn deployed_view() -> PositionView {
        // 7500 deployed to spot at price 2000, 2500 hedge collateral at 3x
        PositionView {
            idle_assets: Decimal::ZERO,
            total_shares: dec!(10000),
            pending_withdraw: Decimal::ZERO,
            spot_exposure: dec!(3.75),
            hedge_size: dec!(3.75),
            hedge_net_balance: dec!(2500),
            leverage: dec!(3),
            need_keep: false,
            product_price: dec!(2000),
            min_size_delta: dec!(0.01),
            min_collateral_delta: dec!(10),
            hedge_busy: false,
        }
    }

    #[test]
    fn test_pending_utilization_formula() {
        let controller = test_controller();
        let view = idle_view();
        // idle * 3 / (1 + 3) = 7500
        assert_eq!(controller.pending_utilization(&view), dec!(7500));
    }

    #[test]
    fn test_pending_utilization_forced_to_zero() {
        let mut controller = test_controller();
        let mut view = idle_view();

        view.total_shares = Decimal::ZERO;
        assert_eq!(controller.pending_utilization(&view), Decimal::ZERO);

        let view = idle_view();
        controller.begin_rebalance_down();
        assert_eq!(controller.pending_utilization(&view), Decimal::ZERO);
        controller.clear_rebalance_down();

        controller.pause();
        assert_eq!(controller.pending_utilization(&view), Decimal::ZERO);
        controller.unpause();

        controller.stop();
        assert_eq!(controller.pending_utilization(&view), Decimal::ZERO);
    }

    #[test]
    fn test_pending_amounts_never_both_nonzero() {
        let controller = test_controller();

        // Withdrawal demand beyond idle: deutilization only
        let mut view = deployed_view();
        view.idle_assets = dec!(100);
        view.pending_withdraw = dec!(3000);
        let (utilization, deutilization) = controller.pending_utilizations(&view);
        assert_eq!(utilization, Decimal::ZERO);
        assert!(deutilization > Decimal::ZERO);

        // Demand covered by idle: utilization only
        let mut view = deployed_view();
        view.idle_assets = dec!(5000);
        view.pending_withdraw = dec!(3000);
        let (utilization, deutilization) = controller.pending_utilizations(&view);
        assert_eq!(utilization, dec!(1500)); // (5000-3000) * 3/4
        assert_eq!(deutilization, Decimal::ZERO);
    }

    #[test]
    fn test_utilize_happy_path() {
        let mut controller = test_controller();
        let view = idle_view();

        let command = controller.utilize(dec!(7500), &view).unwrap();
        assert_eq!(command, SpotCommand::Buy { assets: dec!(7500) });
        assert_eq!(controller.status(), StrategyStatus::Utilizing);
    }

    #[test]
    fn test_utilize_guards() {
        let mut controller = test_controller();
        let view = idle_view();

        assert_eq!(
            controller.utilize(Decimal::ZERO, &view),
            Err(ControllerError::ZeroAmount)
        );
        assert_eq!(
            controller.utilize(dec!(7501), &view),
            Err(ControllerError::ExceedsPendingUtilization {
                requested: dec!(7501),
                available: dec!(7500),
            })
        );

        controller.pause();
        assert_eq!(
            controller.utilize(dec!(100), &view),
            Err(ControllerError::Paused)
        );
        controller.unpause();

        controller.stop();
        assert_eq!(
            controller.utilize(dec!(100), &view),
            Err(ControllerError::Stopped)
        );
    }

    #[test]
    fn test_reentrancy_rejected_while_busy() {
        let mut controller = test_controller();
        let view = idle_view();
        controller.utilize(dec!(1000), &view).unwrap();

        assert_eq!(
            controller.utilize(dec!(1000), &view),
            Err(ControllerError::NotIdle(StrategyStatus::Utilizing))
        );
        assert_eq!(
            controller.deutilize(dec!(1), &view),
            Err(ControllerError::NotIdle(StrategyStatus::Utilizing))
        );
        assert_eq!(
            controller.begin_keep(),
            Err(ControllerError::NotIdle(StrategyStatus::Utilizing))
        );
    }

    #[test]
    fn test_buy_callback_pairs_hedge_increase_at_target() {
        let mut controller = test_controller();
        let view = idle_view();
        controller.utilize(dec!(7500), &view).unwrap();

        let command = controller
            .on_spot_buy_completed(dec!(7500), dec!(3.75), &view)
            .unwrap()
            .unwrap();
        assert_eq!(command.size_delta, dec!(3.75));
        // 7500 / 3 = 2500 collateral keeps the position at target
        assert_eq!(command.collateral_delta, dec!(2500));
        assert!(command.is_increase);
        assert!(controller.outstanding_request().is_some());
    }

    #[test]
    fn test_buy_callback_rejected_when_not_utilizing() {
        let mut controller = test_controller();
        let view = idle_view();
        assert_eq!(
            controller.on_spot_buy_completed(dec!(100), dec!(0.05), &view),
            Err(ControllerError::UnexpectedCallback(StrategyStatus::Idle))
        );
    }

    #[test]
    fn test_deutilize_clamps_into_actionable_range() {
        let mut controller = test_controller();
        let mut view = deployed_view();
        view.idle_assets = Decimal::ZERO;
        view.pending_withdraw = dec!(1000);

        // Tiny request is raised to the venue minimum
        let command = controller.deutilize(dec!(0.001), &view).unwrap();
        match command {
            SpotCommand::Sell { size } => assert_eq!(size, dec!(0.01)),
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(controller.status(), StrategyStatus::Deutilizing);
    }

    #[test]
    fn test_deutilize_rejected_without_demand() {
        let mut controller = test_controller();
        let view = deployed_view();
        assert_eq!(
            controller.deutilize(dec!(1), &view),
            Err(ControllerError::NothingToDeutilize)
        );
    }

    #[test]
    fn test_sell_callback_proportional_collateral_on_partial_step() {
        let mut controller = test_controller();
        let mut view = deployed_view();
        view.idle_assets = Decimal::ZERO;
        view.pending_withdraw = dec!(10000); // far beyond one step

        let command = controller.deutilize(dec!(1), &view).unwrap();
        let sold = match command {
            SpotCommand::Sell { size } => size,
            other => panic!("unexpected command {other:?}"),
        };
        assert_eq!(sold, dec!(1));
        assert!(!controller.final_step);

        // Post-sale view: exposure down 1 token, proceeds 2000 in idle
        let mut post = view.clone();
        post.spot_exposure = dec!(2.75);
        post.idle_assets = dec!(2000);

        let hedge = controller
            .on_spot_sell_completed(dec!(2000), dec!(1), &post)
            .unwrap()
            .unwrap();
        assert_eq!(hedge.size_delta, dec!(1));
        // 2500 * 1 / 3.75 ≈ 666.67 proportional collateral
        assert_eq!(hedge.collateral_delta.round_dp(2), dec!(666.67));
        assert!(!hedge.is_increase);
        assert_eq!(
            controller.status(),
            StrategyStatus::AwaitingFinalDeutilization
        );
    }

    #[test]
    fn test_sell_callback_liquidity_driven_on_final_step() {
        let mut controller = test_controller();
        let mut view = deployed_view();
        view.idle_assets = Decimal::ZERO;
        view.pending_withdraw = dec!(2500);

        // unmet 2500 / freed-per-token (2000 + 2500/3.75) ≈ 0.9375
        let command = controller.deutilize(dec!(5), &view).unwrap();
        let sold = match command {
            SpotCommand::Sell { size } => size,
            other => panic!("unexpected command {other:?}"),
        };
        assert_eq!(sold.round_dp(4), dec!(0.9375));
        assert!(controller.final_step);

        // Post-sale: proceeds 1875 in idle, 625 still unmet
        let mut post = view.clone();
        post.spot_exposure = view.spot_exposure - sold;
        post.idle_assets = dec!(1875);

        let hedge = controller
            .on_spot_sell_completed(dec!(1875), sold, &post)
            .unwrap()
            .unwrap();
        // Liquidity-driven: exactly the unmet demand, not the pro-rata slice
        assert_eq!(hedge.collateral_delta, dec!(625));
    }

    #[test]
    fn test_sell_callback_full_close_when_exposure_exhausted() {
        let mut controller = test_controller();
        let mut view = deployed_view();
        view.idle_assets = Decimal::ZERO;
        view.pending_withdraw = dec!(20000);

        controller.deutilize(dec!(3.75), &view).unwrap();

        let mut post = view.clone();
        post.spot_exposure = Decimal::ZERO;
        post.idle_assets = dec!(7500);

        let hedge = controller
            .on_spot_sell_completed(dec!(7500), dec!(3.75), &post)
            .unwrap()
            .unwrap();
        // Everything: full size and full net balance
        assert_eq!(hedge.size_delta, dec!(3.75));
        assert_eq!(hedge.collateral_delta, dec!(2500));
    }

    #[test]
    fn test_reconcile_clean_execution_returns_idle() {
        let mut controller = test_controller();
        let view = idle_view();
        controller.utilize(dec!(7500), &view).unwrap();
        controller
            .on_spot_buy_completed(dec!(7500), dec!(3.75), &view)
            .unwrap();

        let requested = AdjustmentTotals {
            size_delta: dec!(3.75),
            collateral_delta: dec!(2500),
            is_increase: true,
        };
        let outcome = controller
            .after_adjust_position(&requested, &requested, false, &view)
            .unwrap();

        assert!(!outcome.flagged);
        assert!(outcome.compensation.is_none());
        assert_eq!(controller.status(), StrategyStatus::Idle);
        assert!(!controller.is_paused());
        assert!(controller.outstanding_request().is_none());
    }

    #[test]
    fn test_reconcile_increase_shortfall_sells_back_and_pauses() {
        let mut controller = test_controller();
        let view = idle_view();
        controller.utilize(dec!(7500), &view).unwrap();
        controller
            .on_spot_buy_completed(dec!(7500), dec!(4), &view)
            .unwrap();

        let requested = AdjustmentTotals {
            size_delta: dec!(4),
            collateral_delta: dec!(2500),
            is_increase: true,
        };
        let executed = AdjustmentTotals {
            size_delta: dec!(3.5), // 12.5% short
            collateral_delta: dec!(2500),
            is_increase: true,
        };
        let outcome = controller
            .after_adjust_position(&requested, &executed, false, &view)
            .unwrap();

        assert!(outcome.flagged);
        assert!(outcome.paused);
        assert_eq!(
            outcome.compensation,
            Some(SpotCommand::Sell { size: dec!(0.5) })
        );
        assert!(controller.is_paused());

        // The compensating sell's fill is absorbed silently
        let result = controller
            .on_spot_sell_completed(dec!(1000), dec!(0.5), &view)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_reconcile_decrease_shortfall_pauses_without_compensation() {
        let mut controller = test_controller();
        let mut view = deployed_view();
        view.pending_withdraw = dec!(3000);
        controller.deutilize(dec!(1), &view).unwrap();

        let mut post = view.clone();
        post.spot_exposure = dec!(2.75);
        post.idle_assets = dec!(2000);
        controller
            .on_spot_sell_completed(dec!(2000), dec!(1), &post)
            .unwrap();

        let requested = controller.outstanding_request().copied().unwrap();
        let executed = AdjustmentTotals {
            size_delta: requested.size_delta * dec!(0.95), // 5% short vs 1% threshold
            collateral_delta: requested.collateral_delta * dec!(0.95),
            is_increase: false,
        };
        let outcome = controller
            .after_adjust_position(&requested, &executed, false, &post)
            .unwrap();

        assert!(outcome.flagged);
        assert!(outcome.paused);
        assert!(outcome.compensation.is_none());
        assert!(outcome.service_withdrawals);
        assert!(controller.is_paused());

        // Pause does not auto-resume: utilize and deutilize stay blocked
        assert_eq!(
            controller.utilize(dec!(1), &post),
            Err(ControllerError::Paused)
        );
        assert_eq!(
            controller.deutilize(dec!(1), &post),
            Err(ControllerError::Paused)
        );
    }

    #[test]
    fn test_reconcile_cancellation_regresses_without_flag() {
        let mut controller = test_controller();
        let view = idle_view();
        controller.utilize(dec!(7500), &view).unwrap();
        controller
            .on_spot_buy_completed(dec!(7500), dec!(3.75), &view)
            .unwrap();

        let requested = controller.outstanding_request().copied().unwrap();
        let executed = AdjustmentTotals {
            size_delta: Decimal::ZERO,
            collateral_delta: Decimal::ZERO,
            is_increase: true,
        };
        let outcome = controller
            .after_adjust_position(&requested, &executed, true, &view)
            .unwrap();

        assert!(!outcome.flagged);
        assert!(!controller.is_paused());
        assert_eq!(controller.status(), StrategyStatus::Idle);
    }

    #[test]
    fn test_callback_without_request_rejected() {
        let mut controller = test_controller();
        let view = idle_view();
        let totals = AdjustmentTotals {
            size_delta: dec!(1),
            collateral_delta: dec!(100),
            is_increase: true,
        };
        assert_eq!(
            controller.after_adjust_position(&totals, &totals, false, &view),
            Err(ControllerError::UnexpectedCallback(StrategyStatus::Idle))
        );
    }

    #[test]
    fn test_keep_cycle() {
        let mut controller = test_controller();
        controller.begin_keep().unwrap();
        assert_eq!(controller.status(), StrategyStatus::Keeping);
        controller.after_keep(false);
        assert_eq!(controller.status(), StrategyStatus::Idle);
    }
}
