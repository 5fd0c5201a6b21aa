//! Pull-based control loop: leverage maintenance, re-hedging and fee
//! keeping.
//!
//! `check_upkeep` evaluates corrective branches in strict priority order
//! and reports at most one action; `perform_upkeep` (on the engine)
//! executes it. Callers loop the pair until no action is reported, since
//! one invocation performs exactly one corrective step.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::utils::decimal::{safe_div, saturating_sub};

use super::controller::{PositionView, StrategyController, StrategyStatus};

/// One corrective step the control loop may ask for. Branches are
/// mutually exclusive per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum UpkeepAction {
    /// Nothing to do
    None,
    /// Leverage beyond the safety margin and idle capital cannot fix it:
    /// forcibly reduce spot+hedge size
    EmergencyDeleverage { size: Decimal },
    /// Leverage above max: post idle capital as collateral
    AddCollateral { amount: Decimal },
    /// Leverage back near target: clear the rebalance-down flag
    ClearRebalanceDown,
    /// Hedge size drifted from spot exposure: adjust the hedge
    Rehedge {
        size_delta: Decimal,
        is_increase: bool,
    },
    /// Claim accrued funding
    Keep,
    /// Leverage below min: withdraw collateral back to the vault
    RemoveCollateral { amount: Decimal },
}

impl UpkeepAction {
    pub fn is_none(&self) -> bool {
        matches!(self, UpkeepAction::None)
    }
}

impl StrategyController {
    /// Evaluate the control loop. Pure over `(self, view)`: repeated
    /// calls with no intervening state change report the same action.
    pub fn check_upkeep(&self, view: &PositionView) -> UpkeepAction {
        // A busy strategy or one under manual intervention never self-adjusts
        if self.status() != StrategyStatus::Idle
            || self.outstanding_request().is_some()
            || view.hedge_busy
            || self.is_paused()
        {
            return UpkeepAction::None;
        }

        let leverage_config = self.leverage_config();
        let thresholds = self.thresholds();
        let leverage = view.leverage;

        if view.hedge_size > Decimal::ZERO {
            // Collateral needed to bring leverage back to target
            let needed = view.hedge_net_balance
                * safe_div(
                    saturating_sub(leverage, leverage_config.target),
                    leverage_config.target,
                );

            // (1) Emergency: beyond the safety margin with idle capital
            // unable to cover the fix
            if leverage > leverage_config.safe_margin && needed > view.idle_assets {
                let size = view.hedge_size
                    * safe_div(saturating_sub(leverage, leverage_config.max), leverage);
                if size >= view.min_size_delta {
                    return UpkeepAction::EmergencyDeleverage {
                        size: size.min(view.spot_exposure),
                    };
                }
            }

            // (2) Ordinary rebalance-down: add collateral, clamped to
            // idle. An in-progress rebalance-down keeps this branch live
            // below max until leverage is back near target.
            let continuing = self.processing_rebalance_down()
                && leverage > leverage_config.target + thresholds.leverage_tolerance;
            if leverage > leverage_config.max || continuing {
                let amount = needed.min(view.idle_assets);
                if amount >= view.min_collateral_delta {
                    return UpkeepAction::AddCollateral { amount };
                }
                debug!(%amount, "Rebalance-down wanted but below actionable minimum");
            }

            // (3) Rebalance-down finished once leverage is near target
            if self.processing_rebalance_down()
                && (leverage - leverage_config.target).abs() <= thresholds.leverage_tolerance
            {
                return UpkeepAction::ClearRebalanceDown;
            }
        }

        // (4) Re-hedge: hedge size drifted from spot exposure
        if view.spot_exposure > Decimal::ZERO {
            let drift = (view.hedge_size - view.spot_exposure).abs();
            if safe_div(drift, view.spot_exposure) > thresholds.hedge_deviation
                && drift >= view.min_size_delta
            {
                return UpkeepAction::Rehedge {
                    size_delta: drift,
                    is_increase: view.hedge_size < view.spot_exposure,
                };
            }
        } else if view.hedge_size >= view.min_size_delta {
            // Spot fully gone but a hedge remains: close it down
            return UpkeepAction::Rehedge {
                size_delta: view.hedge_size,
                is_increase: false,
            };
        }

        // (5) Fee keeping
        if view.need_keep {
            return UpkeepAction::Keep;
        }

        // (6) Rebalance-up: withdraw excess collateral, only when the
        // amount clears the venue minimum
        if view.hedge_size > Decimal::ZERO && leverage < leverage_config.min {
            let amount = view.hedge_net_balance
                * safe_div(
                    saturating_sub(leverage_config.target, leverage),
                    leverage_config.target,
                );
            if amount >= view.min_collateral_delta {
                return UpkeepAction::RemoveCollateral { amount };
            }
        }

        UpkeepAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LeverageConfig, ThresholdConfig};
    use rust_decimal_macros::dec;

    fn controller() -> StrategyController {
        StrategyController::new(LeverageConfig::default(), ThresholdConfig::default())
    }

    /// Position with adjustable leverage: size 3 tokens at price 2000.
    fn view_at_leverage(leverage: Decimal) -> PositionView {
        let notional = dec!(6000);
        PositionView {
            idle_assets: dec!(10000),
            total_shares: dec!(10000),
            pending_withdraw: Decimal::ZERO,
            spot_exposure: dec!(3),
            hedge_size: dec!(3),
            hedge_net_balance: notional / leverage,
            leverage,
            need_keep: false,
            product_price: dec!(2000),
            min_size_delta: dec!(0.01),
            min_collateral_delta: dec!(10),
            hedge_busy: false,
        }
    }

    #[test]
    fn test_quiescent_position_needs_nothing() {
        let controller = controller();
        let view = view_at_leverage(dec!(3));
        assert_eq!(controller.check_upkeep(&view), UpkeepAction::None);
    }

    #[test]
    fn test_check_upkeep_is_idempotent() {
        let controller = controller();
        let view = view_at_leverage(dec!(6));
        let first = controller.check_upkeep(&view);
        let second = controller.check_upkeep(&view);
        assert_eq!(first, second);
        assert!(!first.is_none());
    }

    #[test]
    fn test_rebalance_down_sizing() {
        let controller = controller();
        // Leverage 6 vs target 3: needed = net * (6-3)/3 = net
        let view = view_at_leverage(dec!(6));
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::AddCollateral { amount: dec!(1000) }
        );
    }

    #[test]
    fn test_rebalance_down_clamped_to_idle() {
        let controller = controller();
        let mut view = view_at_leverage(dec!(6));
        view.idle_assets = dec!(400);
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::AddCollateral { amount: dec!(400) }
        );
    }

    #[test]
    fn test_emergency_when_idle_cannot_cover() {
        let controller = controller();
        // Leverage 25 beyond safe margin 20; needed = 240 * 22/3 = 1760
        let mut view = view_at_leverage(dec!(25));
        view.idle_assets = dec!(100);
        // size * (25 - 5)/25 = 3 * 0.8 = 2.4
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::EmergencyDeleverage { size: dec!(2.4) }
        );
    }

    #[test]
    fn test_beyond_safe_margin_with_idle_stays_ordinary() {
        let controller = controller();
        // Same breach, but idle covers the collateral fix
        let view = view_at_leverage(dec!(25));
        // needed = 240 * (25-3)/3 = 1760 <= 10000 idle
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::AddCollateral { amount: dec!(1760) }
        );
    }

    #[test]
    fn test_rebalance_down_continues_below_max_while_flagged() {
        let mut controller = controller();
        controller.begin_rebalance_down();

        // Still above tolerance: the sequence keeps adding collateral
        // even though leverage is already below max
        let view = view_at_leverage(dec!(4));
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::AddCollateral { amount: dec!(500) }
        );
    }

    #[test]
    fn test_clear_flag_once_back_at_target() {
        let mut controller = controller();
        controller.begin_rebalance_down();

        let view = view_at_leverage(dec!(3.1));
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::ClearRebalanceDown
        );

        // Without the flag the same view needs nothing
        controller.clear_rebalance_down();
        assert_eq!(controller.check_upkeep(&view), UpkeepAction::None);
    }

    #[test]
    fn test_rehedge_on_drift() {
        let controller = controller();
        let mut view = view_at_leverage(dec!(3));
        view.hedge_size = dec!(2.8); // 6.67% drift vs 2% threshold

        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::Rehedge {
                size_delta: dec!(0.2),
                is_increase: true,
            }
        );

        view.hedge_size = dec!(3.2);
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::Rehedge {
                size_delta: dec!(0.2),
                is_increase: false,
            }
        );
    }

    #[test]
    fn test_drift_within_threshold_ignored() {
        let controller = controller();
        let mut view = view_at_leverage(dec!(3));
        view.hedge_size = dec!(2.95); // 1.67% < 2%
        assert_eq!(controller.check_upkeep(&view), UpkeepAction::None);
    }

    #[test]
    fn test_orphaned_hedge_closed_down() {
        let controller = controller();
        let mut view = view_at_leverage(dec!(3));
        view.spot_exposure = Decimal::ZERO;
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::Rehedge {
                size_delta: dec!(3),
                is_increase: false,
            }
        );
    }

    #[test]
    fn test_keep_when_funding_claimable() {
        let controller = controller();
        let mut view = view_at_leverage(dec!(3));
        view.need_keep = true;
        assert_eq!(controller.check_upkeep(&view), UpkeepAction::Keep);
    }

    #[test]
    fn test_rebalance_up_below_min_leverage() {
        let controller = controller();
        // Leverage 1.5 vs min 2: withdraw net * (3 - 1.5)/3 = net/2 = 2000
        let view = view_at_leverage(dec!(1.5));
        assert_eq!(
            controller.check_upkeep(&view),
            UpkeepAction::RemoveCollateral { amount: dec!(2000) }
        );
    }

    #[test]
    fn test_rebalance_up_skipped_below_actionable_minimum() {
        let controller = controller();
        let mut view = view_at_leverage(dec!(1.99));
        // Withdrawable amount just above zero but below the venue minimum
        view.hedge_net_balance = dec!(25);
        view.leverage = dec!(1.99);
        assert_eq!(controller.check_upkeep(&view), UpkeepAction::None);
    }

    #[test]
    fn test_priority_emergency_over_drift_and_keep() {
        let controller = controller();
        let mut view = view_at_leverage(dec!(25));
        view.idle_assets = Decimal::ZERO;
        view.hedge_size = dec!(2); // drifted too
        view.need_keep = true;

        match controller.check_upkeep(&view) {
            UpkeepAction::EmergencyDeleverage { .. } => {}
            other => panic!("expected emergency first, got {other:?}"),
        }
    }

    #[test]
    fn test_no_upkeep_while_busy_or_paused() {
        let mut controller = controller();
        let mut view = view_at_leverage(dec!(6));

        view.hedge_busy = true;
        assert_eq!(controller.check_upkeep(&view), UpkeepAction::None);
        view.hedge_busy = false;

        controller.pause();
        assert_eq!(controller.check_upkeep(&view), UpkeepAction::None);
        controller.unpause();

        assert!(!controller.check_upkeep(&view).is_none());
    }
}
