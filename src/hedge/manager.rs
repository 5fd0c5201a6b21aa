//! Hedge position management and venue-side accounting.
//!
//! The [`HedgePositionManager`] owns one short position on the hedge
//! venue. It enforces single-flight ordering per direction, authenticates
//! execution reports against pending order keys, rolls funding/borrowing
//! fee watermarks, and splits collateral decreases that exceed the
//! venue's net-collateral headroom into a close-then-reopen sequence.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::VenueLimitsConfig;
use crate::oracle::{OracleError, PriceOracle};
use crate::utils::decimal::{safe_div, saturating_sub};

use super::venue::{
    ExecutionStatus, HedgeExecution, HedgeOrder, HedgeOrderKind, HedgeVenue,
};

/// Hedge adjustment failures.
#[derive(Debug, Error, PartialEq)]
pub enum HedgeError {
    #[error("an adjustment is already in flight")]
    AdjustmentPending,
    #[error("a keep is already in flight")]
    KeepPending,
    #[error("adjustment has no effect")]
    EmptyAdjustment,
    #[error("size delta {size} below venue minimum {min}")]
    BelowMinSize { size: Decimal, min: Decimal },
    #[error("collateral delta {collateral} below venue minimum {min}")]
    BelowMinCollateral { collateral: Decimal, min: Decimal },
    #[error("decrease of {requested} exceeds position size {size}")]
    ExceedsPositionSize { requested: Decimal, size: Decimal },
    #[error("nothing to keep")]
    NothingToKeep,
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

/// Size/collateral delta pair for one logical adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentTotals {
    pub size_delta: Decimal,
    pub collateral_delta: Decimal,
    pub is_increase: bool,
}

/// Completion event surfaced to the strategy controller.
#[derive(Debug, Clone)]
pub enum HedgeCallback {
    /// A logical adjustment finished (possibly after multiple venue legs).
    Adjusted {
        requested: AdjustmentTotals,
        executed: AdjustmentTotals,
        cancelled: bool,
    },
    /// A keep finished; `claimed` funding is ready to return to the vault.
    Kept { claimed: Decimal, cancelled: bool },
}

/// Sub-state of a split decrease. Forward progression is
/// `TwoStep -> OneStep -> Idle` as venue legs complete; a cancellation
/// regresses the pending leg by one step instead of aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecreaseState {
    Idle,
    /// Full close in flight, re-open to follow
    TwoStep,
    /// Re-open in flight (or awaiting resubmission after a cancel)
    OneStep,
}

/// The venue-side position owned by this manager.
#[derive(Debug, Clone, Default)]
pub struct HedgePosition {
    /// Position size in product units
    pub size_in_tokens: Decimal,
    /// Net collateral backing the position, in asset units
    pub collateral: Decimal,
    /// Lifetime funding accrued
    pub total_funding_accrued: Decimal,
    /// Lifetime borrowing fees paid out of collateral
    pub total_borrowing_paid: Decimal,
}

/// One logical adjustment tracked across its venue legs.
#[derive(Debug, Clone)]
struct LogicalAdjustment {
    requested: AdjustmentTotals,
    executed_size: Decimal,
    executed_collateral: Decimal,
    prior_size: Decimal,
    two_step: bool,
}

impl LogicalAdjustment {
    fn new(requested: AdjustmentTotals, prior_size: Decimal, two_step: bool) -> Self {
        Self {
            requested,
            executed_size: Decimal::ZERO,
            executed_collateral: Decimal::ZERO,
            prior_size,
            two_step,
        }
    }
}

pub struct HedgePositionManager {
    venue: Arc<dyn HedgeVenue>,
    oracle: Arc<dyn PriceOracle>,
    product: String,
    limits: VenueLimitsConfig,
    position: HedgePosition,
    /// Collateral sitting at the venue but outside the position
    idle_collateral: Decimal,
    /// Decrease collateral deferred because it fell below the venue
    /// minimum; folded into the next decrease
    deferred_decrease_collateral: Decimal,
    pending_increase: Option<u64>,
    pending_decrease: Option<u64>,
    pending_keep: Option<u64>,
    decrease_state: DecreaseState,
    current: Option<LogicalAdjustment>,
    /// Re-open order awaiting resubmission after a cancelled leg
    resume_order: Option<HedgeOrder>,
    funding_watermark: Decimal,
    borrowing_watermark: Decimal,
    /// Funding accrued but not yet claimed back to the vault
    pending_funding: Decimal,
    next_key: u64,
}

impl HedgePositionManager {
    pub fn new(
        venue: Arc<dyn HedgeVenue>,
        oracle: Arc<dyn PriceOracle>,
        product: impl Into<String>,
        limits: VenueLimitsConfig,
    ) -> Self {
        Self {
            venue,
            oracle,
            product: product.into(),
            limits,
            position: HedgePosition::default(),
            idle_collateral: Decimal::ZERO,
            deferred_decrease_collateral: Decimal::ZERO,
            pending_increase: None,
            pending_decrease: None,
            pending_keep: None,
            decrease_state: DecreaseState::Idle,
            current: None,
            resume_order: None,
            funding_watermark: Decimal::ZERO,
            borrowing_watermark: Decimal::ZERO,
            pending_funding: Decimal::ZERO,
            next_key: 1,
        }
    }

    pub fn position(&self) -> &HedgePosition {
        &self.position
    }

    /// Net collateral value of the position.
    pub fn position_net_balance(&self) -> Decimal {
        self.position.collateral
    }

    /// Position size in product units.
    pub fn position_size_in_tokens(&self) -> Decimal {
        self.position.size_in_tokens
    }

    /// Notional value of the position at the oracle price.
    pub fn size_value(&self) -> Result<Decimal, OracleError> {
        let price = self.oracle.price(&self.product)?;
        Ok(self.position.size_in_tokens * price)
    }

    /// Leverage = notional / net collateral. Zero-size positions report
    /// zero; a sized position with no collateral reports `Decimal::MAX`.
    pub fn current_leverage(&self) -> Result<Decimal, OracleError> {
        let notional = self.size_value()?;
        if notional == Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        if self.position.collateral == Decimal::ZERO {
            return Ok(Decimal::MAX);
        }
        Ok(notional / self.position.collateral)
    }

    /// Whether accrued funding is worth claiming.
    pub fn need_keep(&self, min_keep: Decimal) -> bool {
        self.pending_funding >= min_keep && self.pending_keep.is_none() && self.current.is_none()
    }

    /// Funding accrued and awaiting a keep.
    pub fn pending_funding(&self) -> Decimal {
        self.pending_funding
    }

    /// Collateral held at the venue outside the position.
    pub fn idle_collateral(&self) -> Decimal {
        self.idle_collateral
    }

    /// Last observed cumulative funding fee per unit of size.
    pub fn funding_watermark(&self) -> Decimal {
        self.funding_watermark
    }

    /// Last observed cumulative borrowing fee per unit of size.
    pub fn borrowing_watermark(&self) -> Decimal {
        self.borrowing_watermark
    }

    pub fn limits(&self) -> &VenueLimitsConfig {
        &self.limits
    }

    /// Whether a logical adjustment or keep is in flight.
    pub fn adjustment_in_flight(&self) -> bool {
        self.current.is_some() || self.pending_keep.is_some() || self.resume_order.is_some()
    }

    pub fn decrease_state(&self) -> DecreaseState {
        self.decrease_state
    }

    fn next_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Request a position adjustment.
    ///
    /// Returns the collateral that must be funded externally (the
    /// requested increase collateral less what idle venue collateral
    /// already covers); zero for decreases.
    pub async fn adjust_position(
        &mut self,
        size_delta: Decimal,
        collateral_delta: Decimal,
        is_increase: bool,
    ) -> Result<Decimal, HedgeError> {
        if self.current.is_some() || self.resume_order.is_some() {
            return Err(HedgeError::AdjustmentPending);
        }
        if is_increase && self.pending_increase.is_some()
            || !is_increase && self.pending_decrease.is_some()
        {
            return Err(HedgeError::AdjustmentPending);
        }
        if size_delta == Decimal::ZERO && collateral_delta == Decimal::ZERO {
            return Err(HedgeError::EmptyAdjustment);
        }
        if size_delta > Decimal::ZERO && size_delta < self.limits.min_size_delta {
            return Err(HedgeError::BelowMinSize {
                size: size_delta,
                min: self.limits.min_size_delta,
            });
        }

        if is_increase {
            self.submit_increase(size_delta, collateral_delta).await
        } else {
            self.submit_decrease(size_delta, collateral_delta).await
        }
    }

    async fn submit_increase(
        &mut self,
        size_delta: Decimal,
        collateral_delta: Decimal,
    ) -> Result<Decimal, HedgeError> {
        if collateral_delta > Decimal::ZERO && collateral_delta < self.limits.min_collateral_delta
        {
            return Err(HedgeError::BelowMinCollateral {
                collateral: collateral_delta,
                min: self.limits.min_collateral_delta,
            });
        }

        // Idle venue collateral covers part of the posting; only the
        // shortfall crosses from the vault.
        let from_idle = self.idle_collateral.min(collateral_delta);
        self.idle_collateral -= from_idle;
        let external = collateral_delta - from_idle;

        let requested = AdjustmentTotals {
            size_delta,
            collateral_delta,
            is_increase: true,
        };
        let key = self.next_key();
        self.pending_increase = Some(key);
        self.current = Some(LogicalAdjustment::new(
            requested,
            self.position.size_in_tokens,
            false,
        ));

        debug!(
            key,
            %size_delta,
            %collateral_delta,
            %from_idle,
            "Hedge increase submitted"
        );
        self.venue
            .submit(HedgeOrder {
                key,
                kind: HedgeOrderKind::Increase,
                size_delta,
                collateral_delta,
            })
            .await;
        Ok(external)
    }

    async fn submit_decrease(
        &mut self,
        size_delta: Decimal,
        mut collateral_delta: Decimal,
    ) -> Result<Decimal, HedgeError> {
        if size_delta > self.position.size_in_tokens {
            return Err(HedgeError::ExceedsPositionSize {
                requested: size_delta,
                size: self.position.size_in_tokens,
            });
        }

        // Fold in collateral previously deferred for being too small
        collateral_delta += std::mem::take(&mut self.deferred_decrease_collateral);

        if collateral_delta > Decimal::ZERO && collateral_delta < self.limits.min_collateral_delta
        {
            if size_delta == Decimal::ZERO {
                // Nothing actionable at all: put the deferral back
                self.deferred_decrease_collateral = collateral_delta;
                return Err(HedgeError::BelowMinCollateral {
                    collateral: collateral_delta,
                    min: self.limits.min_collateral_delta,
                });
            }
            // Defer the dust and decrease size only
            debug!(%collateral_delta, "Deferring sub-minimum decrease collateral");
            self.deferred_decrease_collateral = collateral_delta;
            collateral_delta = Decimal::ZERO;
        }

        let requested = AdjustmentTotals {
            size_delta,
            collateral_delta,
            is_increase: false,
        };

        // Withdrawing more collateral than the venue allows against the
        // remaining size requires realizing PnL first: close the whole
        // position, then re-establish the remainder.
        let price = self.oracle.price(&self.product)?;
        let remaining_notional = (self.position.size_in_tokens - size_delta) * price;
        let headroom = saturating_sub(
            self.position.collateral,
            safe_div(remaining_notional, self.limits.venue_max_leverage),
        );
        let two_step = collateral_delta > headroom && self.position.size_in_tokens > size_delta;

        let key = self.next_key();
        self.pending_decrease = Some(key);
        self.current = Some(LogicalAdjustment::new(
            requested,
            self.position.size_in_tokens,
            two_step,
        ));

        let order = if two_step {
            self.decrease_state = DecreaseState::TwoStep;
            info!(
                key,
                requested_size = %size_delta,
                requested_collateral = %collateral_delta,
                %headroom,
                "Decrease exceeds collateral headroom, splitting into close + reopen"
            );
            HedgeOrder {
                key,
                kind: HedgeOrderKind::Decrease,
                size_delta: self.position.size_in_tokens,
                collateral_delta: self.position.collateral,
            }
        } else {
            debug!(key, %size_delta, %collateral_delta, "Hedge decrease submitted");
            HedgeOrder {
                key,
                kind: HedgeOrderKind::Decrease,
                size_delta,
                collateral_delta,
            }
        };

        self.venue.submit(order).await;
        Ok(Decimal::ZERO)
    }

    /// Claim accrued funding without changing position size.
    pub async fn keep(&mut self) -> Result<(), HedgeError> {
        if self.pending_keep.is_some() {
            return Err(HedgeError::KeepPending);
        }
        if self.pending_funding == Decimal::ZERO {
            return Err(HedgeError::NothingToKeep);
        }

        let key = self.next_key();
        self.pending_keep = Some(key);
        debug!(key, claimable = %self.pending_funding, "Keep submitted");
        self.venue
            .submit(HedgeOrder {
                key,
                kind: HedgeOrderKind::Keep,
                size_delta: Decimal::ZERO,
                collateral_delta: Decimal::ZERO,
            })
            .await;
        Ok(())
    }

    /// Resubmit a re-open leg whose order was cancelled. Retries are
    /// driven by the control loop, never spontaneously.
    pub async fn resume_interrupted(&mut self) -> bool {
        let Some(order) = self.resume_order.take() else {
            return false;
        };
        let key = self.next_key();
        self.pending_increase = Some(key);
        info!(key, "Resubmitting interrupted re-open leg");
        self.venue.submit(HedgeOrder { key, ..order }).await;
        true
    }

    /// Drain venue executions, authenticate them and apply their effects.
    /// Returns callbacks for completed logical operations.
    pub async fn poll_completed(&mut self) -> Vec<HedgeCallback> {
        let mut callbacks = Vec::new();
        for execution in self.venue.poll_executions().await {
            if !self.authenticate(&execution) {
                warn!(key = execution.key, "Rejecting execution with unknown order key");
                continue;
            }
            // Fee accrual must use the size before this execution's delta
            self.accrue_fees(&execution);

            if let Some(callback) = self.apply_execution(execution).await {
                callbacks.push(callback);
            }
        }
        callbacks
    }

    /// An execution is ours only if its key matches the pending marker
    /// for its direction. Clears the marker on success.
    fn authenticate(&mut self, execution: &HedgeExecution) -> bool {
        let slot = match execution.kind {
            HedgeOrderKind::Increase => &mut self.pending_increase,
            HedgeOrderKind::Decrease => &mut self.pending_decrease,
            HedgeOrderKind::Keep => &mut self.pending_keep,
        };
        if *slot == Some(execution.key) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Roll fee watermarks forward, accruing against the pre-update size.
    fn accrue_fees(&mut self, execution: &HedgeExecution) {
        let pre_update_size = self.position.size_in_tokens;

        let funding = saturating_sub(execution.funding_fee_per_size, self.funding_watermark)
            * pre_update_size;
        if funding > Decimal::ZERO {
            self.pending_funding += funding;
            self.position.total_funding_accrued += funding;
            debug!(accrued = %funding, pending = %self.pending_funding, "Funding accrued");
        }
        self.funding_watermark = execution.funding_fee_per_size;

        let borrowing = saturating_sub(execution.borrowing_fee_per_size, self.borrowing_watermark)
            * pre_update_size;
        if borrowing > Decimal::ZERO {
            let paid = borrowing.min(self.position.collateral);
            self.position.collateral -= paid;
            self.position.total_borrowing_paid += paid;
            debug!(paid = %paid, "Borrowing fee deducted from collateral");
        }
        self.borrowing_watermark = execution.borrowing_fee_per_size;
    }

    async fn apply_execution(&mut self, execution: HedgeExecution) -> Option<HedgeCallback> {
        match execution.kind {
            HedgeOrderKind::Keep => Some(self.apply_keep(&execution)),
            HedgeOrderKind::Increase | HedgeOrderKind::Decrease => {
                if execution.status == ExecutionStatus::Cancelled {
                    self.apply_cancellation(&execution)
                } else {
                    self.apply_fill(execution).await
                }
            }
        }
    }

    fn apply_keep(&mut self, execution: &HedgeExecution) -> HedgeCallback {
        if execution.status == ExecutionStatus::Cancelled {
            warn!(key = execution.key, "Keep cancelled by venue");
            return HedgeCallback::Kept {
                claimed: Decimal::ZERO,
                cancelled: true,
            };
        }
        let claimed = std::mem::take(&mut self.pending_funding);
        info!(%claimed, "Funding claimed");
        HedgeCallback::Kept {
            claimed,
            cancelled: false,
        }
    }

    /// A cancelled leg regresses the pending step: a cancelled close
    /// aborts the adjustment (nothing executed), a cancelled re-open
    /// stays at one step remaining and is re-armed for resubmission.
    fn apply_cancellation(&mut self, execution: &HedgeExecution) -> Option<HedgeCallback> {
        match self.decrease_state {
            DecreaseState::TwoStep => {
                warn!(key = execution.key, "Close leg cancelled, aborting decrease");
                self.decrease_state = DecreaseState::Idle;
                let adjustment = self.current.take()?;
                Some(HedgeCallback::Adjusted {
                    requested: adjustment.requested,
                    executed: AdjustmentTotals {
                        size_delta: Decimal::ZERO,
                        collateral_delta: Decimal::ZERO,
                        is_increase: adjustment.requested.is_increase,
                    },
                    cancelled: true,
                })
            }
            DecreaseState::OneStep => {
                warn!(key = execution.key, "Re-open leg cancelled, re-arming");
                let adjustment = self.current.as_ref()?;
                let reopen_size = saturating_sub(
                    adjustment.prior_size,
                    adjustment.requested.size_delta,
                );
                let reopen_collateral = saturating_sub(
                    adjustment.executed_collateral,
                    adjustment.requested.collateral_delta,
                );
                self.resume_order = Some(HedgeOrder {
                    key: 0, // reassigned on resubmission
                    kind: HedgeOrderKind::Increase,
                    size_delta: reopen_size,
                    collateral_delta: reopen_collateral,
                });
                None
            }
            DecreaseState::Idle => {
                warn!(key = execution.key, "Adjustment cancelled by venue");
                let adjustment = self.current.take()?;
                if adjustment.requested.is_increase {
                    // Routed collateral never reached the position; it
                    // stays at the venue for the next posting
                    self.idle_collateral += adjustment.requested.collateral_delta;
                }
                Some(HedgeCallback::Adjusted {
                    requested: adjustment.requested,
                    executed: AdjustmentTotals {
                        size_delta: Decimal::ZERO,
                        collateral_delta: Decimal::ZERO,
                        is_increase: adjustment.requested.is_increase,
                    },
                    cancelled: true,
                })
            }
        }
    }

    async fn apply_fill(&mut self, execution: HedgeExecution) -> Option<HedgeCallback> {
        match (execution.kind, self.decrease_state) {
            // Close leg of a split decrease: realize, then re-open
            (HedgeOrderKind::Decrease, DecreaseState::TwoStep) => {
                self.position.size_in_tokens =
                    saturating_sub(self.position.size_in_tokens, execution.size_delta);
                self.position.collateral =
                    saturating_sub(self.position.collateral, execution.collateral_delta);

                let adjustment = self.current.as_mut()?;
                adjustment.executed_size += execution.size_delta;
                adjustment.executed_collateral += execution.collateral_delta;

                let reopen_size =
                    saturating_sub(adjustment.prior_size, adjustment.requested.size_delta);
                let reopen_collateral = saturating_sub(
                    adjustment.executed_collateral,
                    adjustment.requested.collateral_delta,
                );

                self.decrease_state = DecreaseState::OneStep;
                let key = self.next_key();
                self.pending_increase = Some(key);
                debug!(
                    key,
                    %reopen_size,
                    %reopen_collateral,
                    "Close leg executed, re-opening remainder"
                );
                self.venue
                    .submit(HedgeOrder {
                        key,
                        kind: HedgeOrderKind::Increase,
                        size_delta: reopen_size,
                        collateral_delta: reopen_collateral,
                    })
                    .await;
                None
            }

            // Re-open leg completes the split decrease
            (HedgeOrderKind::Increase, DecreaseState::OneStep) => {
                self.position.size_in_tokens += execution.size_delta;
                self.position.collateral += execution.collateral_delta;
                self.decrease_state = DecreaseState::Idle;

                let mut adjustment = self.current.take()?;
                adjustment.executed_size -= execution.size_delta;
                adjustment.executed_collateral -= execution.collateral_delta;

                Some(HedgeCallback::Adjusted {
                    requested: adjustment.requested,
                    executed: AdjustmentTotals {
                        size_delta: adjustment.executed_size,
                        collateral_delta: adjustment.executed_collateral,
                        is_increase: false,
                    },
                    cancelled: false,
                })
            }

            // Ordinary increase
            (HedgeOrderKind::Increase, _) => {
                self.position.size_in_tokens += execution.size_delta;
                self.position.collateral += execution.collateral_delta;

                let adjustment = self.current.take()?;
                // Collateral routed but not absorbed by a partial fill
                // stays at the venue as idle collateral
                let overage = saturating_sub(
                    adjustment.requested.collateral_delta,
                    execution.collateral_delta,
                );
                self.idle_collateral += overage;

                Some(HedgeCallback::Adjusted {
                    requested: adjustment.requested,
                    executed: AdjustmentTotals {
                        size_delta: execution.size_delta,
                        collateral_delta: execution.collateral_delta,
                        is_increase: true,
                    },
                    cancelled: false,
                })
            }

            // Ordinary decrease
            (HedgeOrderKind::Decrease, _) => {
                self.position.size_in_tokens =
                    saturating_sub(self.position.size_in_tokens, execution.size_delta);
                self.position.collateral =
                    saturating_sub(self.position.collateral, execution.collateral_delta);

                let adjustment = self.current.take()?;
                Some(HedgeCallback::Adjusted {
                    requested: adjustment.requested,
                    executed: AdjustmentTotals {
                        size_delta: execution.size_delta,
                        collateral_delta: execution.collateral_delta,
                        is_increase: false,
                    },
                    cancelled: false,
                })
            }

            // Keep executions are handled before fills
            (HedgeOrderKind::Keep, _) => None,
        }
    }

    /// Drain idle venue collateral for return to the vault.
    pub fn take_idle_collateral(&mut self) -> Decimal {
        std::mem::take(&mut self.idle_collateral)
    }

    /// Restore position state from a persisted snapshot.
    pub fn restore(
        &mut self,
        position: HedgePosition,
        funding_watermark: Decimal,
        borrowing_watermark: Decimal,
        pending_funding: Decimal,
    ) {
        self.position = position;
        self.funding_watermark = funding_watermark;
        self.borrowing_watermark = borrowing_watermark;
        self.pending_funding = pending_funding;
    }
}
