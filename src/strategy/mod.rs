//! Strategy control logic.
//!
//! Contains the core decision-making for the basis strategy:
//! - Capital movement state machine (utilize/deutilize/keep)
//! - Reconciliation of executed venue results against requests
//! - Pull-based upkeep loop for leverage, drift and fee maintenance

mod controller;
mod upkeep;

pub use controller::{
    ControllerError, DeutilizeKind, HedgeCommand, PositionView, ReconcileOutcome, SpotCommand,
    StrategyController, StrategyStatus,
};
pub use upkeep::UpkeepAction;
