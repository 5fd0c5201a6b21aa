//! Hedge position management.
//!
//! The venue seam ([`HedgeVenue`]) models the external venue's contract:
//! asynchronous order execution with per-order keys and cumulative fee
//! watermarks. The [`HedgePositionManager`] owns the position and all of
//! its venue-side accounting.

mod manager;
mod venue;

pub use manager::{
    AdjustmentTotals, DecreaseState, HedgeCallback, HedgeError, HedgePosition,
    HedgePositionManager,
};
pub use venue::{
    ExecutionStatus, HedgeExecution, HedgeOrder, HedgeOrderKind, HedgeVenue, MockHedgeVenue,
};
