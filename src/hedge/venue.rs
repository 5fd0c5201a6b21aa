//! Hedge venue seam: order submission and asynchronous execution reports.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

/// What a hedge order does to the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeOrderKind {
    /// Grow size and/or post collateral
    Increase,
    /// Shrink size and/or withdraw collateral
    Decrease,
    /// Claim accrued funding without touching size
    Keep,
}

/// An order queued on the hedge venue.
#[derive(Debug, Clone)]
pub struct HedgeOrder {
    pub key: u64,
    pub kind: HedgeOrderKind,
    /// Product units to add/remove from the position
    pub size_delta: Decimal,
    /// Asset units to post/withdraw
    pub collateral_delta: Decimal,
}

/// Terminal state of a venue-side order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Executed,
    Cancelled,
}

/// Completion report for a hedge order.
///
/// Carries the venue's cumulative fee watermarks at execution time; the
/// position manager turns watermark deltas into accrued fee amounts.
#[derive(Debug, Clone)]
pub struct HedgeExecution {
    pub key: u64,
    pub kind: HedgeOrderKind,
    pub status: ExecutionStatus,
    /// Size actually executed (zero when cancelled)
    pub size_delta: Decimal,
    /// Collateral actually moved (zero when cancelled)
    pub collateral_delta: Decimal,
    /// Cumulative funding fee per unit of position size
    pub funding_fee_per_size: Decimal,
    /// Cumulative borrowing fee per unit of position size
    pub borrowing_fee_per_size: Decimal,
}

/// External hedge-position venue.
#[async_trait]
pub trait HedgeVenue: Send + Sync {
    /// Queue an order for asynchronous execution.
    async fn submit(&self, order: HedgeOrder);

    /// Drain completion reports.
    async fn poll_executions(&self) -> Vec<HedgeExecution>;
}

#[derive(Default)]
struct MockHedgeState {
    queue: Vec<HedgeOrder>,
    executions: Vec<HedgeExecution>,
    fill_ratio: Option<Decimal>,
    cancel_next: bool,
    funding_fee_per_size: Decimal,
    borrowing_fee_per_size: Decimal,
}

/// Deterministic in-process hedge venue.
///
/// Fills at a scriptable ratio of the requested deltas, supports forced
/// cancellation of the next order, and accrues funding/borrowing fee
/// watermarks on demand so fee-accounting paths can be exercised.
pub struct MockHedgeVenue {
    state: RwLock<MockHedgeState>,
}

impl MockHedgeVenue {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockHedgeState::default()),
        }
    }

    /// Scale the next execution's deltas by `ratio` (one-shot).
    pub async fn set_next_fill_ratio(&self, ratio: Decimal) {
        self.state.write().await.fill_ratio = Some(ratio);
    }

    /// Cancel the next queued order instead of executing it (one-shot).
    pub async fn set_cancel_next(&self) {
        self.state.write().await.cancel_next = true;
    }

    /// Advance the cumulative funding watermark.
    pub async fn accrue_funding(&self, per_size: Decimal) {
        self.state.write().await.funding_fee_per_size += per_size;
    }

    /// Advance the cumulative borrowing watermark.
    pub async fn accrue_borrowing(&self, per_size: Decimal) {
        self.state.write().await.borrowing_fee_per_size += per_size;
    }

    /// Execute all queued orders, producing reports for the next poll.
    pub async fn execute_queued(&self) {
        let mut state = self.state.write().await;
        let orders: Vec<HedgeOrder> = state.queue.drain(..).collect();
        for order in orders {
            let cancelled = std::mem::take(&mut state.cancel_next);
            let ratio = if cancelled {
                Decimal::ZERO
            } else {
                state.fill_ratio.take().unwrap_or(Decimal::ONE)
            };

            let funding_fee_per_size = state.funding_fee_per_size;
            let borrowing_fee_per_size = state.borrowing_fee_per_size;
            state.executions.push(HedgeExecution {
                key: order.key,
                kind: order.kind,
                status: if cancelled {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Executed
                },
                size_delta: order.size_delta * ratio,
                collateral_delta: order.collateral_delta * ratio,
                funding_fee_per_size,
                borrowing_fee_per_size,
            });
        }
    }

}

impl Default for MockHedgeVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HedgeVenue for MockHedgeVenue {
    async fn submit(&self, order: HedgeOrder) {
        self.state.write().await.queue.push(order);
    }

    async fn poll_executions(&self) -> Vec<HedgeExecution> {
        self.state.write().await.executions.drain(..).collect()
    }
}
