//! Spot exposure management.
//!
//! The [`SpotExposureManager`] converts between the base asset and the
//! traded product through a [`SpotVenue`]. Swaps are asynchronous: a
//! request is queued on the venue and its fill arrives later as a
//! [`SpotFill`] report authenticated against the single pending swap key.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::oracle::PriceOracle;
use crate::utils::decimal::round_down_to_lot;

/// Spot swap failures.
#[derive(Debug, Error, PartialEq)]
pub enum SpotError {
    #[error("a swap is already pending")]
    SwapPending,
    #[error("zero amount")]
    ZeroAmount,
}

/// Direction of a spot swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapSide {
    /// Spend base asset, receive product
    Buy,
    /// Sell product, receive base asset
    Sell,
}

/// A swap queued on the spot venue. `amount` is the input-side quantity:
/// asset units for a buy, product units for a sell.
#[derive(Debug, Clone)]
pub struct SpotOrder {
    pub key: u64,
    pub side: SwapSide,
    pub amount: Decimal,
}

/// Completed swap report. Deltas are positive magnitudes: a buy spent
/// `asset_delta` and received `product_delta`, a sell the reverse.
/// `requested` is the input-side quantity originally asked for, so the
/// caller can reconcile partial fills.
#[derive(Debug, Clone)]
pub struct SpotFill {
    pub key: u64,
    pub side: SwapSide,
    pub requested: Decimal,
    pub asset_delta: Decimal,
    pub product_delta: Decimal,
}

/// Venue seam for spot execution.
#[async_trait]
pub trait SpotVenue: Send + Sync {
    /// Queue a swap for asynchronous execution.
    async fn submit(&self, order: SpotOrder);

    /// Drain completed fills.
    async fn poll_fills(&self) -> Vec<SpotFill>;
}

/// Owns the spot leg of the strategy: tracked product exposure plus the
/// single-flight pending swap marker.
pub struct SpotExposureManager {
    venue: Arc<dyn SpotVenue>,
    exposure: Decimal,
    pending: Option<SpotOrder>,
    next_key: u64,
}

impl SpotExposureManager {
    pub fn new(venue: Arc<dyn SpotVenue>) -> Self {
        Self {
            venue,
            exposure: Decimal::ZERO,
            pending: None,
            next_key: 1,
        }
    }

    /// Product units currently held.
    pub fn exposure(&self) -> Decimal {
        self.exposure
    }

    /// Whether a swap is in flight.
    pub fn swap_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Queue a buy of `assets` worth of product.
    pub async fn buy(&mut self, assets: Decimal) -> Result<u64, SpotError> {
        self.submit(SwapSide::Buy, assets).await
    }

    /// Queue a sale of `product` units.
    pub async fn sell(&mut self, product: Decimal) -> Result<u64, SpotError> {
        self.submit(SwapSide::Sell, product).await
    }

    async fn submit(&mut self, side: SwapSide, amount: Decimal) -> Result<u64, SpotError> {
        if self.pending.is_some() {
            return Err(SpotError::SwapPending);
        }
        if amount <= Decimal::ZERO {
            return Err(SpotError::ZeroAmount);
        }

        let key = self.next_key;
        self.next_key += 1;
        let order = SpotOrder { key, side, amount };
        self.pending = Some(order.clone());
        debug!(key, side = ?side, %amount, "Spot swap queued");
        self.venue.submit(order).await;
        Ok(key)
    }

    /// Drain venue fills and apply the one matching the pending swap.
    ///
    /// Fills with a stale or unknown key are dropped with a warning; they
    /// were not requested by this manager instance.
    pub async fn poll_completed(&mut self) -> Vec<SpotFill> {
        let mut completed = Vec::new();
        for fill in self.venue.poll_fills().await {
            let authentic = self
                .pending
                .as_ref()
                .map(|order| order.key == fill.key)
                .unwrap_or(false);
            if !authentic {
                warn!(key = fill.key, "Dropping spot fill with unknown key");
                continue;
            }

            match fill.side {
                SwapSide::Buy => self.exposure += fill.product_delta,
                SwapSide::Sell => self.exposure -= fill.product_delta.min(self.exposure),
            }
            debug!(
                key = fill.key,
                side = ?fill.side,
                asset_delta = %fill.asset_delta,
                product_delta = %fill.product_delta,
                exposure = %self.exposure,
                "Spot swap completed"
            );
            self.pending = None;
            completed.push(fill);
        }
        completed
    }

    /// Restore exposure from a persisted snapshot.
    pub fn restore_exposure(&mut self, exposure: Decimal) {
        self.exposure = exposure;
    }
}

/// Deterministic in-process spot venue for tests and simulated sessions.
///
/// Executes queued swaps at the oracle price, scaled by a scriptable fill
/// ratio to exercise partial-execution paths.
pub struct MockSpotVenue {
    oracle: Arc<dyn PriceOracle>,
    product: String,
    lot_size: Decimal,
    state: RwLock<MockSpotState>,
}

#[derive(Default)]
struct MockSpotState {
    queue: Vec<SpotOrder>,
    fills: Vec<SpotFill>,
    fill_ratio: Option<Decimal>,
}

impl MockSpotVenue {
    pub fn new(oracle: Arc<dyn PriceOracle>, product: impl Into<String>) -> Self {
        Self {
            oracle,
            product: product.into(),
            lot_size: Decimal::ZERO,
            state: RwLock::new(MockSpotState::default()),
        }
    }

    /// Execute the next queued swap at `ratio` of its requested amount.
    /// The ratio applies to this one fill only.
    pub async fn set_next_fill_ratio(&self, ratio: Decimal) {
        self.state.write().await.fill_ratio = Some(ratio);
    }

    /// Execute all queued swaps, producing fills for the next poll.
    pub async fn execute_queued(&self) {
        let mut state = self.state.write().await;
        let orders: Vec<SpotOrder> = state.queue.drain(..).collect();
        for order in orders {
            let ratio = state.fill_ratio.take().unwrap_or(Decimal::ONE);
            let filled = order.amount * ratio;
            let price = match self.oracle.price(&self.product) {
                Ok(p) if p > Decimal::ZERO => p,
                _ => {
                    warn!(key = order.key, "No price for product, cancelling swap");
                    continue;
                }
            };

            let (asset_delta, product_delta) = match order.side {
                SwapSide::Buy => (filled, round_down_to_lot(filled / price, self.lot_size)),
                SwapSide::Sell => (filled * price, filled),
            };
            state.fills.push(SpotFill {
                key: order.key,
                side: order.side,
                requested: order.amount,
                asset_delta,
                product_delta,
            });
        }
    }
}

#[async_trait]
impl SpotVenue for MockSpotVenue {
    async fn submit(&self, order: SpotOrder) {
        self.state.write().await.queue.push(order);
    }

    async fn poll_fills(&self) -> Vec<SpotFill> {
        self.state.write().await.fills.drain(..).collect()
    }
}
