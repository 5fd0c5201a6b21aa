//! Price oracle abstraction.
//!
//! The engine never computes prices itself; every conversion between the
//! base asset and the traded product goes through a [`PriceOracle`]. The
//! in-memory [`FixedOracle`] backs the mock venues and the simulated
//! session; a live deployment would wrap a real feed behind the same trait.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Oracle lookup failures.
#[derive(Debug, Error, PartialEq)]
pub enum OracleError {
    #[error("no price for asset {0}")]
    UnknownAsset(String),
}

/// Pure price lookup: prices are quoted in base-asset units per one unit
/// of the queried asset. The base asset itself always prices at 1.
pub trait PriceOracle: Send + Sync {
    /// Price of `asset` in base-asset units.
    fn price(&self, asset: &str) -> Result<Decimal, OracleError>;

    /// Convert `amount` of `from` into units of `to`.
    fn convert(&self, from: &str, to: &str, amount: Decimal) -> Result<Decimal, OracleError> {
        if from == to {
            return Ok(amount);
        }
        let from_price = self.price(from)?;
        let to_price = self.price(to)?;
        if to_price == Decimal::ZERO {
            return Err(OracleError::UnknownAsset(to.to_string()));
        }
        Ok(amount * from_price / to_price)
    }
}

/// In-memory oracle with a mutable price table.
pub struct FixedOracle {
    base_asset: String,
    prices: RwLock<HashMap<String, Decimal>>,
}

impl FixedOracle {
    /// Create an oracle denominated in `base_asset`.
    pub fn new(base_asset: impl Into<String>) -> Self {
        Self {
            base_asset: base_asset.into(),
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Set or update the price of an asset in base-asset units.
    pub fn set_price(&self, asset: impl Into<String>, price: Decimal) {
        self.prices
            .write()
            .expect("oracle price table poisoned")
            .insert(asset.into(), price);
    }
}

impl PriceOracle for FixedOracle {
    fn price(&self, asset: &str) -> Result<Decimal, OracleError> {
        if asset == self.base_asset {
            return Ok(Decimal::ONE);
        }
        self.prices
            .read()
            .expect("oracle price table poisoned")
            .get(asset)
            .copied()
            .ok_or_else(|| OracleError::UnknownAsset(asset.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_base_asset_prices_at_one() {
        let oracle = FixedOracle::new("USDC");
        assert_eq!(oracle.price("USDC"), Ok(Decimal::ONE));
    }

    #[test]
    fn test_unknown_asset_rejected() {
        let oracle = FixedOracle::new("USDC");
        assert_eq!(
            oracle.price("ETH"),
            Err(OracleError::UnknownAsset("ETH".to_string()))
        );
    }

    #[test]
    fn test_convert_between_assets() {
        let oracle = FixedOracle::new("USDC");
        oracle.set_price("ETH", dec!(2000));

        // 3 ETH -> 6000 USDC
        assert_eq!(oracle.convert("ETH", "USDC", dec!(3)), Ok(dec!(6000)));
        // 5000 USDC -> 2.5 ETH
        assert_eq!(oracle.convert("USDC", "ETH", dec!(5000)), Ok(dec!(2.5)));
        // Identity
        assert_eq!(oracle.convert("USDC", "USDC", dec!(7)), Ok(dec!(7)));
    }

    #[test]
    fn test_price_updates_apply() {
        let oracle = FixedOracle::new("USDC");
        oracle.set_price("ETH", dec!(2000));
        oracle.set_price("ETH", dec!(2500));
        assert_eq!(oracle.price("ETH"), Ok(dec!(2500)));
    }
}
