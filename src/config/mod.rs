//! Configuration management for the basis engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Market pair definition
    #[serde(default)]
    pub market: MarketConfig,
    /// Leverage operating band
    #[serde(default)]
    pub leverage: LeverageConfig,
    /// Deviation and drift thresholds
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    /// Hedge venue actionable minimums
    #[serde(default)]
    pub venue_limits: VenueLimitsConfig,
    /// Engine runtime parameters
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Base asset the vault is denominated in
    #[serde(default = "default_asset")]
    pub asset: String,
    /// Traded product held as the spot leg
    #[serde(default = "default_product")]
    pub product: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageConfig {
    /// Leverage the hedge position is steered toward
    #[serde(default = "default_target_leverage")]
    pub target: Decimal,
    /// Below this, collateral is withdrawn back to the vault
    #[serde(default = "default_min_leverage")]
    pub min: Decimal,
    /// Above this, collateral is added from idle capital
    #[serde(default = "default_max_leverage")]
    pub max: Decimal,
    /// Above this, position size is forcibly reduced if idle capital
    /// cannot cover the collateral shortfall
    #[serde(default = "default_safe_margin_leverage")]
    pub safe_margin: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Maximum tolerated |hedge size - spot exposure| / spot exposure
    #[serde(default = "default_hedge_deviation")]
    pub hedge_deviation: Decimal,
    /// Maximum tolerated |executed - requested| / requested on venue fills
    #[serde(default = "default_response_deviation")]
    pub response_deviation: Decimal,
    /// Leverage band around target considered "back at target" when
    /// clearing a rebalance-down
    #[serde(default = "default_leverage_tolerance")]
    pub leverage_tolerance: Decimal,
    /// Minimum claimable funding before a keep is worth issuing
    #[serde(default = "default_min_keep_amount")]
    pub min_keep_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueLimitsConfig {
    /// Smallest actionable size delta, in product units
    #[serde(default = "default_min_size_delta")]
    pub min_size_delta: Decimal,
    /// Smallest actionable collateral delta, in asset units
    #[serde(default = "default_min_collateral_delta")]
    pub min_collateral_delta: Decimal,
    /// Maximum leverage the venue itself will hold a position at; bounds
    /// how much collateral a decrease may withdraw without realizing PnL
    #[serde(default = "default_venue_max_leverage")]
    pub venue_max_leverage: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the SQLite snapshot database
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Milliseconds between venue report drains in the session runner
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_asset() -> String {
    "USDC".to_string()
}

fn default_product() -> String {
    "ETH".to_string()
}

fn default_target_leverage() -> Decimal {
    Decimal::new(3, 0) // 3x
}

fn default_min_leverage() -> Decimal {
    Decimal::new(2, 0) // 2x
}

fn default_max_leverage() -> Decimal {
    Decimal::new(5, 0) // 5x
}

fn default_safe_margin_leverage() -> Decimal {
    Decimal::new(20, 0) // 20x
}

fn default_hedge_deviation() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2%)
}

fn default_response_deviation() -> Decimal {
    Decimal::new(1, 2) // 0.01 (1%)
}

fn default_leverage_tolerance() -> Decimal {
    Decimal::new(25, 2) // 0.25x band around target
}

fn default_min_keep_amount() -> Decimal {
    Decimal::new(1, 0) // 1 asset unit
}

fn default_min_size_delta() -> Decimal {
    Decimal::new(1, 2) // 0.01 product units
}

fn default_min_collateral_delta() -> Decimal {
    Decimal::new(10, 0) // 10 asset units
}

fn default_venue_max_leverage() -> Decimal {
    Decimal::new(50, 0) // 50x hard venue cap
}

fn default_db_path() -> String {
    "data/basis_state.db".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BASIS"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.leverage.min > Decimal::ZERO,
            "min leverage must be positive"
        );

        // The operating band must be strictly ordered, the safety margin on top
        anyhow::ensure!(
            self.leverage.min < self.leverage.target
                && self.leverage.target < self.leverage.max
                && self.leverage.max < self.leverage.safe_margin,
            "leverage bounds must satisfy min < target < max < safe_margin"
        );

        anyhow::ensure!(
            self.thresholds.hedge_deviation > Decimal::ZERO
                && self.thresholds.hedge_deviation < Decimal::ONE,
            "hedge_deviation must be between 0 and 1"
        );

        anyhow::ensure!(
            self.thresholds.response_deviation > Decimal::ZERO
                && self.thresholds.response_deviation < Decimal::ONE,
            "response_deviation must be between 0 and 1"
        );

        anyhow::ensure!(
            self.venue_limits.min_size_delta > Decimal::ZERO,
            "min_size_delta must be positive"
        );

        anyhow::ensure!(
            self.venue_limits.venue_max_leverage > self.leverage.safe_margin,
            "venue_max_leverage must exceed safe_margin leverage"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            market: MarketConfig::default(),
            leverage: LeverageConfig::default(),
            thresholds: ThresholdConfig::default(),
            venue_limits: VenueLimitsConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            asset: default_asset(),
            product: default_product(),
        }
    }
}

impl Default for LeverageConfig {
    fn default() -> Self {
        Self {
            target: default_target_leverage(),
            min: default_min_leverage(),
            max: default_max_leverage(),
            safe_margin: default_safe_margin_leverage(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            hedge_deviation: default_hedge_deviation(),
            response_deviation: default_response_deviation(),
            leverage_tolerance: default_leverage_tolerance(),
            min_keep_amount: default_min_keep_amount(),
        }
    }
}

impl Default for VenueLimitsConfig {
    fn default() -> Self {
        Self {
            min_size_delta: default_min_size_delta(),
            min_collateral_delta: default_min_collateral_delta(),
            venue_max_leverage: default_venue_max_leverage(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}
