//! # Basis Engine
//!
//! A delta-neutral basis strategy engine: depositor capital is split
//! between a spot long and an offsetting short on a hedge venue,
//! harvesting the funding spread while net price risk stays near zero.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `oracle`: Price lookup abstraction
//! - `vault`: Depositor shares, idle capital and the withdrawal queue
//! - `spot`: Spot exposure management and venue seam
//! - `hedge`: Hedge position management, venue seam and fee accounting
//! - `strategy`: Capital-movement state machine and upkeep control loop
//! - `engine`: Component wiring and callback routing
//! - `persistence`: SQLite snapshots of engine state
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod engine;
pub mod hedge;
pub mod oracle;
pub mod persistence;
pub mod spot;
pub mod strategy;
pub mod utils;
pub mod vault;

pub use config::Config;
pub use engine::BasisEngine;
