//! SQLite persistence for engine state.
//!
//! Persists strategy state to survive restarts:
//! - Controller status flags (pause/stop/rebalance-down)
//! - Vault balances and withdrawal queue accounting
//! - Hedge position, fee watermarks and unclaimed funding
//!
//! In-flight venue orders are deliberately not persisted; a restarted
//! engine reconciles whatever drift they left behind through the upkeep
//! loop.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::engine::EngineSnapshot;
use crate::strategy::StrategyStatus;
use crate::vault::WithdrawRequest;

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

fn status_to_str(status: StrategyStatus) -> &'static str {
    match status {
        StrategyStatus::Idle => "idle",
        StrategyStatus::Utilizing => "utilizing",
        StrategyStatus::Deutilizing => "deutilizing",
        StrategyStatus::AwaitingFinalDeutilization => "awaiting_final_deutilization",
        StrategyStatus::Keeping => "keeping",
    }
}

fn status_from_str(s: &str) -> StrategyStatus {
    match s {
        "utilizing" => StrategyStatus::Utilizing,
        "deutilizing" => StrategyStatus::Deutilizing,
        "awaiting_final_deutilization" => StrategyStatus::AwaitingFinalDeutilization,
        "keeping" => StrategyStatus::Keeping,
        _ => StrategyStatus::Idle,
    }
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

impl PersistenceManager {
    /// Create a new persistence manager, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let manager = Self { conn };
        manager.init_schema()?;
        Ok(manager)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            -- Engine state (singleton row)
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                saved_at TEXT NOT NULL,
                status TEXT NOT NULL,
                paused INTEGER NOT NULL,
                stopped INTEGER NOT NULL,
                processing_rebalance_down INTEGER NOT NULL,
                idle_assets TEXT NOT NULL,
                total_shares TEXT NOT NULL,
                total_requested TEXT NOT NULL,
                total_processed TEXT NOT NULL,
                total_claimed TEXT NOT NULL,
                spot_exposure TEXT NOT NULL,
                hedge_size TEXT NOT NULL,
                hedge_collateral TEXT NOT NULL,
                total_funding_accrued TEXT NOT NULL,
                total_borrowing_paid TEXT NOT NULL,
                pending_funding TEXT NOT NULL,
                funding_watermark TEXT NOT NULL,
                borrowing_watermark TEXT NOT NULL
            );

            -- Withdrawal queue
            CREATE TABLE IF NOT EXISTS withdraw_requests (
                id INTEGER PRIMARY KEY,
                requested TEXT NOT NULL,
                watermark TEXT NOT NULL,
                claimed TEXT NOT NULL,
                done INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
            )
            .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Save a full engine snapshot, replacing the previous one.
    pub fn save_snapshot(&mut self, snapshot: &EngineSnapshot) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to open transaction")?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO engine_state (
                id, saved_at, status, paused, stopped, processing_rebalance_down,
                idle_assets, total_shares, total_requested, total_processed,
                total_claimed, spot_exposure, hedge_size, hedge_collateral,
                total_funding_accrued, total_borrowing_paid, pending_funding,
                funding_watermark, borrowing_watermark
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                snapshot.timestamp.to_rfc3339(),
                status_to_str(snapshot.status),
                snapshot.paused as i64,
                snapshot.stopped as i64,
                snapshot.processing_rebalance_down as i64,
                snapshot.idle_assets.to_string(),
                snapshot.total_shares.to_string(),
                snapshot.total_requested.to_string(),
                snapshot.total_processed.to_string(),
                snapshot.total_claimed.to_string(),
                snapshot.spot_exposure.to_string(),
                snapshot.hedge_size.to_string(),
                snapshot.hedge_collateral.to_string(),
                snapshot.total_funding_accrued.to_string(),
                snapshot.total_borrowing_paid.to_string(),
                snapshot.pending_funding.to_string(),
                snapshot.funding_watermark.to_string(),
                snapshot.borrowing_watermark.to_string(),
            ],
        )
        .context("Failed to save engine state")?;

        tx.execute("DELETE FROM withdraw_requests", [])
            .context("Failed to clear withdraw requests")?;
        for request in &snapshot.withdraw_requests {
            tx.execute(
                r#"
                INSERT INTO withdraw_requests (id, requested, watermark, claimed, done, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    request.id as i64,
                    request.requested.to_string(),
                    request.watermark.to_string(),
                    request.claimed.to_string(),
                    request.done as i64,
                    request.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to save withdraw request")?;
        }

        tx.commit().context("Failed to commit snapshot")?;
        debug!("Engine snapshot saved");
        Ok(())
    }

    /// Load the last saved snapshot, if any.
    pub fn load_snapshot(&self) -> Result<Option<EngineSnapshot>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT saved_at, status, paused, stopped, processing_rebalance_down,
                       idle_assets, total_shares, total_requested, total_processed,
                       total_claimed, spot_exposure, hedge_size, hedge_collateral,
                       total_funding_accrued, total_borrowing_paid, pending_funding,
                       funding_watermark, borrowing_watermark
                FROM engine_state WHERE id = 1
                "#,
                [],
                |row| {
                    Ok(EngineSnapshot {
                        timestamp: row
                            .get::<_, String>(0)?
                            .parse::<DateTime<Utc>>()
                            .unwrap_or_else(|_| Utc::now()),
                        status: status_from_str(&row.get::<_, String>(1)?),
                        paused: row.get::<_, i64>(2)? != 0,
                        stopped: row.get::<_, i64>(3)? != 0,
                        processing_rebalance_down: row.get::<_, i64>(4)? != 0,
                        idle_assets: parse_decimal(&row.get::<_, String>(5)?),
                        total_shares: parse_decimal(&row.get::<_, String>(6)?),
                        total_requested: parse_decimal(&row.get::<_, String>(7)?),
                        total_processed: parse_decimal(&row.get::<_, String>(8)?),
                        total_claimed: parse_decimal(&row.get::<_, String>(9)?),
                        spot_exposure: parse_decimal(&row.get::<_, String>(10)?),
                        hedge_size: parse_decimal(&row.get::<_, String>(11)?),
                        hedge_collateral: parse_decimal(&row.get::<_, String>(12)?),
                        total_funding_accrued: parse_decimal(&row.get::<_, String>(13)?),
                        total_borrowing_paid: parse_decimal(&row.get::<_, String>(14)?),
                        pending_funding: parse_decimal(&row.get::<_, String>(15)?),
                        funding_watermark: parse_decimal(&row.get::<_, String>(16)?),
                        borrowing_watermark: parse_decimal(&row.get::<_, String>(17)?),
                        withdraw_requests: Vec::new(),
                    })
                },
            )
            .optional()
            .context("Failed to load engine state")?;

        let Some(mut snapshot) = row else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, requested, watermark, claimed, done, created_at
                 FROM withdraw_requests ORDER BY id",
            )
            .context("Failed to prepare withdraw query")?;
        let requests = stmt
            .query_map([], |row| {
                Ok(WithdrawRequest {
                    id: row.get::<_, i64>(0)? as u64,
                    requested: parse_decimal(&row.get::<_, String>(1)?),
                    watermark: parse_decimal(&row.get::<_, String>(2)?),
                    claimed: parse_decimal(&row.get::<_, String>(3)?),
                    done: row.get::<_, i64>(4)? != 0,
                    created_at: row
                        .get::<_, String>(5)?
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .context("Failed to query withdraw requests")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read withdraw requests")?;
        snapshot.withdraw_requests = requests;

        Ok(Some(snapshot))
    }
}
