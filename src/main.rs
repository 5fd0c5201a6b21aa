//! Basis Engine - Main Entry Point
//!
//! Simulated strategy sessions against deterministic mock venues, with
//! SQLite-persisted state between runs.

use anyhow::Result;
use basis_engine::config::Config;
use basis_engine::engine::{BasisEngine, EngineSnapshot};
use basis_engine::hedge::MockHedgeVenue;
use basis_engine::oracle::FixedOracle;
use basis_engine::persistence::PersistenceManager;
use basis_engine::spot::MockSpotVenue;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Basis Engine CLI
#[derive(Parser)]
#[command(name = "basis-engine")]
#[command(version, about = "Delta-neutral basis strategy engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated strategy session against mock venues
    Run {
        /// Initial deposit in base-asset units
        #[arg(short, long, default_value = "10000")]
        deposit: f64,

        /// Starting product price
        #[arg(short, long, default_value = "2000")]
        price: f64,

        /// Number of simulation ticks
        #[arg(short, long, default_value = "24")]
        ticks: u32,

        /// Per-tick relative price drift (e.g. 0.02 = +2% per tick)
        #[arg(long, default_value = "0.01")]
        drift: f64,

        /// Per-tick funding accrual per unit of position size
        #[arg(long, default_value = "0.05")]
        funding_rate: f64,

        /// Withdraw this amount halfway through the session
        #[arg(short, long, default_value = "2000")]
        withdraw: f64,

        /// Path to the SQLite state database (overrides config)
        #[arg(long)]
        db: Option<String>,
    },

    /// Show the last persisted engine snapshot
    Status {
        /// Path to the SQLite state database
        #[arg(short, long, default_value = "data/basis_state.db")]
        db: String,

        /// Emit the snapshot as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();
    config.validate()?;

    match cli.command {
        Some(Commands::Run {
            deposit,
            price,
            ticks,
            drift,
            funding_rate,
            withdraw,
            db,
        }) => {
            let db_path = db.unwrap_or_else(|| config.engine.db_path.clone());
            run_session(
                config,
                db_path,
                Decimal::from_f64_retain(deposit).unwrap_or(dec!(10000)),
                Decimal::from_f64_retain(price).unwrap_or(dec!(2000)),
                ticks,
                Decimal::from_f64_retain(drift).unwrap_or(dec!(0.01)),
                Decimal::from_f64_retain(funding_rate).unwrap_or(dec!(0.05)),
                Decimal::from_f64_retain(withdraw).unwrap_or(Decimal::ZERO),
            )
            .await
        }
        Some(Commands::Status { db, json }) => show_status(&db, json),
        None => {
            let db_path = config.engine.db_path.clone();
            run_session(
                config,
                db_path,
                dec!(10000),
                dec!(2000),
                24,
                dec!(0.01),
                dec!(0.05),
                dec!(2000),
            )
            .await
        }
    }
}

/// Drive a full simulated session: deposit, utilize to target, weather
/// price drift through the upkeep loop, service a withdrawal, claim.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    config: Config,
    db_path: String,
    deposit: Decimal,
    start_price: Decimal,
    ticks: u32,
    drift: Decimal,
    funding_rate: Decimal,
    withdraw: Decimal,
) -> Result<()> {
    info!("🚀 Basis Engine starting");
    log_config(&config);

    let product = config.market.product.clone();
    let asset = config.market.asset.clone();
    let poll_interval = Duration::from_millis(config.engine.poll_interval_ms);

    let oracle = Arc::new(FixedOracle::new(asset));
    oracle.set_price(product.clone(), start_price);
    let spot_venue = Arc::new(MockSpotVenue::new(oracle.clone(), product.clone()));
    let hedge_venue = Arc::new(MockHedgeVenue::new());
    let mut engine = BasisEngine::new(
        config,
        oracle.clone(),
        spot_venue.clone(),
        hedge_venue.clone(),
    )?;

    let mut persistence = PersistenceManager::new(&db_path)?;
    if let Some(snapshot) = persistence.load_snapshot()? {
        info!(saved_at = %snapshot.timestamp, "📂 Restoring persisted state");
        engine.restore(snapshot);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let minted = engine.deposit(deposit)?;
    info!(%deposit, shares = %minted, "💰 Deposit accepted");

    let mut price = start_price;
    let withdraw_tick = ticks / 2;
    let mut withdraw_id = None;

    for tick in 0..ticks {
        if shutdown.load(Ordering::SeqCst) {
            warn!("Session interrupted, saving state");
            break;
        }

        // Market moves and funding accrues while we sleep
        price = (price * (Decimal::ONE + drift)).round_dp(8);
        oracle.set_price(product.clone(), price);
        hedge_venue.accrue_funding(funding_rate).await;

        // Put idle capital to work
        let (utilization, deutilization) = engine.pending_utilizations()?;
        if utilization > Decimal::ZERO {
            info!(tick, amount = %utilization, "📈 Utilizing idle capital");
            engine.utilize(utilization).await?;
            settle(&mut engine, &spot_venue, &hedge_venue).await?;
        } else if deutilization > Decimal::ZERO {
            info!(tick, size = %deutilization, "📉 Deutilizing for demand");
            engine.deutilize(deutilization).await?;
            settle(&mut engine, &spot_venue, &hedge_venue).await?;
        }

        // One corrective step per invocation; loop until quiescent
        loop {
            let action = engine.perform_upkeep().await?;
            if action.is_none() {
                break;
            }
            info!(tick, action = ?action, "🔧 Upkeep");
            settle(&mut engine, &spot_venue, &hedge_venue).await?;
        }

        if tick == withdraw_tick && withdraw > Decimal::ZERO {
            let id = engine.request_withdraw(withdraw)?;
            info!(tick, %withdraw, request_id = id, "🏧 Withdrawal requested");
            withdraw_id = Some(id);
        }

        log_status(&engine, tick, price)?;
        persistence.save_snapshot(&engine.snapshot())?;
        tokio::time::sleep(poll_interval).await;
    }

    if let Some(id) = withdraw_id {
        match engine.claim(id) {
            Ok(paid) => info!(request_id = id, %paid, "✅ Withdrawal claimed"),
            Err(e) => warn!(request_id = id, error = %e, "Withdrawal not yet claimable"),
        }
    }

    persistence.save_snapshot(&engine.snapshot())?;
    log_status(&engine, ticks, price)?;
    info!("👋 Basis Engine shutdown complete");
    Ok(())
}

/// Let queued venue work execute and feed the callbacks back in. The
/// spot leg completes first, then the paired hedge leg.
async fn settle(
    engine: &mut BasisEngine,
    spot_venue: &Arc<MockSpotVenue>,
    hedge_venue: &Arc<MockHedgeVenue>,
) -> Result<()> {
    for _ in 0..4 {
        spot_venue.execute_queued().await;
        hedge_venue.execute_queued().await;
        engine.step().await?;
    }
    Ok(())
}

fn show_status(db_path: &str, json: bool) -> Result<()> {
    let persistence = PersistenceManager::new(db_path)?;
    match persistence.load_snapshot()? {
        Some(snapshot) if json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        Some(snapshot) => print_snapshot(&snapshot),
        None => println!("No persisted state at {db_path}"),
    }
    Ok(())
}

fn print_snapshot(snapshot: &EngineSnapshot) {
    println!("📊 Engine State ({})", snapshot.timestamp);
    println!("   ├─ Status:            {:?}", snapshot.status);
    println!(
        "   ├─ Flags:             paused={} stopped={} rebalancing={}",
        snapshot.paused, snapshot.stopped, snapshot.processing_rebalance_down
    );
    println!("   ├─ Idle Assets:       {}", snapshot.idle_assets);
    println!("   ├─ Total Shares:      {}", snapshot.total_shares);
    println!("   ├─ Spot Exposure:     {}", snapshot.spot_exposure);
    println!("   ├─ Hedge Size:        {}", snapshot.hedge_size);
    println!("   ├─ Hedge Collateral:  {}", snapshot.hedge_collateral);
    println!("   ├─ Funding Accrued:   {}", snapshot.total_funding_accrued);
    println!("   ├─ Borrowing Paid:    {}", snapshot.total_borrowing_paid);
    println!(
        "   ├─ Withdrawals:       requested={} processed={} claimed={}",
        snapshot.total_requested, snapshot.total_processed, snapshot.total_claimed
    );
    println!("   └─ Open Requests:     {}", snapshot.withdraw_requests.len());
}

fn log_status(engine: &BasisEngine, tick: u32, price: Decimal) -> Result<()> {
    let leverage = engine.hedge().current_leverage()?;
    let (utilization, deutilization) = engine.pending_utilizations()?;
    info!(
        tick,
        %price,
        idle = %engine.vault().idle_assets(),
        spot = %engine.spot_exposure(),
        hedge = %engine.hedge().position_size_in_tokens(),
        %leverage,
        nav = %engine.total_assets()?,
        pending_utilization = %utilization,
        pending_deutilization = %deutilization,
        funding_accrued = %engine.hedge().position().total_funding_accrued,
        "📊 Tick complete"
    );
    Ok(())
}

/// Initialize comprehensive logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // File appender for detailed logs
    let file_appender = tracing_appender::rolling::hourly("logs", "basis-engine.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("basis_engine=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Market: {} hedged in {}",
        config.market.product, config.market.asset
    );
    info!(
        "   Leverage band: {}x < {}x < {}x (safe margin {}x)",
        config.leverage.min, config.leverage.target, config.leverage.max, config.leverage.safe_margin
    );
    info!(
        "   Hedge deviation threshold: {:.2}%",
        config.thresholds.hedge_deviation * dec!(100)
    );
    info!(
        "   Response deviation threshold: {:.2}%",
        config.thresholds.response_deviation * dec!(100)
    );
    info!(
        "   Venue minimums: size {} / collateral {}",
        config.venue_limits.min_size_delta, config.venue_limits.min_collateral_delta
    );
}
