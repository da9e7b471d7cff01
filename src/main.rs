//! Martingale-ladder trading bot
//!
//! Validates session configs, replays recorded ticks through a paper
//! session, and reports drawdown-based metrics for equity curves.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ladder_engine::execution::PaperBroker;
use ladder_engine::metrics::MetricsReport;
use ladder_engine::trading::{MarketTick, SessionConfig, TradingSession};

/// Martingale-ladder trading bot CLI.
#[derive(Parser)]
#[command(name = "ladderbot")]
#[command(about = "Run martingale ladder strategies with dynamic position sizing", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LADDER_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a session config
    Validate {
        /// Session config JSON file
        #[arg(short, long, env = "LADDER_CONFIG")]
        config: PathBuf,
    },

    /// Replay recorded ticks through a paper trading session
    Replay {
        /// Session config JSON file
        #[arg(short, long, env = "LADDER_CONFIG")]
        config: PathBuf,

        /// Tick file: JSON array of {symbol, price, timestamp}
        #[arg(short, long)]
        ticks: PathBuf,
    },

    /// Report drawdown-based metrics for an equity curve
    Metrics {
        /// JSON array of equity values
        #[arg(short, long)]
        equity: PathBuf,

        /// Annual risk-free rate
        #[arg(long, default_value = "0.0")]
        risk_free_rate: f64,
    },
}

fn load_config(path: &Path) -> Result<SessionConfig> {
    SessionConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_config(config: &SessionConfig) {
    let sizing = &config.sizing;
    let guard = &config.guard;

    println!("\n=== Session Configuration ===\n");
    println!("Account Balance:        ${}", config.account_balance);
    println!("Risk-Free Rate:         {:.2}%", config.risk_free_rate * 100.0);

    println!("\nPosition Sizing:");
    println!("  Method:               {}", sizing.method.as_str());
    println!("  Base Allocation:      {}%", sizing.base_allocation * Decimal::ONE_HUNDRED);
    println!("  Min Allocation:       {}%", sizing.min_allocation * Decimal::ONE_HUNDRED);
    println!("  Max Allocation:       {}%", sizing.max_allocation * Decimal::ONE_HUNDRED);
    println!("  Target Volatility:    {}", sizing.target_volatility);
    println!("  Kelly Fraction:       {}", sizing.kelly_fraction);

    println!("\nSession Guard:");
    println!("  Max Open Cycles:      {}", guard.max_concurrent_cycles);
    println!("  Daily Limits:         {}", guard.enable_daily_limits);
    println!("  Daily Loss Limit:     ${}", guard.daily_loss_limit);
    println!("  Emergency Exit:       {}", guard.enable_emergency_exit);
    println!("  Emergency Loss:       ${}", guard.emergency_loss_threshold);
    println!("  Emergency Drawdown:   {}%", guard.emergency_drawdown_threshold);

    println!(
        "\n{:<20} {:>8} {:>6} {:>10} {:>8}  {}",
        "STRATEGY", "ALLOC", "LEGS", "TRIGGER", "TRAIL", "TAKE PROFIT"
    );
    println!("{}", "-".repeat(72));
    for strategy in &config.strategies {
        let trigger = strategy
            .price_trigger
            .or(strategy.zone_center_price)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let tps: Vec<String> = strategy.order_tps.iter().map(|tp| format!("{}%", tp)).collect();
        println!(
            "{:<20} {:>7}% {:>6} {:>10} {:>8}  {}{}",
            strategy.id().to_string(),
            strategy.capital_allocation * Decimal::ONE_HUNDRED,
            strategy.max_orders,
            trigger,
            strategy.trailing_stops,
            tps.join(", "),
            if strategy.enabled { "" } else { "  (disabled)" }
        );
    }
}

async fn replay(config: SessionConfig, ticks_path: &Path) -> Result<()> {
    let mut ticks: Vec<MarketTick> = read_json(ticks_path)?;
    if ticks.is_empty() {
        bail!("No ticks in {}", ticks_path.display());
    }
    ticks.sort_by_key(|t| t.timestamp);

    let session = TradingSession::new(config, Arc::new(PaperBroker::new()))?;
    info!(ticks = ticks.len(), "Replaying ticks");

    let outcome = session.process_ticks(&ticks).await;
    info!(
        closed = outcome.closed.len(),
        placed = outcome.orders_placed,
        failed = outcome.orders_failed,
        "Replay complete"
    );

    let cycles = session.completed_cycles().await;
    println!("\n=== Completed Cycles ({}) ===\n", cycles.len());
    if !cycles.is_empty() {
        println!(
            "{:<20} {:<13} {:>5} {:>12} {:>12} {:>12} {:>8}",
            "STRATEGY", "EXIT", "LEGS", "AVG COST", "EXIT PRICE", "P&L", "RETURN"
        );
        println!("{}", "-".repeat(88));
        for cycle in &cycles {
            println!(
                "{:<20} {:<13} {:>5} {:>12.4} {:>12.4} {:>12.2} {:>7.2}%",
                cycle.strategy.to_string(),
                format!("{:?}", cycle.reason),
                cycle.legs_filled,
                cycle.avg_cost,
                cycle.exit_price,
                cycle.realized_pnl,
                cycle.return_pct * 100.0
            );
        }
    }

    println!("\n=== Open Cycles ===\n");
    let mut open = 0;
    let symbols: Vec<String> = session.symbols().map(str::to_string).collect();
    for symbol in &symbols {
        for status in session.cycle_status(symbol).await {
            println!("{}", status);
            open += 1;
        }
    }
    if open == 0 {
        println!("None");
    }

    println!("\n=== Allocation ===\n");
    for id in session.strategy_ids() {
        if let Some(allocation) = session.recommended_allocation(&id) {
            let metrics = session.tracker().metrics(&id);
            println!(
                "{:<20} recommended {:>6.2}%  win rate {:>5.1}%  trades {}",
                id.to_string(),
                allocation * Decimal::ONE_HUNDRED,
                metrics.win_rate * 100.0,
                metrics.trade_count
            );
        }
    }

    println!("\n=== Risk ===\n");
    println!("{}", session.risk_summary());

    println!("\n=== Session ===\n");
    println!("Starting Balance: ${:.2}", session.config().account_balance);
    println!("Realized P&L:     ${:.2}", session.realized_pnl());
    println!("Balance:          ${:.2}", session.account_balance());
    println!("\n{}", session.metrics_report());

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Validate { config } => {
            let session_config = load_config(&config)?;
            info!(
                path = %config.display(),
                strategies = session_config.strategies.len(),
                "Config valid"
            );
            print_config(&session_config);
        }

        Commands::Replay { config, ticks } => {
            let session_config = load_config(&config)?;
            replay(session_config, &ticks).await?;
        }

        Commands::Metrics {
            equity,
            risk_free_rate,
        } => {
            let curve: Vec<f64> = read_json(&equity)?;
            if curve.len() < 2 {
                bail!("Need at least 2 equity points, got {}", curve.len());
            }
            println!("\n=== Metrics ({} points) ===\n", curve.len());
            println!("{}", MetricsReport::from_equity_curve(&curve, risk_free_rate));
        }
    }

    Ok(())
}
