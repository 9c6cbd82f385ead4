mod analytics;
mod config;
mod coord;
mod loader;
mod models;
mod pipeline;
mod provider;
mod sheets;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "market-etl", about = "Stock market data ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Fast quotes for the whole SEC company universe
    LatestPrices,

    /// Fast quotes for the tickers in filtered_tickers.csv (multi-instance safe)
    FilteredPrices,

    /// Last 1-minute close for every ticker, fetched in batches
    PreviousClose,

    /// Full fundamentals for the configured ticker lists
    FullMetrics,

    /// Aggregate full_metrics.csv by industry
    IndustrySummary,

    /// 7 days of 1-minute bars per ticker in latest_prices.csv
    History,

    /// Show snapshot sizes, failure logs, locks and flags
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "market_etl=info,warn",
        1 => "market_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    let label = match &cli.command {
        Command::LatestPrices => "Latest prices",
        Command::FilteredPrices => "Filtered prices",
        Command::PreviousClose => "Previous close",
        Command::FullMetrics => "Full metrics",
        Command::IndustrySummary => "Industry summary",
        Command::History => "Intraday history",
        Command::Status => return print_status(&config),
    };

    let timer = utils::Timer::start(label);
    let mut pipeline = Pipeline::new(config)?;
    let stats = match cli.command {
        Command::LatestPrices => pipeline.latest_prices().await?,
        Command::FilteredPrices => pipeline.filtered_prices().await?,
        Command::PreviousClose => pipeline.previous_close().await?,
        Command::FullMetrics => pipeline.full_metrics().await?,
        Command::IndustrySummary => pipeline.industry_summary()?,
        Command::History => pipeline.history().await?,
        Command::Status => return Ok(()),
    };

    let secs = timer.elapsed().as_secs_f64();
    info!(
        "{} done: {} requested, {} fetched, {} failed, {} rows written ({:.1} tickers/s)",
        label,
        utils::fmt_number(stats.tickers_requested as i64),
        utils::fmt_number(stats.fetched as i64),
        utils::fmt_number(stats.failed as i64),
        utils::fmt_number(stats.rows_written as i64),
        if secs > 0.0 { stats.tickers_requested as f64 / secs } else { 0.0 },
    );

    Ok(())
}

fn print_status(config: &AppConfig) -> Result<()> {
    let report = pipeline::status(config)?;
    println!("─────────────────────────────────");
    println!("  Market ETL Status");
    println!("─────────────────────────────────");
    for (file, rows) in &report.snapshots {
        let rows = rows
            .map(|n| format!("{} rows", utils::fmt_number(n as i64)))
            .unwrap_or_else(|| "-".into());
        println!("  {:<28}: {}", file, rows);
    }
    for (file, count) in &report.failure_logs {
        println!("  {:<28}: {} failed", file, utils::fmt_number(*count as i64));
    }
    println!("  {:<28}: {}", "Active instance locks", report.active_locks);
    println!("  {:<28}: {}", "Flags", report.flags.len());
    for flag in &report.flags {
        println!("    {}", flag);
    }
    println!("─────────────────────────────────");
    Ok(())
}
