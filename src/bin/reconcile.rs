//! Anchoring reconciliation
//!
//! Classifies every UTC day in a range and, with `--fix`, re-batches the days
//! that have no live anchor.
//!
//! Exit codes: 0 clean (or fixed), 1 gaps found without `--fix`, 2 runtime error.

use std::process::ExitCode;

use chrono::{Duration, NaiveDate, Utc};
use clap::Parser;

use mro_ledger::config::Config;
use mro_ledger::infra::{AnchorBatcher, DayStatus, ReceiptStore, ReconcileReport};
use mro_ledger::server::{init_tracing, Stores};

#[derive(Parser)]
#[command(name = "anchoring-reconcile")]
#[command(about = "Find and repair gaps in daily ledger anchors")]
#[command(version)]
struct Cli {
    /// First day to check (default: seven days before --to)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last day to check (default: yesterday, UTC)
    #[arg(long)]
    to: Option<NaiveDate>,

    /// Create anchors for missing and failed days
    #[arg(long)]
    fix: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// SQLite URL (defaults to env DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(report) => {
            if let Err(e) = print_report(&report, cli.json) {
                eprintln!("error: {e:#}");
                return ExitCode::from(2);
            }
            if !cli.fix && report.has_gaps() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Reconciliation failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn date_range(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> anyhow::Result<(NaiveDate, NaiveDate)> {
    let to = to.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
    let from = from.unwrap_or(to - Duration::days(7));
    if from > to {
        anyhow::bail!("--from {from} is after --to {to}");
    }
    Ok((from, to))
}

async fn run(cli: &Cli) -> anyhow::Result<ReconcileReport> {
    let (from, to) = date_range(cli.from, cli.to)?;

    let mut config = Config::from_env()?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    let pool = mro_ledger::infra::sqlite::connect_and_migrate(
        &config.database_url,
        config.max_connections,
    )
    .await?;
    let stores = Stores::sqlite(pool);

    let batcher = AnchorBatcher::new(
        stores.events,
        stores.anchors,
        ReceiptStore::new(&config.receipts_dir),
    );
    let report = batcher.reconcile(from, to, cli.fix).await?;
    tracing::info!(
        %from,
        %to,
        fix = cli.fix,
        fixed = report.fixed,
        gaps = report.has_gaps(),
        "Reconciliation finished"
    );
    Ok(report)
}

fn print_report(report: &ReconcileReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("anchoring reconciliation {} .. {}", report.from, report.to);
    for day in &report.days {
        let mut line = format!("  {}  {:<26}", day.day, day.status.as_str());
        if let Some(id) = day.anchor_id {
            line.push_str(&format!(" anchor={id}"));
        }
        if let Some(tx) = &day.tx_hash {
            line.push_str(&format!(" tx={tx}"));
        }
        if let Some(id) = day.fixed_anchor_id {
            line.push_str(&format!(" fixed_anchor={id}"));
        }
        println!("{line}");
    }
    println!(
        "missing={} receipts_missing={} failed={} fixed={}",
        report.count(DayStatus::Missing),
        report.count(DayStatus::ConfirmedReceiptMissing),
        report.count(DayStatus::Failed),
        report.fixed
    );
    Ok(())
}
