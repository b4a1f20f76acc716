//! `condor` command line.
//!
//! Output is a human-readable table by default and JSON with `--json`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::domain::{CondorStructure, Position};
use crate::exchange::build_gateway;
use crate::services::{JsonInboxSource, Scheduler};
use crate::strategy::{compute_position_size, CondorEngine, OpenOutcome, PortfolioSummary};
use crate::supervisor::{AlertLevel, AlertManager};

#[derive(Parser, Debug)]
#[command(name = "condor")]
#[command(version)]
#[command(about = "Iron condor position lifecycle engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml, $CONDOR_ENV.toml)
    #[arg(short, long, global = true, default_value = "config")]
    pub config: PathBuf,

    /// Force paper trading regardless of configuration
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Reconcile, then run the open and monitor triggers until stopped
    Run,
    /// Try to open one structure now
    Open {
        /// Candidate structure as JSON
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Run one monitoring cycle now
    Monitor,
    /// Show open and flagged positions with the portfolio summary
    Status,
    /// Match tracked positions against the exchange
    Reconcile,
    /// Confirm a flagged position is flat and release its risk
    ConfirmFlat {
        position_id: String,
    },
    /// Position sizing calculator
    Size {
        #[arg(long)]
        equity: Decimal,
        #[arg(long)]
        max_loss_per_unit: Decimal,
        /// Risk fraction per trade (defaults to risk.risk_per_trade)
        #[arg(long)]
        risk: Option<Decimal>,
    },
    /// Validate and print the effective configuration
    CheckConfig,
}

#[derive(Debug, Serialize, Tabled)]
pub struct PositionRow {
    pub id: String,
    pub currency: String,
    pub expiry: String,
    pub quantity: String,
    pub entry_credit: String,
    pub max_loss: String,
    pub state: String,
    pub stuck: String,
}

impl From<&Position> for PositionRow {
    fn from(p: &Position) -> Self {
        Self {
            id: p.id.clone(),
            currency: p.currency.clone(),
            expiry: p.expiration.format("%Y-%m-%d %H:%M").to_string(),
            quantity: p.quantity.to_string(),
            entry_credit: p.entry_credit.round_dp(2).to_string(),
            max_loss: p.max_loss.round_dp(2).to_string(),
            state: p.state.to_string(),
            stuck: p.stuck_instruments.join(", "),
        }
    }
}

fn print_json<T: Serialize>(item: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}

fn print_rows(title: &str, positions: &[Position]) {
    println!("{title}");
    if positions.is_empty() {
        println!("(none)");
    } else {
        let rows: Vec<PositionRow> = positions.iter().map(PositionRow::from).collect();
        println!("{}", Table::new(rows));
    }
}

fn print_summary(summary: &PortfolioSummary) {
    println!("Open positions:      {}", summary.open_count);
    println!("Flagged positions:   {}", summary.flagged_count);
    println!("Committed risk:      {}", summary.total_committed_risk.round_dp(2));
    println!("Aggregate P&L:       {}", summary.aggregate_pnl.round_dp(2));
    if summary.unpriced > 0 {
        println!("Unpriced positions:  {}", summary.unpriced);
    }
    if let Some(equity) = summary.equity {
        println!("Equity (last read):  {}", equity.round_dp(2));
    }
}

/// Load, apply CLI overrides, validate
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if cli.dry_run {
        config.dry_run = true;
    }
    if let Err(errors) = config.validate() {
        bail!("invalid configuration:\n  - {}", errors.join("\n  - "));
    }
    Ok(config)
}

fn build_engine(config: AppConfig) -> anyhow::Result<Arc<CondorEngine>> {
    let gateway = build_gateway(&config)?;
    info!(
        gateway = gateway.name(),
        dry_run = config.dry_run,
        settlement = ?config.exchange.settlement,
        "engine starting"
    );
    let alerts = Arc::new(AlertManager::with_defaults());
    Ok(Arc::new(CondorEngine::new(config, gateway, alerts)))
}

fn read_structure(path: &Path) -> anyhow::Result<CondorStructure> {
    let body = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let structure = serde_json::from_str(&body).with_context(|| format!("parsing {}", path.display()))?;
    Ok(structure)
}

/// Commands that need an engine
pub async fn dispatch(cli: &Cli, config: AppConfig) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Run => run(config).await,
        Commands::Open { file } => {
            let structure = read_structure(file)?;
            let engine = build_engine(config)?;
            engine.reconcile().await?;
            match engine.try_open(&structure).await? {
                OpenOutcome::Opened(position) => {
                    if cli.json {
                        print_json(&position)?;
                    } else {
                        print_rows("Opened", std::slice::from_ref(&position));
                    }
                }
                OpenOutcome::Rejected(reason) => println!("Rejected: {reason}"),
                OpenOutcome::Aborted {
                    position_id,
                    failing_leg_index,
                    reason,
                } => println!("Aborted {position_id} at leg {failing_leg_index}: {reason}"),
            }
            Ok(())
        }
        Commands::Monitor => {
            let engine = build_engine(config)?;
            engine.reconcile().await?;
            let closed = engine.run_monitoring_cycle(chrono::Utc::now()).await;
            if cli.json {
                print_json(&closed)?;
            } else if closed.is_empty() {
                println!("No exits triggered");
            } else {
                for event in &closed {
                    println!(
                        "{} closed: {} (realized {})",
                        event.position_id,
                        event.reason,
                        event
                            .realized_pnl
                            .map(|p| p.round_dp(2).to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    );
                }
            }
            Ok(())
        }
        Commands::Status => {
            let engine = build_engine(config)?;
            engine.load_persisted().await?;
            let summary = engine.portfolio_summary().await;
            let snapshot = engine.snapshot().await;
            if cli.json {
                print_json(&serde_json::json!({ "summary": summary, "positions": snapshot }))?;
            } else {
                print_rows("Open", &snapshot.open);
                print_rows("Awaiting manual intervention", &snapshot.flagged);
                print_summary(&summary);
                if let Some(reason) = snapshot.halt_reason {
                    println!("New trades halted:   {reason}");
                }
            }
            Ok(())
        }
        Commands::Reconcile => {
            let engine = build_engine(config)?;
            let report = engine.reconcile().await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("Restored:     {}", report.restored.join(", "));
                println!("Dropped:      {}", report.dropped.join(", "));
                println!("Flagged:      {}", report.flagged.join(", "));
                println!("Cleared:      {}", report.cleared.join(", "));
                println!("Still stuck:  {}", report.still_stuck.join(", "));
                for orphan in &report.orphans {
                    println!("ORPHAN {} size {}", orphan.instrument, orphan.size);
                }
            }
            Ok(())
        }
        Commands::ConfirmFlat { position_id } => {
            let engine = build_engine(config)?;
            engine.load_persisted().await?;
            let released = engine.confirm_flat(position_id).await?;
            println!("{position_id} confirmed flat, released {released}");
            Ok(())
        }
        Commands::Size { .. } | Commands::CheckConfig => {
            bail!("command does not need an engine")
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let inbox = JsonInboxSource::new(config.state.inbox_dir.clone());
    let schedule = config.schedule.clone();
    let engine = build_engine(config)?;

    // Echo serious alerts on stderr for whoever is watching the terminal.
    let mut alerts = engine.alerts().subscribe();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            if alert.level >= AlertLevel::Error {
                eprintln!("{}", alert.format_line());
            }
        }
    });

    let loaded = engine.load_persisted().await?;
    let report = engine
        .reconcile()
        .await
        .context("startup reconciliation failed; refusing to trade on unverified state")?;
    info!(
        loaded,
        restored = report.restored.len(),
        flagged = report.flagged.len(),
        orphans = report.orphans.len(),
        "startup reconciliation done"
    );

    let scheduler = Scheduler::new(engine.clone(), Arc::new(inbox), &schedule);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown requested; finishing the current cycle");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;

    let snapshot = engine.snapshot().await;
    if !snapshot.flagged.is_empty() {
        warn!(
            flagged = snapshot.flagged.len(),
            "stopping with positions awaiting manual intervention"
        );
    }
    info!(open = snapshot.open.len(), "condor stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub fn size(cli: &Cli, equity: Decimal, max_loss_per_unit: Decimal, risk: Option<Decimal>) -> anyhow::Result<()> {
    let config = AppConfig::load_from(&cli.config).unwrap_or_default();
    let fraction = risk.unwrap_or(config.risk.risk_per_trade);
    let quantity = compute_position_size(
        max_loss_per_unit,
        fraction,
        equity,
        config.risk.contract_increment,
        config.risk.min_contract_size,
        config.risk.max_contract_size,
    )?;
    if cli.json {
        print_json(&serde_json::json!({
            "equity": equity,
            "risk_fraction": fraction,
            "max_loss_per_unit": max_loss_per_unit,
            "quantity": quantity,
            "max_loss": quantity * max_loss_per_unit,
        }))?;
    } else {
        println!("Quantity:   {quantity}");
        println!("Max loss:   {}", (quantity * max_loss_per_unit).round_dp(2));
        println!("Risk:       {fraction} of {equity}");
    }
    Ok(())
}

pub fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    if cli.json {
        print_json(&config)?;
    } else {
        println!("Configuration OK ({})", cli.config.display());
        println!("{}", toml_like(&serde_json::to_value(&config)?, ""));
    }
    Ok(())
}

/// Flatten nested JSON into `section.key = value` lines
fn toml_like(value: &serde_json::Value, prefix: &str) -> String {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                toml_like(v, &key)
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        other => format!("{prefix} = {other}"),
    }
}
