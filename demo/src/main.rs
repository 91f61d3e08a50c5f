//! WARDEN Governance Network — Demo CLI
//!
//! Runs a small scout → watchdog → enforcer network on one message bus with
//! an auditor keeping the centralized compliance chain, or demonstrates
//! tamper detection on an exported audit trail.
//!
//! Usage:
//!   cargo run -p demo -- run
//!   cargo run -p demo -- run --models 12 --config demo/network.toml
//!   cargo run -p demo -- tamper-check

mod mock_data;
mod network;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use warden_audit::{verify_chain, TamperEvidentLog};
use warden_contracts::{
    agent::AgentRole,
    error::{WardenError, WardenResult},
    task::TaskSpec,
};
use warden_core::RuntimeConfig;

use crate::network::Network;

/// Embedded default network, used when `--config` is not given.
const DEFAULT_NETWORK: &str = include_str!("../network.toml");

// ── CLI definition ────────────────────────────────────────────────────────────

/// WARDEN — multi-agent AI governance runtime demo.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "WARDEN governance network demo",
    long_about = "Runs a WARDEN agent network end to end: lifecycle, prioritized\n\
                  task scheduling with retries, pub/sub messaging, and hash-chained audit logs."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the network and scan models from the mock inventory.
    Run {
        /// Runtime configuration file (TOML). Defaults to the bundled network.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of models to scan.
        #[arg(long, default_value_t = 6)]
        models: usize,
    },
    /// Build an audit trail, tamper with it, and show what verification reports.
    TamperCheck {
        /// Entries to write before tampering.
        #[arg(long, default_value_t = 5)]
        entries: usize,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Set RUST_LOG=debug for dispatch-level detail.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    print_banner();

    let result = match cli.command {
        Command::Run { config, models } => run_network(config, models).await,
        Command::TamperCheck { entries } => tamper_check(entries),
    };

    match result {
        Ok(()) => println!("Demo completed successfully."),
        Err(e) => {
            eprintln!("Demo error: {}", e);
            std::process::exit(1);
        }
    }
}

// ── run ───────────────────────────────────────────────────────────────────────

async fn run_network(config_path: Option<PathBuf>, models: usize) -> WardenResult<()> {
    let config = match config_path {
        Some(path) => RuntimeConfig::from_file(&path)?,
        None => RuntimeConfig::from_toml_str(DEFAULT_NETWORK)?,
    };

    println!("=== Governance network ===");
    println!();

    let network = Network::launch(&config).await?;
    for agent in &network.agents {
        println!(
            "  {:<14} {:<8} key {}…",
            agent.agent_id(),
            agent.current_state(),
            &agent.identity().public_key_hex()[..16]
        );
    }
    println!();

    let scout = network.agent(AgentRole::Scout)?;
    for model in mock_data::inventory(models) {
        scout.submit_task(
            TaskSpec::new("scan:model").with_payload(json!({ "model_id": model.model_id })),
        )?;
    }
    println!("  Submitted {} scan task(s) to {}", models, scout.agent_id());

    if !network.settle(Duration::from_secs(30)).await {
        println!("  [WARN] network did not go idle within 30s");
    }
    println!();

    println!("  Scheduler stats:");
    for agent in &network.agents {
        let stats = agent.stats();
        println!(
            "    {:<14} submitted {:>3}  ok {:>3}  failed {:>3}  retried {:>3}  peak {}/{}",
            agent.agent_id(),
            stats.submitted,
            stats.succeeded,
            stats.failed,
            stats.retried,
            stats.peak_in_flight,
            stats.max_concurrent,
        );
    }
    println!();

    let blocked = network.enforcer.blocked();
    println!("  Models blocked: {}", if blocked.is_empty() { "none".to_string() } else { blocked.join(", ") });

    let bus_stats = network.bus.stats();
    println!(
        "  Bus: {} published, {} delivered, {} dropped",
        bus_stats.published, bus_stats.delivered, bus_stats.dropped
    );
    println!();

    network.shutdown().await?;

    println!("  Audit chains:");
    for agent in &network.agents {
        let log = agent.audit_log();
        print_verification(agent.agent_id().as_str(), log)?;
    }
    print_verification("compliance", &network.compliance)?;
    println!();
    Ok(())
}

fn print_verification(name: &str, log: &TamperEvidentLog) -> WardenResult<()> {
    let report = log.verify();
    println!(
        "    {:<14} {:>3} entries  tip {}…  {}",
        name,
        log.length(),
        &log.last_hash()[..16],
        if report.valid { "VALID" } else { "BROKEN" }
    );
    report.into_result()
}

// ── tamper-check ──────────────────────────────────────────────────────────────

fn tamper_check(entries: usize) -> WardenResult<()> {
    println!("=== Tamper detection ===");
    println!();

    if entries < 2 {
        return Err(WardenError::ConfigError {
            reason: "tamper-check needs at least 2 entries".to_string(),
        });
    }

    let log = TamperEvidentLog::new("auditor-demo");
    for i in 0..entries {
        log.append("finding.recorded", json!({ "index": i, "risk": 0.1 * i as f64 }))?;
    }
    let trail = log.export();
    println!("  Wrote {} entries, terminal hash {}", trail.entries.len(), trail.terminal_hash);
    println!("  Untampered: valid = {}", verify_chain(&trail.entries).valid);

    let target = entries / 2;
    let mut forged = trail.entries.clone();
    forged[target].data = json!({ "index": target, "risk": 0.0 });
    println!("  Rewrote the data of entry {}", target);

    let report = verify_chain(&forged);
    println!("  Tampered:   valid = {}", report.valid);
    println!("  Divergent indices: {:?}", report.divergent_indices);
    for error in &report.errors {
        println!("    - {}", error);
    }
    println!();

    match report.into_result() {
        Err(WardenError::ChainIntegrityViolation { indices }) if indices == vec![target as u64] => Ok(()),
        other => Err(WardenError::AuditWriteFailed {
            reason: format!("tampering was not located as expected: {:?}", other),
        }),
    }
}

// ── Banner ────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("WARDEN — Multi-agent AI Governance Runtime");
    println!("==========================================");
    println!();
    println!("Per agent:");
    println!("  [1] Lifecycle: uninitialized → ready → running ⇄ paused → terminated");
    println!("  [2] Scheduler: priority queue, bounded concurrency, bounded retries");
    println!("  [3] Bus: topic pub/sub, broadcast or addressed, delivered on a tick");
    println!("  [4] Audit: every action appended to a SHA-256 hash chain");
    println!();
}
